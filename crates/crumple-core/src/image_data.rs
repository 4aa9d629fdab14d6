//! Data-URI boundary helpers.
//!
//! The remote service speaks bare base64; callers hand in and get back data
//! URIs. The prefix is stripped before sending and re-added after receiving.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

pub const DEFAULT_MIME: &str = "image/png";

/// Split `data:<mime>;base64,<payload>` into `(mime, payload)`
pub fn split_data_uri(image: &str) -> Option<(&str, &str)> {
    let rest = image.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    Some((mime, payload))
}

/// Bare base64 payload; strings without a data-URI prefix pass through
pub fn strip_data_uri(image: &str) -> &str {
    split_data_uri(image).map_or(image, |(_, payload)| payload)
}

pub fn to_data_uri(mime: &str, payload: &str) -> String {
    format!("data:{mime};base64,{payload}")
}

pub fn decode_base64(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(payload.trim())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
