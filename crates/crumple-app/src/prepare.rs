use std::io::Cursor;
use async_trait::async_trait;
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};
use log::debug;
use crumple_core::image_data::{decode_base64, encode_base64, strip_data_uri, to_data_uri, DEFAULT_MIME};
use crumple_core::{ErrorKind, TransformError};

/// Converts a caller-supplied image (data URI or bare base64) into the bare
/// base64 payload sent to the service
#[async_trait]
pub trait ImagePreparer: Send + Sync {
    async fn prepare(&self, image: &str) -> Result<String, TransformError>;
}

/// Strips the data-URI prefix and checks the payload decodes
#[derive(Debug, Clone, Copy, Default)]
pub struct DataUriPreparer;

#[async_trait]
impl ImagePreparer for DataUriPreparer {
    async fn prepare(&self, image: &str) -> Result<String, TransformError> {
        let payload = strip_data_uri(image);
        decode_base64(payload).map_err(invalid_image)?;
        Ok(payload.trim().to_string())
    }
}

/// Downscales images larger than `max_dimension` on either side and
/// re-encodes them as PNG. Decoding runs on the blocking pool.
#[derive(Debug, Clone, Copy)]
pub struct ResizingPreparer {
    pub max_dimension: u32,
}

impl ResizingPreparer {
    pub fn new(max_dimension: u32) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
        }
    }
}

#[async_trait]
impl ImagePreparer for ResizingPreparer {
    async fn prepare(&self, image: &str) -> Result<String, TransformError> {
        let payload = strip_data_uri(image).trim().to_string();
        let max_dimension = self.max_dimension;

        tokio::task::spawn_blocking(move || fit_within(payload, max_dimension))
            .await
            .map_err(|e| TransformError::new(ErrorKind::UnknownError, format!("image preparation panicked: {e}")))?
    }
}

fn fit_within(payload: String, max_dimension: u32) -> Result<String, TransformError> {
    let bytes = decode_base64(&payload).map_err(invalid_image)?;
    let img = image::load_from_memory(&bytes).map_err(invalid_image)?;

    let (width, height) = img.dimensions();
    if width <= max_dimension && height <= max_dimension {
        return Ok(payload);
    }

    let resized = img.resize(max_dimension, max_dimension, FilterType::Triangle);
    debug!(
        "Resized source image {}x{} -> {}x{}",
        width,
        height,
        resized.width(),
        resized.height()
    );

    let mut out = Cursor::new(Vec::new());
    resized
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| TransformError::new(ErrorKind::UnknownError, format!("failed to encode image: {e}")))?;
    Ok(encode_base64(out.get_ref()))
}

/// Turn the service's bare base64 into a data URI, sniffing the format
pub fn materialize(payload: &str) -> Result<String, TransformError> {
    let payload = payload.trim();
    let bytes = decode_base64(payload).map_err(|e| {
        TransformError::new(ErrorKind::UnknownError, format!("service returned invalid base64: {e}"))
    })?;
    if bytes.is_empty() {
        return Err(TransformError::new(ErrorKind::UnknownError, "service returned an empty image"));
    }

    let mime = image::guess_format(&bytes).map_or(DEFAULT_MIME, |format| format.to_mime_type());
    Ok(to_data_uri(mime, payload))
}

fn invalid_image(e: impl std::fmt::Display) -> TransformError {
    TransformError::new(ErrorKind::InvalidRequest, format!("source image is not decodable: {e}"))
}
