use std::fmt;
use std::hash::Hasher;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use thiserror::Error;
use crate::transform_types::{TransformPreset, TransformProfiles, TransformType};

/// Caller overrides; anything left `None` falls back to the preset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformOptions {
    pub strength: Option<f32>,
    pub steps: Option<u32>,
    pub guidance_scale: Option<f32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub seed: Option<u64>,
    pub prompt: Option<String>,
}

/// Fully-resolved parameters sent to the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformParams {
    pub prompt: String,
    pub strength: f32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub seed: Option<u64>,
}

impl TransformParams {
    pub fn resolve(preset: &TransformPreset, options: &TransformOptions) -> Self {
        let prompt = options
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(&preset.prompt)
            .to_string();

        Self {
            prompt,
            strength: options.strength.unwrap_or(preset.strength).clamp(0.0, 1.0),
            steps: options.steps.unwrap_or(preset.steps).max(1),
            guidance_scale: options.guidance_scale.unwrap_or(preset.guidance_scale).max(0.0),
            width: options.width.filter(|w| *w > 0),
            height: options.height.filter(|h| *h > 0),
            seed: options.seed,
        }
    }

    /// Turn resolved params back into options that reproduce them exactly
    pub fn to_options(&self) -> TransformOptions {
        TransformOptions {
            strength: Some(self.strength),
            steps: Some(self.steps),
            guidance_scale: Some(self.guidance_scale),
            width: self.width,
            height: self.height,
            seed: self.seed,
            prompt: Some(self.prompt.clone()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("source image is empty")]
    EmptyImage,
    #[error("unknown transform type: {0}")]
    UnknownTransformType(String),
}

/// Immutable, fully-resolved transform request
#[derive(Debug, Clone, PartialEq)]
pub struct TransformRequest {
    pub image: String,
    pub transform_type: TransformType,
    pub params: TransformParams,
}

impl TransformRequest {
    pub fn resolve(
        image: impl Into<String>,
        transform_type: TransformType,
        options: &TransformOptions,
        profiles: &TransformProfiles,
    ) -> Result<Self, RequestError> {
        let image = image.into();
        if image.trim().is_empty() {
            return Err(RequestError::EmptyImage);
        }

        let preset = profiles
            .get(&transform_type)
            .ok_or_else(|| RequestError::UnknownTransformType(transform_type.id().to_string()))?;

        Ok(Self {
            params: TransformParams::resolve(preset, options),
            image,
            transform_type,
        })
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::derive(self)
    }
}

/// Deterministic identity of a [`TransformRequest`]
///
/// Two SipHash-1-3 digests with fixed keys: one over the image string exactly
/// as given, one over the transform type and resolved params. The image is not
/// canonicalized, so the same picture encoded with different whitespace or a
/// different data-URI prefix yields a different key. The hash is not
/// collision-resistant; it only has to be stable within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn derive(request: &TransformRequest) -> Self {
        let mut image = SipHasher13::new();
        image.write(request.image.as_bytes());

        let mut params = SipHasher13::new();
        let p = &request.params;
        write_str(&mut params, request.transform_type.id());
        write_str(&mut params, &p.prompt);
        params.write_u32(p.strength.to_bits());
        params.write_u32(p.steps);
        params.write_u32(p.guidance_scale.to_bits());
        write_opt(&mut params, p.width.map(u64::from));
        write_opt(&mut params, p.height.map(u64::from));
        write_opt(&mut params, p.seed);

        Self(format!("{:016x}-{:016x}", image.finish(), params.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Length prefix keeps ("ab", "c") and ("a", "bc") apart
fn write_str(hasher: &mut SipHasher13, s: &str) {
    hasher.write_u64(s.len() as u64);
    hasher.write(s.as_bytes());
}

fn write_opt(hasher: &mut SipHasher13, value: Option<u64>) {
    match value {
        Some(v) => {
            hasher.write_u8(1);
            hasher.write_u64(v);
        }
        None => hasher.write_u8(0),
    }
}
