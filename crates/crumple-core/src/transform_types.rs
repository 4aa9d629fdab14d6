use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// Named intent selecting which remote-service parameters to apply
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformType {
    Light,
    Heavy,
    Named(String),
}

impl TransformType {
    /// Identifier used for profiles, keys and logs
    pub fn id(&self) -> &str {
        match self {
            Self::Light => "light",
            Self::Heavy => "heavy",
            Self::Named(name) => name,
        }
    }

    /// Human-readable description
    pub fn description(&self) -> &str {
        match self {
            Self::Light => "Light wear - scratches, slight fading",
            Self::Heavy => "Heavy damage - tears, burns, water stains",
            Self::Named(_) => "Custom transform profile",
        }
    }

    pub fn builtins() -> [TransformType; 2] {
        [Self::Light, Self::Heavy]
    }
}

impl Default for TransformType {
    fn default() -> Self {
        Self::Light
    }
}

impl fmt::Display for TransformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for TransformType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Ok(match trimmed.to_ascii_lowercase().as_str() {
            "light" => Self::Light,
            "heavy" => Self::Heavy,
            _ => Self::Named(trimmed.to_string()),
        })
    }
}

/// Default remote parameters for one transform type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformPreset {
    pub prompt: String,
    pub strength: f32,
    pub steps: u32,
    pub guidance_scale: f32,
}

impl TransformPreset {
    pub fn light() -> Self {
        Self {
            prompt: "old worn photograph, light scratches, faded colors, dust specks, slightly creased".into(),
            strength: 0.35,
            steps: 20,
            guidance_scale: 7.0,
        }
    }

    pub fn heavy() -> Self {
        Self {
            prompt: "badly damaged photograph, torn edges, burn marks, water stains, deep cracks, heavy grain".into(),
            strength: 0.65,
            steps: 30,
            guidance_scale: 8.5,
        }
    }
}

/// Preset table keyed by [`TransformType::id`]
///
/// Light and heavy are always present; named variants have to be registered
/// before a request can be resolved against them.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformProfiles {
    presets: HashMap<String, TransformPreset>,
}

impl TransformProfiles {
    pub fn new() -> Self {
        let mut presets = HashMap::new();
        presets.insert(TransformType::Light.id().to_string(), TransformPreset::light());
        presets.insert(TransformType::Heavy.id().to_string(), TransformPreset::heavy());
        Self { presets }
    }

    /// Register or replace the preset for a transform type
    pub fn set(&mut self, transform_type: &TransformType, preset: TransformPreset) {
        self.presets.insert(transform_type.id().to_string(), preset);
    }

    pub fn get(&self, transform_type: &TransformType) -> Option<&TransformPreset> {
        self.presets.get(transform_type.id())
    }

    pub fn contains(&self, transform_type: &TransformType) -> bool {
        self.presets.contains_key(transform_type.id())
    }
}

impl Default for TransformProfiles {
    fn default() -> Self {
        Self::new()
    }
}
