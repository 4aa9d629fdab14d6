use std::env;
use std::str::FromStr;
use std::time::Duration;
use chrono::TimeDelta;
use log::info;
use crumple_core::cache::DEFAULT_CACHE_CAPACITY;
use crumple_core::result::DEFAULT_HISTORY_CAP;
use crumple_core::retry::RetryPolicy;
use crumple_core::{TransformPreset, TransformProfiles, TransformType};
use crate::error::ConfigError;

pub const DEFAULT_MODEL: &str = "stable-diffusion-img2img";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_DIMENSION: u32 = 1024;

/// Remote service settings consumed by the HTTP client
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub retry: RetryPolicy,
    pub cache_capacity: usize,
    pub cache_ttl: TimeDelta,
    pub history_cap: usize,
    pub max_dimension: u32,
    pub profiles: TransformProfiles,
}

impl AppConfig {
    /// Read `.env` if present, then the process environment
    pub fn load() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e.into()),
        }

        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup: &lookup };

        let api_url = vars.get("CRUMPLE_API_URL").ok_or(ConfigError::Missing("CRUMPLE_API_URL"))?;
        let defaults = RetryPolicy::default();

        let service = ServiceConfig {
            api_url,
            api_key: vars.get("CRUMPLE_API_KEY"),
            model: vars.get("CRUMPLE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout: vars
                .parse::<u64>("CRUMPLE_TIMEOUT_SECS")?
                .map_or(DEFAULT_TIMEOUT, Duration::from_secs),
        };

        let retry = RetryPolicy::new(
            vars.parse("CRUMPLE_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            vars.parse::<u64>("CRUMPLE_RETRY_BASE_MS")?
                .map_or(defaults.base_delay, Duration::from_millis),
            vars.parse::<u64>("CRUMPLE_RETRY_CAP_MS")?
                .map_or(defaults.max_delay, Duration::from_millis),
        );

        let cache_ttl = match vars.parse::<i64>("CRUMPLE_CACHE_TTL_SECS")? {
            Some(secs) if secs > 0 => TimeDelta::seconds(secs),
            Some(secs) => {
                return Err(ConfigError::Invalid {
                    var: "CRUMPLE_CACHE_TTL_SECS".into(),
                    value: secs.to_string(),
                });
            }
            None => crumple_core::cache::default_ttl(),
        };

        let mut profiles = TransformProfiles::new();
        for transform_type in TransformType::builtins().into_iter().chain(vars.named_profiles()) {
            let preset = vars.preset(&transform_type)?;
            profiles.set(&transform_type, preset);
        }

        Ok(Self {
            service,
            retry,
            cache_capacity: vars.parse("CRUMPLE_CACHE_CAPACITY")?.unwrap_or(DEFAULT_CACHE_CAPACITY),
            cache_ttl,
            history_cap: vars.parse("CRUMPLE_HISTORY_CAP")?.unwrap_or(DEFAULT_HISTORY_CAP),
            max_dimension: vars.parse("CRUMPLE_MAX_DIMENSION")?.unwrap_or(DEFAULT_MAX_DIMENSION),
            profiles,
        })
    }
}

struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, var: &str) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.get(var) else {
            return Ok(None);
        };
        value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var: var.to_string(), value })
    }

    /// Extra profiles listed in `CRUMPLE_PROFILES`, comma separated
    fn named_profiles(&self) -> Vec<TransformType> {
        let Some(list) = self.get("CRUMPLE_PROFILES") else {
            return Vec::new();
        };
        list.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| TransformType::from_str(name).unwrap_or_else(|never| match never {}))
            .filter(|transform_type| matches!(transform_type, TransformType::Named(_)))
            .collect()
    }

    /// Preset with `CRUMPLE_<TYPE>_*` overrides applied. Named profiles start
    /// from the light preset.
    fn preset(&self, transform_type: &TransformType) -> Result<TransformPreset, ConfigError> {
        let base = match transform_type {
            TransformType::Heavy => TransformPreset::heavy(),
            _ => TransformPreset::light(),
        };
        let prefix = format!("CRUMPLE_{}", env_segment(transform_type.id()));

        Ok(TransformPreset {
            prompt: self.get(&format!("{prefix}_PROMPT")).unwrap_or(base.prompt),
            strength: self.parse(&format!("{prefix}_STRENGTH"))?.unwrap_or(base.strength),
            steps: self.parse(&format!("{prefix}_STEPS"))?.unwrap_or(base.steps),
            guidance_scale: self.parse(&format!("{prefix}_GUIDANCE"))?.unwrap_or(base.guidance_scale),
        })
    }
}

/// `sepia-tone` -> `SEPIA_TONE`
fn env_segment(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}
