use std::time::Duration;
use serde::{Deserialize, Serialize};

pub const PREPARING_PROGRESS: u8 = 10;
pub const UPLOAD_PROGRESS: u8 = 40;
pub const PROCESSING_PROGRESS: u8 = 50;
/// Retries nudge progress upward but never past this
pub const PROCESSING_PROGRESS_CAP: u8 = 75;
pub const DOWNLOADING_PROGRESS: u8 = 80;
pub const COMPLETE_PROGRESS: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformPhase {
    #[default]
    Idle,
    Preparing,
    Uploading,
    Processing,
    Downloading,
    Completed,
    Error,
    Cancelled,
}

impl TransformPhase {
    pub fn label(&self) -> &str {
        match self {
            Self::Idle => "Idle",
            Self::Preparing => "Preparing image",
            Self::Uploading => "Uploading",
            Self::Processing => "Processing",
            Self::Downloading => "Downloading result",
            Self::Completed => "Completed",
            Self::Error => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Progress shown while processing attempt `attempt` (1-based) runs
pub fn processing_progress(attempt: u32) -> u8 {
    let nudged = u32::from(PROCESSING_PROGRESS) + attempt.saturating_sub(1).saturating_mul(10);
    nudged.min(u32::from(PROCESSING_PROGRESS_CAP)) as u8
}

/// Linear projection `(100 - p) / (p / elapsed)`.
///
/// A heuristic: phases do not advance at a constant rate, so this is only a
/// rough hint. `None` until some progress exists.
pub fn estimate_remaining(progress: u8, elapsed: Duration) -> Option<Duration> {
    if progress == 0 {
        return None;
    }
    if progress >= COMPLETE_PROGRESS {
        return Some(Duration::ZERO);
    }
    let rate = f64::from(progress) / elapsed.as_secs_f64();
    if !rate.is_finite() || rate <= 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(f64::from(COMPLETE_PROGRESS - progress) / rate))
}
