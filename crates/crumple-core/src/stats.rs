use chrono::{DateTime, Utc};
use serde::Serialize;
use crate::result::TransformResult;

/// Summary derived from transform history; holds no state of its own
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TransformStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// 0.0 when there is no history
    pub success_rate: f64,
    /// Average over successful transforms only
    pub average_processing_ms: Option<f64>,
    pub last_transform_at: Option<DateTime<Utc>>,
}

impl TransformStats {
    pub fn from_history<'a>(history: impl IntoIterator<Item = &'a TransformResult>) -> Self {
        let mut stats = Self::default();
        let mut success_ms: u128 = 0;

        for result in history {
            stats.total += 1;
            if result.success {
                stats.successful += 1;
                success_ms += u128::from(result.processing_time_ms);
            } else {
                stats.failed += 1;
            }
            stats.last_transform_at = stats.last_transform_at.max(Some(result.completed_at));
        }

        if stats.total > 0 {
            stats.success_rate = stats.successful as f64 / stats.total as f64;
        }
        if stats.successful > 0 {
            stats.average_processing_ms = Some(success_ms as f64 / stats.successful as f64);
        }
        stats
    }
}
