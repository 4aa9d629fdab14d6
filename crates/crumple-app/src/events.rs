use std::time::Duration;
use crumple_core::{RequestKey, TransformError, TransformPhase, TransformResult, TransformType};

/// Observable lifecycle of one `transform` call.
///
/// Progress implicitly starts at 0 with [`TransformEvent::Started`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransformEvent {
    Started {
        key: RequestKey,
        transform_type: TransformType,
    },
    Progress {
        phase: TransformPhase,
        progress: u8,
        /// Linear projection, see `crumple_core::progress::estimate_remaining`
        eta: Option<Duration>,
    },
    CacheHit(RequestKey),
    /// Another caller is already running this exact request
    JoinedInFlight(RequestKey),
    AttemptFailed {
        attempt: u32,
        error: TransformError,
        /// `None` when no further attempt will be made
        retry_in: Option<Duration>,
    },
    Completed(TransformResult),
    Failed(TransformResult),
}

impl TransformEvent {
    pub fn progress(&self) -> Option<u8> {
        match self {
            Self::Progress { progress, .. } => Some(*progress),
            _ => None,
        }
    }
}
