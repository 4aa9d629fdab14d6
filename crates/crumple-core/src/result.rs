use std::collections::VecDeque;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::TransformError;
use crate::progress::{estimate_remaining, TransformPhase};
use crate::request::{RequestKey, TransformParams, TransformRequest};
use crate::transform_types::TransformType;

pub const DEFAULT_HISTORY_CAP: usize = 20;

/// Outcome of one orchestrated transform. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformResult {
    pub success: bool,
    /// Data URI of the transformed image
    pub transformed_image: Option<String>,
    pub original_image: String,
    pub transform_type: TransformType,
    pub params: TransformParams,
    pub request_key: RequestKey,
    /// Remote attempts this operation made; zero for cache hits
    pub attempts: u32,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
    pub error: Option<TransformError>,
}

impl TransformResult {
    pub fn succeeded(
        request: &TransformRequest,
        request_key: RequestKey,
        transformed_image: String,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: true,
            transformed_image: Some(transformed_image),
            original_image: request.image.clone(),
            transform_type: request.transform_type.clone(),
            params: request.params.clone(),
            request_key,
            attempts,
            processing_time_ms: duration_ms(elapsed),
            completed_at: Utc::now(),
            error: None,
        }
    }

    pub fn failed(
        request: &TransformRequest,
        request_key: RequestKey,
        error: TransformError,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: false,
            transformed_image: None,
            original_image: request.image.clone(),
            transform_type: request.transform_type.clone(),
            params: request.params.clone(),
            request_key,
            attempts,
            processing_time_ms: duration_ms(elapsed),
            completed_at: Utc::now(),
            error: Some(error),
        }
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Append-only list that keeps the most recent `cap` results
#[derive(Debug, Clone, PartialEq)]
pub struct TransformHistory {
    entries: VecDeque<TransformResult>,
    cap: usize,
}

impl TransformHistory {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            entries: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, result: TransformResult) {
        while self.entries.len() >= self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(result);
    }

    pub fn last(&self) -> Option<&TransformResult> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransformResult> {
        self.entries.iter()
    }

    /// Oldest first
    pub fn to_vec(&self) -> Vec<TransformResult> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

impl Default for TransformHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

/// Orchestrator state. Handed out only as a snapshot clone.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformState {
    pub is_transforming: bool,
    pub phase: TransformPhase,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub last_transform_time: Option<DateTime<Utc>>,
    pub history: TransformHistory,
    /// Failed attempts of the operation in progress
    pub failed_attempts: u32,
}

impl TransformState {
    pub fn with_history_cap(cap: usize) -> Self {
        Self {
            history: TransformHistory::new(cap),
            ..Default::default()
        }
    }

    /// See [`estimate_remaining`]; only meaningful while transforming
    pub fn estimated_time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_transforming {
            return None;
        }
        let elapsed = (now - self.started_at?).to_std().ok()?;
        estimate_remaining(self.progress, elapsed)
    }
}
