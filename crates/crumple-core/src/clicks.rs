use crate::transform_types::TransformType;

/// Counts clicks on the photo and reports when a damage threshold is crossed
#[derive(Debug, Clone)]
pub struct ClickTracker {
    /// Ascending by click count
    thresholds: Vec<(u32, TransformType)>,
    clicks: u32,
    next: usize,
}

impl ClickTracker {
    pub fn new(mut thresholds: Vec<(u32, TransformType)>) -> Self {
        thresholds.sort_by_key(|(clicks, _)| *clicks);
        Self {
            thresholds,
            clicks: 0,
            next: 0,
        }
    }

    /// Record one click; returns the transform to fire if this click crossed
    /// a threshold
    pub fn register_click(&mut self) -> Option<TransformType> {
        self.clicks = self.clicks.saturating_add(1);
        let (at, transform_type) = self.thresholds.get(self.next)?;
        if self.clicks < *at {
            return None;
        }
        self.next += 1;
        Some(transform_type.clone())
    }

    pub fn clicks(&self) -> u32 {
        self.clicks
    }

    /// Clicks left before the next threshold, `None` once all are crossed
    pub fn remaining(&self) -> Option<u32> {
        self.thresholds
            .get(self.next)
            .map(|(at, _)| at.saturating_sub(self.clicks))
    }

    pub fn reset(&mut self) {
        self.clicks = 0;
        self.next = 0;
    }
}

impl Default for ClickTracker {
    fn default() -> Self {
        Self::new(vec![
            (10, TransformType::Light),
            (25, TransformType::Heavy),
            (50, TransformType::Heavy),
        ])
    }
}
