use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::time::{Clock, Milliseconds};
use crate::{lock, log_debug};

/// Timing of one logical call, recorded once it settles.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub url: String,
    pub duration_ms: u64,
    /// HTTP status of the final attempt. `None` when no response was
    /// obtained (transport failure, timeout, abort).
    pub status: Option<u16>,
    /// Epoch milliseconds at which the call settled.
    pub timestamp: Milliseconds,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub count: usize,
    pub errors: usize,
    pub mean_ms: u64,
    pub max_ms: u64,
}

pub struct PerformanceMetrics {
    samples: Mutex<Vec<PerformanceSample>>,
    clock: Arc<dyn Clock>,
}

impl PerformanceMetrics {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        PerformanceMetrics {
            samples: Mutex::new(Vec::new()),
            clock,
        }
    }

    pub fn record(&self, url: &str, duration: Milliseconds, status: Option<u16>) {
        let sample = PerformanceSample {
            url: url.to_string(),
            duration_ms: *duration,
            status,
            timestamp: self.clock.now(),
        };
        log_debug!(
            "{} took {} ms with status {:?}",
            sample.url,
            sample.duration_ms,
            sample.status
        );
        lock(&self.samples).push(sample);
    }

    /// Samples for one URL, or every sample when `url` is `None`. Oldest
    /// first.
    pub fn samples(&self, url: Option<&str>) -> Vec<PerformanceSample> {
        let samples = lock(&self.samples);
        match url {
            Some(url) => samples.iter().filter(|s| s.url == url).cloned().collect(),
            None => samples.clone(),
        }
    }

    pub fn summary(&self, url: Option<&str>) -> MetricsSummary {
        let samples = self.samples(url);
        if samples.is_empty() {
            return MetricsSummary::default();
        }
        let total: u64 = samples.iter().map(|s| s.duration_ms).sum();
        MetricsSummary {
            count: samples.len(),
            errors: samples
                .iter()
                .filter(|s| s.status.map_or(true, |status| status >= 400))
                .count(),
            mean_ms: total / samples.len() as u64,
            max_ms: samples.iter().map(|s| s.duration_ms).max().unwrap_or(0),
        }
    }

    /// Drop samples older than `retention`. Returns how many were removed.
    pub fn purge_older_than(&self, retention: Milliseconds) -> usize {
        let cutoff = self.clock.now().saturating_sub(retention);
        let mut samples = lock(&self.samples);
        let before = samples.len();
        samples.retain(|sample| sample.timestamp >= cutoff);
        before - samples.len()
    }

    pub fn clear(&self) {
        lock(&self.samples).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.samples).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
