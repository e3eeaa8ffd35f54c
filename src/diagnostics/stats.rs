use serde::Serialize;
use std::time::{Duration, Instant};

/// Collects diagnostic statistics for a capture session.
pub struct DiagnosticStats {
    frame_count: u64,
    drop_count: u64,
    fallback_count: u64,
    total_bytes: u64,
    start_time: Instant,
    latency: Duration,
    resolution: Option<(u32, u32)>,
}

/// Snapshot of diagnostic stats for logging and serialisation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticSnapshot {
    pub fps: f64,
    pub frame_count: u64,
    pub drop_count: u64,
    pub drop_rate: f64,
    pub processing_fallbacks: u64,
    pub latency_ms: f64,
    pub bandwidth_bps: u64,
    /// `"WxH"` of the most recent delivered frame.
    pub resolution: Option<String>,
}

impl DiagnosticStats {
    /// Create new stats with zeroed counters.
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            drop_count: 0,
            fallback_count: 0,
            total_bytes: 0,
            start_time: Instant::now(),
            latency: Duration::ZERO,
            resolution: None,
        }
    }

    /// Record a frame handed to the consumer. `captured_at` is the sensor
    /// timestamp, so latency covers conversion and processing.
    pub fn record_frame(&mut self, bytes: usize, dimensions: (u32, u32), captured_at: Instant) {
        let now = Instant::now();
        self.frame_count += 1;
        self.total_bytes += bytes as u64;
        self.latency = now.saturating_duration_since(captured_at);
        self.resolution = Some(dimensions);
    }

    /// Record a frame that never reached the consumer.
    pub fn record_drop(&mut self) {
        self.drop_count += 1;
    }

    /// Record `count` drops observed elsewhere, e.g. by a full inbound queue.
    pub fn record_drops(&mut self, count: u64) {
        self.drop_count += count;
    }

    /// Record a frame delivered unprocessed because native processing failed.
    pub fn record_fallback(&mut self) {
        self.fallback_count += 1;
    }

    /// Calculate current FPS based on elapsed time.
    pub fn fps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        self.frame_count as f64 / elapsed
    }

    /// Drop rate as a percentage (0.0 - 100.0).
    pub fn drop_rate(&self) -> f64 {
        let total = self.frame_count + self.drop_count;
        if total == 0 {
            return 0.0;
        }
        (self.drop_count as f64 / total as f64) * 100.0
    }

    /// Latest capture-to-delivery latency in milliseconds.
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }

    /// Bandwidth in bytes per second.
    pub fn bandwidth_bps(&self) -> u64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0;
        }
        (self.total_bytes as f64 / elapsed) as u64
    }

    /// Reset all counters.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Take a serialisable snapshot.
    pub fn snapshot(&self) -> DiagnosticSnapshot {
        DiagnosticSnapshot {
            fps: self.fps(),
            frame_count: self.frame_count,
            drop_count: self.drop_count,
            drop_rate: self.drop_rate(),
            processing_fallbacks: self.fallback_count,
            latency_ms: self.latency_ms(),
            bandwidth_bps: self.bandwidth_bps(),
            resolution: self.resolution.map(|(w, h)| format!("{w}x{h}")),
        }
    }
}

impl Default for DiagnosticStats {
    fn default() -> Self {
        Self::new()
    }
}
