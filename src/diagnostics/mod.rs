// Capture counters: frame rate, drops, latency.

pub mod stats;
