use serde::{Deserialize, Serialize};
use std::time::Duration;

use edge_pixels::FilterMode;

use crate::camera::types::{FacingPreference, Size};
use crate::preview::capture::WatchdogConfig;
use crate::preview::process::ProcessMode;
use crate::preview::sink::PresentFormat;

/// Persisted preview configuration.
///
/// Every field has a default, so partial or older files still load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewSettings {
    /// Which camera to open.
    pub facing: FacingPreference,
    pub preferred_size: Size,
    pub grayscale: bool,
    pub edges: bool,
    /// Texel layout used for presentation.
    pub present_format: PresentFormat,
    /// Native processing to run on each frame; `None` disables it.
    pub process_mode: Option<ProcessMode>,
    /// Depth of the queue between the device callback and the capture loop.
    pub inbound_queue: usize,
    pub open_timeout_ms: u64,
    pub configure_timeout_ms: u64,
    pub frame_timeout_ms: u64,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        let watchdog = WatchdogConfig::default();
        Self {
            facing: FacingPreference::default(),
            preferred_size: Size::default(),
            grayscale: false,
            edges: false,
            present_format: PresentFormat::default(),
            process_mode: None,
            inbound_queue: 4,
            open_timeout_ms: watchdog.open_timeout.as_millis() as u64,
            configure_timeout_ms: watchdog.configure_timeout.as_millis() as u64,
            frame_timeout_ms: watchdog.frame_timeout.as_millis() as u64,
        }
    }
}

impl PreviewSettings {
    pub fn filter_mode(&self) -> FilterMode {
        FilterMode::from_toggles(self.grayscale, self.edges)
    }

    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            configure_timeout: Duration::from_millis(self.configure_timeout_ms),
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
            ..WatchdogConfig::default()
        }
    }
}
