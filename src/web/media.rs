use std::cell::Cell;
use std::rc::Rc;

use edge_pixels::Frame;
use serde::Serialize;
use thiserror::Error;

use crate::camera::synthetic::{test_pattern, ChromaLayout};
use crate::camera::types::{FacingPreference, Size};

/// Reasons a media request is rejected. Each variant carries the message
/// shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("No camera was found on this device.")]
    NotFound,

    #[error("Camera access was blocked. Allow camera access for this page and reload.")]
    NotAllowed,

    #[error("The camera is in use by another application.")]
    NotReadable,

    #[error("Could not start the camera: {0}")]
    Other(String),
}

impl MediaError {
    /// Map a DOM exception name as reported by `getUserMedia` rejections.
    pub fn from_dom_exception(name: &str, message: &str) -> Self {
        match name {
            "NotFoundError" | "OverconstrainedError" => Self::NotFound,
            "NotAllowedError" | "SecurityError" => Self::NotAllowed,
            "NotReadableError" | "AbortError" => Self::NotReadable,
            _ => Self::Other(message.to_string()),
        }
    }
}

/// Video constraints passed to [`MediaDevices::get_user_media`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConstraints {
    pub facing: FacingPreference,
    pub ideal_size: Size,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            facing: FacingPreference::Back,
            ideal_size: Size::HD,
        }
    }
}

impl MediaConstraints {
    /// `facingMode` value for the browser request, if the preference has one.
    pub fn facing_mode(&self) -> Option<&'static str> {
        match self.facing {
            FacingPreference::Back => Some("environment"),
            FacingPreference::Front => Some("user"),
            FacingPreference::External | FacingPreference::Device(_) => None,
        }
    }
}

/// A live camera track.
pub trait VideoTrack {
    /// Size the track actually delivers.
    fn settings(&self) -> Size;

    /// The frame currently shown by the track, as RGBA.
    fn grab_frame(&mut self) -> Option<Frame>;

    fn stop(&mut self);

    /// False once stopped or ended by the device.
    fn is_live(&self) -> bool;
}

/// Entry point for camera access in the page.
pub trait MediaDevices {
    fn get_user_media(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<Box<dyn VideoTrack>, MediaError>;
}

/// In-page media devices backed by the test-pattern sensor.
#[derive(Debug, Default)]
pub struct SyntheticMediaDevices {
    rejection: Option<MediaError>,
    end_after: Option<u64>,
    live_tracks: Rc<Cell<usize>>,
}

impl SyntheticMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every request with `error`.
    pub fn rejecting(error: MediaError) -> Self {
        Self {
            rejection: Some(error),
            ..Self::default()
        }
    }

    /// Tracks end by themselves after delivering `frames` frames.
    pub fn ending_after(mut self, frames: u64) -> Self {
        self.end_after = Some(frames);
        self
    }

    /// Tracks handed out and not yet stopped or ended.
    pub fn live_tracks(&self) -> usize {
        self.live_tracks.get()
    }
}

impl MediaDevices for SyntheticMediaDevices {
    fn get_user_media(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<Box<dyn VideoTrack>, MediaError> {
        if let Some(error) = &self.rejection {
            return Err(error.clone());
        }
        let size = constraints.ideal_size;
        if size.width == 0 || size.height == 0 {
            return Err(MediaError::Other(format!("unsupported size {size}")));
        }
        self.live_tracks.set(self.live_tracks.get() + 1);
        Ok(Box::new(SyntheticTrack {
            size,
            index: 0,
            end_after: self.end_after,
            live: true,
            live_tracks: Rc::clone(&self.live_tracks),
        }))
    }
}

struct SyntheticTrack {
    size: Size,
    index: u64,
    end_after: Option<u64>,
    live: bool,
    live_tracks: Rc<Cell<usize>>,
}

impl SyntheticTrack {
    fn end(&mut self) {
        if self.live {
            self.live = false;
            self.live_tracks.set(self.live_tracks.get().saturating_sub(1));
        }
    }
}

impl VideoTrack for SyntheticTrack {
    fn settings(&self) -> Size {
        self.size
    }

    fn grab_frame(&mut self) -> Option<Frame> {
        if !self.live {
            return None;
        }
        if self.end_after.is_some_and(|limit| self.index >= limit) {
            self.end();
            return None;
        }
        let frame = test_pattern(self.size, self.index, ChromaLayout::I420, 0)
            .and_then(edge_pixels::to_rgba);
        self.index += 1;
        match frame {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!("synthetic track produced a bad frame: {e}");
                None
            }
        }
    }

    fn stop(&mut self) {
        self.end();
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

impl Drop for SyntheticTrack {
    fn drop(&mut self) {
        self.end();
    }
}
