//! Boundary to the native image-processing library.
//!
//! The library takes one RGBA frame and returns a processed RGBA buffer of
//! the same dimensions. When it is missing or fails, the pipeline shows the
//! unprocessed frame instead.

use edge_pixels::Frame;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Which operation the native library should run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    #[default]
    Grayscale,
    Canny,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("native processing unavailable: {0}")]
    Unavailable(String),

    #[error("processor returned {actual} bytes for a {width}x{height} frame")]
    BadOutput { width: u32, height: u32, actual: usize },
}

/// Native per-frame processing.
///
/// Called on the capture thread with a tightly packed RGBA buffer; must
/// return a buffer of exactly `width * height * 4` bytes.
pub trait FrameProcessor: Send + Sync {
    fn process(
        &self,
        rgba: &[u8],
        width: u32,
        height: u32,
        mode: ProcessMode,
    ) -> Result<Vec<u8>, ProcessingError>;
}

/// Stand-in used when no native library is linked.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableProcessor;

impl FrameProcessor for UnavailableProcessor {
    fn process(
        &self,
        _: &[u8],
        _: u32,
        _: u32,
        _: ProcessMode,
    ) -> Result<Vec<u8>, ProcessingError> {
        Err(ProcessingError::Unavailable(
            "no native processing library loaded".to_string(),
        ))
    }
}

/// Result of [`process_or_passthrough`].
pub struct Processed {
    pub frame: Frame,
    /// The processor failed and `frame` is the unprocessed input.
    pub fell_back: bool,
}

/// Run `processor` over `frame`, falling back to `frame` itself on failure.
pub fn process_or_passthrough(
    processor: &dyn FrameProcessor,
    frame: Frame,
    mode: ProcessMode,
) -> Processed {
    let (width, height) = frame.dimensions();
    let processed = processor
        .process(frame.data(), width, height, mode)
        .and_then(|bytes| {
            let actual = bytes.len();
            Frame::rgba(width, height, bytes, frame.timestamp()).map_err(|_| {
                ProcessingError::BadOutput {
                    width,
                    height,
                    actual,
                }
            })
        });
    match processed {
        Ok(out) => Processed {
            frame: out,
            fell_back: false,
        },
        Err(e) => {
            trace!("processing fell back to the unprocessed frame: {e}");
            Processed {
                frame,
                fell_back: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct Invert;

    impl FrameProcessor for Invert {
        fn process(
            &self,
            rgba: &[u8],
            _: u32,
            _: u32,
            _: ProcessMode,
        ) -> Result<Vec<u8>, ProcessingError> {
            Ok(rgba
                .chunks_exact(4)
                .flat_map(|px| [255 - px[0], 255 - px[1], 255 - px[2], px[3]])
                .collect())
        }
    }

    struct Truncating;

    impl FrameProcessor for Truncating {
        fn process(
            &self,
            rgba: &[u8],
            _: u32,
            _: u32,
            _: ProcessMode,
        ) -> Result<Vec<u8>, ProcessingError> {
            Ok(rgba[..rgba.len() / 2].to_vec())
        }
    }

    fn frame() -> Frame {
        Frame::rgba(2, 1, vec![10, 20, 30, 255, 40, 50, 60, 255], Instant::now()).unwrap()
    }

    #[test]
    fn successful_processing_replaces_frame() {
        let out = process_or_passthrough(&Invert, frame(), ProcessMode::Canny);
        assert_eq!(out.frame.data(), &[245, 235, 225, 255, 215, 205, 195, 255]);
        assert!(!out.fell_back);
    }

    #[test]
    fn unavailable_library_presents_unprocessed_frame() {
        let input = frame();
        let expected = input.data().to_vec();
        let out = process_or_passthrough(&UnavailableProcessor, input, ProcessMode::Grayscale);
        assert_eq!(out.frame.data(), expected.as_slice());
        assert!(out.fell_back);
    }

    #[test]
    fn wrong_sized_output_is_treated_as_failure() {
        let out = process_or_passthrough(&Truncating, frame(), ProcessMode::Grayscale);
        assert_eq!(out.frame.data().len(), 8);
        assert!(out.fell_back);
    }

    #[test]
    fn process_mode_serialises_snake_case() {
        assert_eq!(serde_json::to_value(ProcessMode::Canny).unwrap(), "canny");
    }
}
