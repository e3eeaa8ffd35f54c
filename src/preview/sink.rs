use edge_pixels::{Frame, PixelFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Presentation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresentError {
    /// The display surface went away; presentation pauses until a new one
    /// is attached.
    #[error("display surface lost")]
    SurfaceLost,

    #[error("no render target allocated")]
    NoTarget,

    #[error("cannot present {0} frames")]
    UnsupportedFormat(&'static str),

    #[error("frame is {frame_width}x{frame_height} but target is {target_width}x{target_height}")]
    SizeMismatch {
        frame_width: u32,
        frame_height: u32,
        target_width: u32,
        target_height: u32,
    },

    #[error("graphics backend error: {0}")]
    Backend(String),
}

/// Texel layout of a render target.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentFormat {
    /// Four-channel colour texture.
    #[default]
    Rgba,
    /// Single-channel texture broadcast to grey when drawn.
    Luma,
}

impl PresentFormat {
    pub fn of(format: PixelFormat) -> Result<Self, PresentError> {
        match format {
            PixelFormat::Rgba8 => Ok(Self::Rgba),
            PixelFormat::Luma8 => Ok(Self::Luma),
            other => Err(PresentError::UnsupportedFormat(other.name())),
        }
    }
}

/// Allocation state of a sink's render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Uninitialized,
    Ready {
        width: u32,
        height: u32,
        format: PresentFormat,
    },
}

impl TargetState {
    /// Whether a frame of this shape can be uploaded without reallocating.
    pub fn fits(&self, width: u32, height: u32, format: PresentFormat) -> bool {
        *self
            == Self::Ready {
                width,
                height,
                format,
            }
    }

    /// Check `frame` against the allocated target.
    pub fn check(&self, frame: &Frame) -> Result<PresentFormat, PresentError> {
        let format = PresentFormat::of(frame.format())?;
        match *self {
            Self::Uninitialized => Err(PresentError::NoTarget),
            Self::Ready { width, height, .. }
                if !self.fits(frame.width(), frame.height(), format) =>
            {
                Err(PresentError::SizeMismatch {
                    frame_width: frame.width(),
                    frame_height: frame.height(),
                    target_width: width,
                    target_height: height,
                })
            }
            Self::Ready { .. } => Ok(format),
        }
    }
}

/// Destination for presented frames: a GPU texture or a raster canvas.
///
/// A sink is driven from a single thread. The presenter calls
/// [`ensure_target`](FrameSink::ensure_target) before every
/// [`upload`](FrameSink::upload) so a dimension or format change always
/// reallocates first, then [`draw`](FrameSink::draw) to put the uploaded
/// content on screen.
pub trait FrameSink {
    /// Host-provided display surface.
    type Surface;

    /// Bind to a new display surface of `width` x `height` pixels.
    fn attach(
        &mut self,
        surface: Self::Surface,
        width: u32,
        height: u32,
    ) -> Result<(), PresentError>;

    /// The surface changed size.
    fn resize(&mut self, width: u32, height: u32);

    /// Drop the current surface. The render target may survive.
    fn detach(&mut self);

    fn is_attached(&self) -> bool;

    /// Make sure the render target matches the frame about to be uploaded,
    /// reallocating it when dimensions or format differ.
    fn ensure_target(
        &mut self,
        width: u32,
        height: u32,
        format: PresentFormat,
    ) -> Result<(), PresentError>;

    /// Copy a frame's pixels into the render target.
    fn upload(&mut self, frame: &Frame) -> Result<(), PresentError>;

    /// Render the target to the attached surface.
    fn draw(&mut self) -> Result<(), PresentError>;

    fn target(&self) -> TargetState;
}
