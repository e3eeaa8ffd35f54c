//! Pixel-level building blocks shared by the edgeviewer capture and
//! presentation pipeline: the owned [`Frame`] type, planar YUV 4:2:0 to RGBA
//! conversion, and the grayscale / Sobel filter stage.

pub mod convert;
pub mod error;
pub mod filter;
pub mod frame;

pub use convert::{to_rgba, yuv420_to_rgba};
pub use error::{PixelError, Result};
pub use filter::FilterMode;
pub use frame::{Frame, PixelFormat, PlaneLayout, Yuv420Layout};
