//! Presentation through a 2D raster canvas: the filtered RGBA buffer is
//! written straight to the visible surface, no texture involved.

use edge_pixels::{Frame, PixelFormat};

use crate::preview::sink::{FrameSink, PresentError, PresentFormat, TargetState};

/// A drawable pixel surface that accepts whole RGBA images.
pub trait RasterCanvas {
    fn dimensions(&self) -> (u32, u32);

    /// Resize the backing store; previous contents are undefined afterwards.
    fn set_dimensions(&mut self, width: u32, height: u32);

    /// Replace the canvas contents with `rgba` (`width * height * 4` bytes).
    fn put_image_data(&mut self, rgba: &[u8], width: u32, height: u32) -> Result<(), PresentError>;
}

/// Plain in-memory canvas, used headless and in tests.
#[derive(Debug, Default, Clone)]
pub struct PixelCanvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    blits: u64,
}

impl PixelCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
            blits: 0,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// RGBA of the pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        self.pixels.get(i..i + 4).and_then(|px| px.try_into().ok())
    }

    /// Number of completed `put_image_data` calls.
    pub fn blits(&self) -> u64 {
        self.blits
    }
}

impl RasterCanvas for PixelCanvas {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn set_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels = vec![0; width as usize * height as usize * 4];
    }

    fn put_image_data(&mut self, rgba: &[u8], width: u32, height: u32) -> Result<(), PresentError> {
        if (width, height) != (self.width, self.height) || rgba.len() != self.pixels.len() {
            return Err(PresentError::SizeMismatch {
                frame_width: width,
                frame_height: height,
                target_width: self.width,
                target_height: self.height,
            });
        }
        self.pixels.copy_from_slice(rgba);
        self.blits += 1;
        Ok(())
    }
}

/// [`FrameSink`] that blits frames onto a [`RasterCanvas`].
///
/// The canvas is resized to the frame's dimensions (not the other way
/// round), matching a canvas element sized to the video's intrinsic size.
pub struct RasterSink<C> {
    canvas: Option<C>,
    /// RGBA staging copy of the last upload; luminance frames are expanded.
    staging: Vec<u8>,
    target: TargetState,
}

impl<C: RasterCanvas> Default for RasterSink<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: RasterCanvas> RasterSink<C> {
    pub fn new() -> Self {
        Self {
            canvas: None,
            staging: Vec::new(),
            target: TargetState::Uninitialized,
        }
    }

    /// A sink already bound to `canvas`.
    pub fn with_canvas(canvas: C) -> Self {
        Self {
            canvas: Some(canvas),
            ..Self::new()
        }
    }

    pub fn canvas(&self) -> Option<&C> {
        self.canvas.as_ref()
    }

    pub fn into_canvas(self) -> Option<C> {
        self.canvas
    }
}

impl<C: RasterCanvas> FrameSink for RasterSink<C> {
    type Surface = C;

    fn attach(&mut self, mut canvas: C, _width: u32, _height: u32) -> Result<(), PresentError> {
        if let TargetState::Ready { width, height, .. } = self.target {
            if canvas.dimensions() != (width, height) {
                canvas.set_dimensions(width, height);
            }
        }
        self.canvas = Some(canvas);
        Ok(())
    }

    fn resize(&mut self, _width: u32, _height: u32) {
        // The canvas backing store follows the frame size, not the surface.
    }

    fn detach(&mut self) {
        self.canvas = None;
    }

    fn is_attached(&self) -> bool {
        self.canvas.is_some()
    }

    fn ensure_target(
        &mut self,
        width: u32,
        height: u32,
        format: PresentFormat,
    ) -> Result<(), PresentError> {
        if self.target.fits(width, height, format) {
            return Ok(());
        }
        let canvas = self.canvas.as_mut().ok_or(PresentError::SurfaceLost)?;
        if canvas.dimensions() != (width, height) {
            canvas.set_dimensions(width, height);
        }
        self.staging = vec![0; width as usize * height as usize * 4];
        self.target = TargetState::Ready {
            width,
            height,
            format,
        };
        Ok(())
    }

    fn upload(&mut self, frame: &Frame) -> Result<(), PresentError> {
        self.target.check(frame)?;
        match frame.format() {
            PixelFormat::Rgba8 => self.staging.copy_from_slice(frame.data()),
            PixelFormat::Luma8 => {
                for (px, &l) in self.staging.chunks_exact_mut(4).zip(frame.data()) {
                    px.copy_from_slice(&[l, l, l, 255]);
                }
            }
            other => return Err(PresentError::UnsupportedFormat(other.name())),
        }
        Ok(())
    }

    fn draw(&mut self) -> Result<(), PresentError> {
        let TargetState::Ready { width, height, .. } = self.target else {
            return Err(PresentError::NoTarget);
        };
        let canvas = self.canvas.as_mut().ok_or(PresentError::SurfaceLost)?;
        canvas.put_image_data(&self.staging, width, height)
    }

    fn target(&self) -> TargetState {
        self.target
    }
}
