use std::time::Instant;

use crate::error::{PixelError, Result};

/// Where one plane's samples live inside a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Byte offset of the first sample.
    pub offset: usize,
    /// Distance in bytes between the starts of two consecutive rows.
    pub row_stride: usize,
    /// Distance in bytes between two horizontally adjacent samples.
    pub pixel_stride: usize,
}

impl PlaneLayout {
    pub const fn new(offset: usize, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            offset,
            row_stride,
            pixel_stride,
        }
    }

    /// Byte index of the sample at `(col, row)`.
    #[inline]
    pub fn index(&self, col: usize, row: usize) -> usize {
        self.offset + row * self.row_stride + col * self.pixel_stride
    }

    /// One past the last byte addressed by a `cols` x `rows` plane.
    fn end(&self, cols: usize, rows: usize) -> usize {
        if cols == 0 || rows == 0 {
            return self.offset;
        }
        self.index(cols - 1, rows - 1) + 1
    }

    fn check(&self, name: &str, cols: usize, rows: usize, len: usize) -> Result<()> {
        if self.pixel_stride == 0 {
            return Err(PixelError::MalformedFrame(format!(
                "{name} plane has zero pixel stride"
            )));
        }
        let row_bytes = (cols.saturating_sub(1)) * self.pixel_stride + 1;
        if rows > 1 && self.row_stride < row_bytes {
            return Err(PixelError::MalformedFrame(format!(
                "{name} plane row stride {} is shorter than a {cols}-sample row",
                self.row_stride
            )));
        }
        let end = self.end(cols, rows);
        if end > len {
            return Err(PixelError::MalformedFrame(format!(
                "{name} plane needs {end} bytes but buffer holds {len}"
            )));
        }
        Ok(())
    }
}

/// Plane geometry of a 4:2:0 frame: a full-resolution luma plane and two
/// chroma planes subsampled by two in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Yuv420Layout {
    pub y: PlaneLayout,
    pub u: PlaneLayout,
    pub v: PlaneLayout,
}

impl Yuv420Layout {
    /// Three separate planes, each chroma sample one byte apart.
    pub fn i420(width: u32, height: u32, row_padding: usize) -> Self {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = chroma_dimensions(width, height);
        let y_stride = w + row_padding;
        let c_stride = cw + row_padding;
        let u_offset = y_stride * h;
        let v_offset = u_offset + c_stride * ch;
        Self {
            y: PlaneLayout::new(0, y_stride, 1),
            u: PlaneLayout::new(u_offset, c_stride, 1),
            v: PlaneLayout::new(v_offset, c_stride, 1),
        }
    }

    /// Luma plane followed by one interleaved plane of U,V pairs.
    pub fn nv12(width: u32, height: u32, row_padding: usize) -> Self {
        Self::semi_planar(width, height, row_padding, false)
    }

    /// Luma plane followed by one interleaved plane of V,U pairs.
    pub fn nv21(width: u32, height: u32, row_padding: usize) -> Self {
        Self::semi_planar(width, height, row_padding, true)
    }

    fn semi_planar(width: u32, height: u32, row_padding: usize, v_first: bool) -> Self {
        let (w, h) = (width as usize, height as usize);
        let (cw, _) = chroma_dimensions(width, height);
        let y_stride = w + row_padding;
        let uv_stride = cw * 2 + row_padding;
        let base = y_stride * h;
        let (u_offset, v_offset) = if v_first {
            (base + 1, base)
        } else {
            (base, base + 1)
        };
        Self {
            y: PlaneLayout::new(0, y_stride, 1),
            u: PlaneLayout::new(u_offset, uv_stride, 2),
            v: PlaneLayout::new(v_offset, uv_stride, 2),
        }
    }

    /// Smallest buffer that holds every plane of a `width` x `height` frame.
    pub fn required_len(&self, width: u32, height: u32) -> usize {
        let (cw, ch) = chroma_dimensions(width, height);
        self.y
            .end(width as usize, height as usize)
            .max(self.u.end(cw, ch))
            .max(self.v.end(cw, ch))
    }

    fn validate(&self, width: u32, height: u32, len: usize) -> Result<()> {
        let (cw, ch) = chroma_dimensions(width, height);
        self.y.check("luma", width as usize, height as usize, len)?;
        self.u.check("u", cw, ch, len)?;
        self.v.check("v", cw, ch, len)
    }
}

/// Chroma plane size for a 4:2:0 frame, rounding odd dimensions up.
pub fn chroma_dimensions(width: u32, height: u32) -> (usize, usize) {
    (width.div_ceil(2) as usize, height.div_ceil(2) as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Sensor-native planar 4:2:0.
    Yuv420(Yuv420Layout),
    /// Tightly packed 8-bit R,G,B,A.
    Rgba8,
    /// Tightly packed 8-bit luminance.
    Luma8,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            Self::Yuv420(_) => None,
            Self::Rgba8 => Some(4),
            Self::Luma8 => Some(1),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Yuv420(_) => "yuv420",
            Self::Rgba8 => "rgba8",
            Self::Luma8 => "luma8",
        }
    }
}

/// One image travelling through the pipeline.
///
/// A frame owns its pixel buffer and is never mutated after construction;
/// stages take it by value and hand back a new frame (or drop it).
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    timestamp: Instant,
}

impl Frame {
    /// Wrap `data`, checking that it matches `width`, `height` and `format`.
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
        timestamp: Instant,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(PixelError::MalformedFrame(format!(
                "zero-sized frame {width}x{height}"
            )));
        }
        match format {
            PixelFormat::Yuv420(layout) => layout.validate(width, height, data.len())?,
            PixelFormat::Rgba8 | PixelFormat::Luma8 => {
                let bpp = format.bytes_per_pixel().unwrap_or(1);
                let expected = width as usize * height as usize * bpp;
                if data.len() != expected {
                    return Err(PixelError::MalformedFrame(format!(
                        "{} frame {width}x{height} needs {expected} bytes, got {}",
                        format.name(),
                        data.len()
                    )));
                }
            }
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            timestamp,
        })
    }

    pub fn rgba(width: u32, height: u32, data: Vec<u8>, timestamp: Instant) -> Result<Self> {
        Self::new(width, height, PixelFormat::Rgba8, data, timestamp)
    }

    pub fn luma(width: u32, height: u32, data: Vec<u8>, timestamp: Instant) -> Result<Self> {
        Self::new(width, height, PixelFormat::Luma8, data, timestamp)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// When the sensor produced the image this frame derives from.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
