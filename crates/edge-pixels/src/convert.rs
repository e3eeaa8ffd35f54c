//! Planar YUV 4:2:0 to packed RGBA using the BT.601 studio-range integer
//! transform.

use crate::error::{PixelError, Result};
use crate::frame::{Frame, PixelFormat, Yuv420Layout};

#[inline]
pub fn clamp8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Convert one YUV sample triple to RGB with 8-bit fixed-point coefficients.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp8((298 * c + 409 * e + 128) >> 8),
        clamp8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp8((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Convert a planar 4:2:0 frame into a tightly packed RGBA frame.
///
/// Chroma for pixel `(x, y)` is read at `(x / 2, y / 2)` in each chroma
/// plane using that plane's own row and pixel stride, so I420, NV12 and NV21
/// buffers (with or without row padding) all go through the same loop.
/// The output keeps the input timestamp and always has alpha 255.
pub fn yuv420_to_rgba(frame: Frame) -> Result<Frame> {
    let PixelFormat::Yuv420(layout) = frame.format() else {
        return Err(PixelError::UnsupportedFormat {
            operation: "yuv420_to_rgba",
            format: frame.format().name(),
        });
    };
    let (width, height) = frame.dimensions();
    let mut rgba = vec![0u8; frame.pixel_count() * 4];
    convert_planes(frame.data(), width as usize, &layout, &mut rgba);
    Frame::rgba(width, height, rgba, frame.timestamp())
}

/// Bring any frame to RGBA: planar input is converted, luminance is expanded
/// to grey, RGBA passes through untouched.
pub fn to_rgba(frame: Frame) -> Result<Frame> {
    match frame.format() {
        PixelFormat::Rgba8 => Ok(frame),
        PixelFormat::Yuv420(_) => yuv420_to_rgba(frame),
        PixelFormat::Luma8 => {
            let (width, height) = frame.dimensions();
            let timestamp = frame.timestamp();
            let mut rgba = Vec::with_capacity(frame.pixel_count() * 4);
            for &l in frame.data() {
                rgba.extend_from_slice(&[l, l, l, 255]);
            }
            Frame::rgba(width, height, rgba, timestamp)
        }
    }
}

fn convert_planes(data: &[u8], width: usize, layout: &Yuv420Layout, out: &mut [u8]) {
    for (row, out_row) in out.chunks_exact_mut(width * 4).enumerate() {
        for (col, px) in out_row.chunks_exact_mut(4).enumerate() {
            let y = data[layout.y.index(col, row)];
            let u = data[layout.u.index(col / 2, row / 2)];
            let v = data[layout.v.index(col / 2, row / 2)];
            let [r, g, b] = yuv_to_rgb(y, u, v);
            px.copy_from_slice(&[r, g, b, 255]);
        }
    }
}
