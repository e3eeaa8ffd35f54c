//! Per-pixel filter stage applied to packed RGBA frames.

use crate::error::{PixelError, Result};
use crate::frame::{Frame, PixelFormat};

/// BT.601 luma weights.
pub const LUMA_R: f64 = 0.299;
pub const LUMA_G: f64 = 0.587;
pub const LUMA_B: f64 = 0.114;

/// Horizontal Sobel kernel, row-major.
pub const SOBEL_X: [i32; 9] = [-1, 0, 1, -2, 0, 2, -1, 0, 1];
/// Vertical Sobel kernel, row-major.
pub const SOBEL_Y: [i32; 9] = [-1, -2, -1, 0, 0, 0, 1, 2, 1];

/// Value written to pixels the 3x3 window cannot cover.
pub const BORDER_PIXEL: [u8; 4] = [0, 0, 0, 255];

/// Which filter to run on each frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    #[default]
    None,
    Grayscale,
    EdgeDetect,
}

impl FilterMode {
    /// Map the two independent UI toggles to one mode. Edge detection wins
    /// when both are on, since its output is already grey.
    pub fn from_toggles(grayscale: bool, edges: bool) -> Self {
        match (grayscale, edges) {
            (_, true) => Self::EdgeDetect,
            (true, false) => Self::Grayscale,
            (false, false) => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Grayscale => "grayscale",
            Self::EdgeDetect => "edge_detect",
        }
    }
}

#[inline]
pub fn luma(r: u8, g: u8, b: u8) -> f64 {
    LUMA_R * r as f64 + LUMA_G * g as f64 + LUMA_B * b as f64
}

/// Store a float channel value the way a clamped byte array does: clamp to
/// `0..=255`, then round half to even.
#[inline]
fn store_channel(value: f64) -> u8 {
    value.clamp(0.0, 255.0).round_ties_even() as u8
}

/// Run `mode` over an RGBA frame.
pub fn apply(frame: Frame, mode: FilterMode) -> Result<Frame> {
    match mode {
        FilterMode::None => Ok(frame),
        FilterMode::Grayscale => grayscale(frame),
        FilterMode::EdgeDetect => edge_detect(&frame),
    }
}

/// Replace R, G and B with the pixel's luma. Alpha is kept.
pub fn grayscale(frame: Frame) -> Result<Frame> {
    require_rgba(&frame, "grayscale")?;
    let (width, height) = frame.dimensions();
    let timestamp = frame.timestamp();
    let mut data = frame.into_data();
    for px in data.chunks_exact_mut(4) {
        let y = store_channel(luma(px[0], px[1], px[2]));
        px[..3].fill(y);
    }
    Frame::rgba(width, height, data, timestamp)
}

/// Sobel gradient magnitude of the frame's luma, written as grey.
///
/// Interior pixels get `min(sqrt(gx² + gy²), 255)`; the outermost rows and
/// columns are left as [`BORDER_PIXEL`].
pub fn edge_detect(frame: &Frame) -> Result<Frame> {
    require_rgba(frame, "edge_detect")?;
    let (width, height) = frame.dimensions();
    let (w, h) = (width as usize, height as usize);
    let luma = luma_plane(frame.data());
    let mut out = BORDER_PIXEL.repeat(w * h);

    for y in 1..h.saturating_sub(1) {
        let above = &luma[(y - 1) * w..y * w];
        let row = &luma[y * w..(y + 1) * w];
        let below = &luma[(y + 1) * w..(y + 2) * w];
        for x in 1..w - 1 {
            // Kernels expanded into column / row differences; a flat
            // neighbourhood gives exactly zero.
            let gx = (above[x + 1] - above[x - 1])
                + 2.0 * (row[x + 1] - row[x - 1])
                + (below[x + 1] - below[x - 1]);
            let gy = (below[x - 1] - above[x - 1])
                + 2.0 * (below[x] - above[x])
                + (below[x + 1] - above[x + 1]);
            let magnitude = store_channel((gx * gx + gy * gy).sqrt().min(255.0));
            let i = (y * w + x) * 4;
            out[i..i + 3].fill(magnitude);
        }
    }

    Frame::rgba(width, height, out, frame.timestamp())
}

/// Unrounded luma of every pixel in an RGBA buffer.
pub fn luma_plane(rgba: &[u8]) -> Vec<f64> {
    rgba.chunks_exact(4)
        .map(|px| luma(px[0], px[1], px[2]))
        .collect()
}

/// Collapse an RGBA frame to a single-channel luminance frame.
pub fn to_luma8(frame: Frame) -> Result<Frame> {
    match frame.format() {
        PixelFormat::Luma8 => Ok(frame),
        PixelFormat::Rgba8 => {
            let (width, height) = frame.dimensions();
            let data = frame
                .data()
                .chunks_exact(4)
                .map(|px| store_channel(luma(px[0], px[1], px[2])))
                .collect();
            Frame::luma(width, height, data, frame.timestamp())
        }
        other => Err(PixelError::UnsupportedFormat {
            operation: "to_luma8",
            format: other.name(),
        }),
    }
}

fn require_rgba(frame: &Frame, operation: &'static str) -> Result<()> {
    match frame.format() {
        PixelFormat::Rgba8 => Ok(()),
        other => Err(PixelError::UnsupportedFormat {
            operation,
            format: other.name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn rgba_frame(width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 4]) -> Frame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&pixel(x, y));
            }
        }
        Frame::rgba(width, height, data, Instant::now()).unwrap()
    }

    fn column_checkerboard(size: u32) -> Frame {
        rgba_frame(size, size, |x, _| {
            let v = if x % 2 == 0 { 0 } else { 255 };
            [v, v, v, 255]
        })
    }

    fn is_border(i: usize, w: usize, h: usize) -> bool {
        let (x, y) = (i % w, i / w);
        x == 0 || y == 0 || x == w - 1 || y == h - 1
    }

    #[test]
    fn toggles_prefer_edges() {
        assert_eq!(FilterMode::from_toggles(false, false), FilterMode::None);
        assert_eq!(FilterMode::from_toggles(true, false), FilterMode::Grayscale);
        assert_eq!(FilterMode::from_toggles(false, true), FilterMode::EdgeDetect);
        assert_eq!(FilterMode::from_toggles(true, true), FilterMode::EdgeDetect);
    }

    #[test]
    fn grayscale_of_grey_checkerboard_keeps_values() {
        let out = grayscale(column_checkerboard(4)).unwrap();
        for (i, px) in out.data().chunks_exact(4).enumerate() {
            let expected: u8 = if i % 2 == 0 { 0 } else { 255 };
            assert_eq!(px, [expected, expected, expected, 255]);
        }
    }

    #[test]
    fn grayscale_weights_primaries() {
        let frame = rgba_frame(3, 1, |x, _| match x {
            0 => [255, 0, 0, 10],
            1 => [0, 255, 0, 20],
            _ => [0, 0, 255, 30],
        });
        let out = grayscale(frame).unwrap();
        assert_eq!(
            out.data(),
            &[76, 76, 76, 10, 150, 150, 150, 20, 29, 29, 29, 30]
        );
    }

    #[test]
    fn grayscale_is_idempotent() {
        let frame = rgba_frame(7, 5, |x, y| {
            [
                (x * 37 + y * 11) as u8,
                (x * 5 + y * 71) as u8,
                (x * y * 13) as u8,
                255,
            ]
        });
        let once = grayscale(frame).unwrap();
        let twice = grayscale(once.clone()).unwrap();
        assert_eq!(once.data(), twice.data());
    }

    #[test]
    fn flat_frame_has_zero_interior_and_black_border() {
        let (w, h) = (6usize, 5usize);
        let out = edge_detect(&rgba_frame(w as u32, h as u32, |_, _| [200, 31, 77, 255])).unwrap();
        for (i, px) in out.data().chunks_exact(4).enumerate() {
            if is_border(i, w, h) {
                assert_eq!(px, BORDER_PIXEL);
            } else {
                assert_eq!(px, [0, 0, 0, 255]);
            }
        }
    }

    #[test]
    fn edge_magnitude_clamps_on_checkerboard() {
        let (w, h) = (8usize, 8usize);
        // Two-pixel blocks: every interior pixel sits on a block boundary in
        // both directions, giving |gx| = |gy| = 510 before clamping.
        let frame = rgba_frame(w as u32, h as u32, |x, y| {
            let v = if (x / 2 + y / 2) % 2 == 0 { 0 } else { 255 };
            [v, v, v, 255]
        });
        let out = edge_detect(&frame).unwrap();
        for (i, px) in out.data().chunks_exact(4).enumerate() {
            if !is_border(i, w, h) {
                assert_eq!(px, [255, 255, 255, 255]);
            }
        }
    }

    #[test]
    fn vertical_step_is_detected() {
        let frame = rgba_frame(4, 3, |x, _| if x < 2 { [0, 0, 0, 255] } else { [40, 40, 40, 255] });
        let out = edge_detect(&frame).unwrap();
        // Interior pixels (1,1) and (2,1) straddle the step: gx = 4 * 40.
        let px = |x: usize| out.data()[(4 + x) * 4];
        assert_eq!(px(1), 160);
        assert_eq!(px(2), 160);
    }

    #[test]
    fn differenced_form_matches_kernel_convolution() {
        let (w, h) = (9usize, 7usize);
        let frame = rgba_frame(w as u32, h as u32, |x, y| {
            [
                (x * 29 + y * 7) as u8,
                (x * x * 3 + y * 17) as u8,
                (y * y * 11 + x) as u8,
                255,
            ]
        });
        let luma = luma_plane(frame.data());
        let out = edge_detect(&frame).unwrap();
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let (mut gx, mut gy) = (0.0, 0.0);
                for (k, (kx, ky)) in SOBEL_X.iter().zip(SOBEL_Y).enumerate() {
                    let l = luma[(y + k / 3 - 1) * w + (x + k % 3 - 1)];
                    gx += *kx as f64 * l;
                    gy += ky as f64 * l;
                }
                let direct = store_channel((gx * gx + gy * gy).sqrt().min(255.0));
                let got = out.data()[(y * w + x) * 4];
                assert_eq!(got, direct, "({x},{y}): differenced vs direct");
            }
        }
    }

    #[test]
    fn frames_too_small_for_the_window_are_all_border() {
        let out = edge_detect(&rgba_frame(2, 2, |_, _| [255, 255, 255, 255])).unwrap();
        assert_eq!(out.data(), BORDER_PIXEL.repeat(4).as_slice());
    }

    #[test]
    fn none_mode_passes_frame_through() {
        let frame = column_checkerboard(4);
        let before = frame.data().to_vec();
        let out = apply(frame, FilterMode::None).unwrap();
        assert_eq!(out.data(), before.as_slice());
    }

    #[test]
    fn to_luma8_keeps_one_byte_per_pixel() {
        let out = to_luma8(column_checkerboard(4)).unwrap();
        assert_eq!(out.format(), PixelFormat::Luma8);
        assert_eq!(&out.data()[..4], &[0, 255, 0, 255]);
    }

    #[test]
    fn filters_reject_non_rgba_input() {
        let frame = Frame::luma(2, 2, vec![0; 4], Instant::now()).unwrap();
        assert!(matches!(
            edge_detect(&frame),
            Err(PixelError::UnsupportedFormat { .. })
        ));
    }
}
