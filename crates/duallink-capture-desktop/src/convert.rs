//! BGRA → I420 conversion with output scaling and even-dimension correction.
//!
//! Colour math is BT.601 limited range (Y 16–235, UV 16–240) in 8-bit fixed
//! point. Chroma is the average of each 2×2 block.

use std::sync::Arc;

use duallink_core::{I420Buffer, Resolution};
use tracing::{debug, warn};

use crate::buffer_pool::FrameBufferPool;
use crate::device::DesktopFrame;

#[derive(Debug)]
pub enum Conversion {
    Converted(Arc<I420Buffer>),
    /// Degenerate or malformed input; nothing to deliver.
    Dropped,
}

// ── ColorConverter ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ColorConverter {
    target:            Option<Resolution>,
    pool:              FrameBufferPool,
    /// BGRA scratch for scaled frames, sized for `scaled_geometry`.
    scaled:            Vec<u8>,
    scaled_geometry:   Option<Resolution>,
    scale_allocations: u64,
}

impl ColorConverter {
    /// `target` is the requested output geometry; `None` keeps the captured size.
    pub fn new(target: Option<Resolution>) -> Self {
        Self {
            target,
            pool: FrameBufferPool::new(),
            scaled: Vec::new(),
            scaled_geometry: None,
            scale_allocations: 0,
        }
    }

    /// Geometry a frame of `input` size is converted to.
    pub fn output_resolution(&self, input: Resolution) -> Resolution {
        self.target.unwrap_or(input).even_floor()
    }

    pub fn pool(&self) -> &FrameBufferPool {
        &self.pool
    }

    /// Scratch buffers allocated for scaling.
    pub fn scale_allocations(&self) -> u64 {
        self.scale_allocations
    }

    pub fn convert(&mut self, frame: &DesktopFrame<'_>, timestamp_us: u64) -> Conversion {
        let input = frame.resolution();
        if input.is_degenerate() {
            debug!("Dropping degenerate {} frame", input);
            return Conversion::Dropped;
        }
        if !frame.is_well_formed() {
            warn!(
                "Dropping malformed {} frame (stride {}, {} bytes)",
                input,
                frame.stride,
                frame.data.len()
            );
            return Conversion::Dropped;
        }

        let output = self.output_resolution(input);
        if output.is_degenerate() {
            return Conversion::Dropped;
        }

        let (src, src_stride) = if output == input {
            (frame.data, frame.stride)
        } else {
            if self.scaled_geometry != Some(output) {
                debug!("Scaling {} → {}", input, output);
                self.scaled = vec![0; output.width as usize * output.height as usize * 4];
                self.scaled_geometry = Some(output);
                self.scale_allocations += 1;
            }
            scale_bgra_bilinear(frame, &mut self.scaled, output);
            (&self.scaled[..], output.width as usize * 4)
        };

        let buffer = self.pool.acquire(output.width, output.height);
        bgra_to_i420(src, src_stride, buffer);
        buffer.set_timestamp_us(timestamp_us);
        Conversion::Converted(self.pool.handle())
    }
}

// ── Pixel kernels ─────────────────────────────────────────────────────────────

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8
}

#[inline]
fn chroma_u(r: i32, g: i32, b: i32) -> u8 {
    (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8
}

#[inline]
fn chroma_v(r: i32, g: i32, b: i32) -> u8 {
    (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8
}

fn bgra_to_i420(src: &[u8], src_stride: usize, dst: &mut I420Buffer) {
    let (w, h) = (dst.width() as usize, dst.height() as usize);
    let (stride_y, stride_u, stride_v) = (dst.stride_y(), dst.stride_u(), dst.stride_v());
    let (chroma_w, chroma_h) = (dst.chroma_width(), dst.chroma_height());
    let (y_plane, u_plane, v_plane) = dst.planes_mut();

    for row in 0..h {
        let src_row = &src[row * src_stride..row * src_stride + w * 4];
        let dst_row = &mut y_plane[row * stride_y..row * stride_y + w];
        for (out, px) in dst_row.iter_mut().zip(src_row.chunks_exact(4)) {
            *out = luma(px[2] as i32, px[1] as i32, px[0] as i32);
        }
    }

    for cy in 0..chroma_h {
        let r0 = &src[2 * cy * src_stride..];
        let r1 = &src[(2 * cy + 1).min(h - 1) * src_stride..];
        for cx in 0..chroma_w {
            let x0 = 2 * cx * 4;
            let x1 = (2 * cx + 1).min(w - 1) * 4;
            let sum = |c: usize| {
                (r0[x0 + c] as i32 + r0[x1 + c] as i32 + r1[x0 + c] as i32 + r1[x1 + c] as i32 + 2) >> 2
            };
            let (b, g, r) = (sum(0), sum(1), sum(2));
            u_plane[cy * stride_u + cx] = chroma_u(r, g, b);
            v_plane[cy * stride_v + cx] = chroma_v(r, g, b);
        }
    }
}

/// Source coordinate in 16.16 fixed point for destination index `d`,
/// sampling pixel centres.
#[inline]
fn source_position(d: usize, step: u64) -> (usize, u32) {
    let pos = (d as u64 * step + step / 2).saturating_sub(1 << 15);
    ((pos >> 16) as usize, ((pos & 0xFFFF) >> 8) as u32)
}

fn scale_bgra_bilinear(frame: &DesktopFrame<'_>, dst: &mut [u8], output: Resolution) {
    let (sw, sh) = (frame.width as usize, frame.height as usize);
    let (dw, dh) = (output.width as usize, output.height as usize);
    let x_step = ((sw as u64) << 16) / dw as u64;
    let y_step = ((sh as u64) << 16) / dh as u64;

    for (dy, dst_row) in dst.chunks_exact_mut(dw * 4).take(dh).enumerate() {
        let (y0, wy) = source_position(dy, y_step);
        let y0 = y0.min(sh - 1);
        let y1 = (y0 + 1).min(sh - 1);
        let row0 = &frame.data[y0 * frame.stride..];
        let row1 = &frame.data[y1 * frame.stride..];

        for (dx, out) in dst_row.chunks_exact_mut(4).enumerate() {
            let (x0, wx) = source_position(dx, x_step);
            let x0 = x0.min(sw - 1);
            let x1 = (x0 + 1).min(sw - 1);
            for c in 0..4 {
                let top = row0[x0 * 4 + c] as u32 * (256 - wx) + row0[x1 * 4 + c] as u32 * wx;
                let bottom = row1[x0 * 4 + c] as u32 * (256 - wx) + row1[x1 * 4 + c] as u32 * wx;
                out[c] = ((top * (256 - wy) + bottom * wy + (1 << 15)) >> 16) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, stride: usize, bgra: [u8; 4]) -> Vec<u8> {
        let mut data = vec![0u8; stride * height as usize];
        for row in data.chunks_exact_mut(stride) {
            for px in row[..width as usize * 4].chunks_exact_mut(4) {
                px.copy_from_slice(&bgra);
            }
        }
        data
    }

    fn convert(converter: &mut ColorConverter, width: u32, height: u32, bgra: [u8; 4]) -> Conversion {
        let stride = width as usize * 4 + 32;
        let data = solid(width, height, stride, bgra);
        converter.convert(&DesktopFrame { width, height, stride, data: &data }, 0)
    }

    fn converted(conversion: Conversion) -> Arc<I420Buffer> {
        match conversion {
            Conversion::Converted(buffer) => buffer,
            Conversion::Dropped => panic!("frame was dropped"),
        }
    }

    /// Inverse BT.601 limited range, for round-trip checks.
    fn i420_to_bgra(y: u8, u: u8, v: u8) -> [u8; 3] {
        let c = 1.164 * (y as f32 - 16.0);
        let d = u as f32 - 128.0;
        let e = v as f32 - 128.0;
        let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
        [clamp(c + 2.018 * d), clamp(c - 0.391 * d - 0.813 * e), clamp(c + 1.596 * e)]
    }

    #[test]
    fn capacity_invariant_holds_for_all_geometries() {
        let mut converter = ColorConverter::new(None);
        for (w, h) in [(2, 2), (3, 3), (17, 9), (640, 480), (1279, 719), (1921, 1081)] {
            let buffer = converted(convert(&mut converter, w, h, [0, 0, 0, 255]));
            let needed = buffer.stride_y() * buffer.height() as usize
                + (buffer.stride_u() + buffer.stride_v()) * (buffer.height() as usize).div_ceil(2);
            assert!(buffer.capacity() >= needed, "{w}x{h}");
        }
    }

    #[test]
    fn odd_geometry_is_scaled_to_even() {
        let mut converter = ColorConverter::new(None);
        let buffer = converted(convert(&mut converter, 1279, 719, [10, 20, 30, 255]));
        assert_eq!(buffer.resolution(), Resolution::new(1278, 718));
        assert_eq!(converter.scale_allocations(), 1);
    }

    #[test]
    fn even_geometry_passes_through_unscaled() {
        let mut converter = ColorConverter::new(None);
        let buffer = converted(convert(&mut converter, 1920, 1080, [10, 20, 30, 255]));
        assert_eq!(buffer.resolution(), Resolution::FHD);
        assert_eq!(converter.scale_allocations(), 0);
    }

    #[test]
    fn repeated_geometry_allocates_nothing_new() {
        let mut converter = ColorConverter::new(None);
        drop(convert(&mut converter, 1279, 719, [0, 0, 0, 255]));
        let (pool, scale) = (converter.pool().allocations(), converter.scale_allocations());
        drop(convert(&mut converter, 1279, 719, [50, 50, 50, 255]));
        drop(convert(&mut converter, 1279, 719, [90, 90, 90, 255]));
        assert_eq!(converter.pool().allocations(), pool);
        assert_eq!(converter.scale_allocations(), scale);
    }

    #[test]
    fn degenerate_frames_are_dropped() {
        let mut converter = ColorConverter::new(None);
        assert!(matches!(convert(&mut converter, 1, 1, [0; 4]), Conversion::Dropped));
        assert!(matches!(convert(&mut converter, 0, 0, [0; 4]), Conversion::Dropped));
        assert_eq!(converter.pool().allocations(), 0);
    }

    #[test]
    fn short_data_is_dropped() {
        let mut converter = ColorConverter::new(None);
        let data = vec![0u8; 100];
        let frame = DesktopFrame { width: 16, height: 16, stride: 64, data: &data };
        assert!(matches!(converter.convert(&frame, 0), Conversion::Dropped));
    }

    #[test]
    fn output_scaling_honours_target() {
        let mut converter = ColorConverter::new(Some(Resolution::HD));
        let buffer = converted(convert(&mut converter, 1920, 1080, [0, 0, 0, 255]));
        assert_eq!(buffer.resolution(), Resolution::HD);

        let mut converter = ColorConverter::new(Some(Resolution::new(641, 481)));
        assert_eq!(converter.output_resolution(Resolution::FHD), Resolution::new(640, 480));
        let buffer = converted(convert(&mut converter, 1920, 1080, [0, 0, 0, 255]));
        assert_eq!(buffer.resolution(), Resolution::new(640, 480));
    }

    #[test]
    fn reference_colours() {
        let mut converter = ColorConverter::new(None);
        for (bgra, yuv) in [
            ([255, 255, 255, 255], (235, 128, 128)),
            ([0, 0, 0, 255], (16, 128, 128)),
            ([0, 0, 255, 255], (82, 90, 240)),
        ] {
            let buffer = converted(convert(&mut converter, 4, 4, bgra));
            assert_eq!((buffer.data_y()[0], buffer.data_u()[0], buffer.data_v()[0]), yuv, "{bgra:?}");
        }
    }

    #[test]
    fn round_trip_stays_close() {
        let mut converter = ColorConverter::new(None);
        for rgb in [[200u8, 100, 50], [30, 160, 220], [128, 128, 128]] {
            let bgra = [rgb[2], rgb[1], rgb[0], 255];
            // Odd size exercises the scaling path as well.
            let buffer = converted(convert(&mut converter, 33, 17, bgra));
            let back = i420_to_bgra(buffer.data_y()[40], buffer.data_u()[5], buffer.data_v()[5]);
            for c in 0..3 {
                let diff = (back[c] as i32 - bgra[c] as i32).abs();
                assert!(diff <= 4, "{rgb:?} → {back:?}");
            }
        }
    }

    #[test]
    fn scaling_preserves_uniform_colour() {
        let frame_data = solid(9, 7, 9 * 4, [12, 34, 56, 255]);
        let frame = DesktopFrame { width: 9, height: 7, stride: 36, data: &frame_data };
        let mut dst = vec![0u8; 8 * 6 * 4];
        scale_bgra_bilinear(&frame, &mut dst, Resolution::new(8, 6));
        assert!(dst.chunks_exact(4).all(|px| px == [12, 34, 56, 255]));
    }
}
