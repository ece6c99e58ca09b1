//! Pixel conversion.
//!
//! Two stages: raw sensor layout → packed RGB24 (`to_rgb`), then RGB24 → the
//! presentation format the sink was negotiated with (`to_surface`). Sinks only
//! accept `SurfaceFormat`s, so every raw format goes through RGB24 first.

use anyhow::Result;

use crate::error::SessionError;
use crate::frame::{Frame, PixelFormat, RawFrame, SurfaceFormat};

/// Decode a raw frame into a tightly packed RGB24 frame.
pub fn to_rgb(raw: &RawFrame) -> Result<Frame> {
    if raw.width == 0 || raw.height == 0 {
        return Err(failure(format!(
            "empty frame geometry {}x{}",
            raw.width, raw.height
        )));
    }
    let min_stride = raw.pixel_format.min_stride(raw.width);
    if raw.stride < min_stride {
        return Err(failure(format!(
            "{} stride {} shorter than row of {} bytes",
            raw.pixel_format, raw.stride, min_stride
        )));
    }
    let expected = raw.pixel_format.buffer_len(raw.stride, raw.height);
    if raw.data.len() < expected {
        return Err(failure(format!(
            "{} frame length mismatch: expected {}, got {}",
            raw.pixel_format,
            expected,
            raw.data.len()
        )));
    }

    let w = raw.width as usize;
    let h = raw.height as usize;
    let mut rgb = vec![0u8; w * h * 3];
    match raw.pixel_format {
        PixelFormat::Mono8 => {
            for (j, row) in rows(&raw.data, raw.stride, h).enumerate() {
                for i in 0..w {
                    let v = row[i];
                    put(&mut rgb, w, i, j, [v, v, v]);
                }
            }
        }
        PixelFormat::Mono16 => {
            for (j, row) in rows(&raw.data, raw.stride, h).enumerate() {
                for i in 0..w {
                    // keep the most significant byte of the LE sample
                    let v = row[i * 2 + 1];
                    put(&mut rgb, w, i, j, [v, v, v]);
                }
            }
        }
        PixelFormat::Rgb8 => {
            for (j, row) in rows(&raw.data, raw.stride, h).enumerate() {
                rgb[j * w * 3..(j + 1) * w * 3].copy_from_slice(&row[..w * 3]);
            }
        }
        PixelFormat::Bgr8 => {
            for (j, row) in rows(&raw.data, raw.stride, h).enumerate() {
                for i in 0..w {
                    let p = &row[i * 3..i * 3 + 3];
                    put(&mut rgb, w, i, j, [p[2], p[1], p[0]]);
                }
            }
        }
        PixelFormat::Yuyv => yuyv_to_rgb(raw, &mut rgb),
        PixelFormat::Nv12 => nv12_to_rgb(raw, &mut rgb),
        PixelFormat::BayerRg8
        | PixelFormat::BayerBg8
        | PixelFormat::BayerGr8
        | PixelFormat::BayerGb8 => demosaic(raw, &mut rgb),
    }

    Ok(Frame::new(
        raw.width,
        raw.height,
        SurfaceFormat::Rgb24,
        raw.block_id,
        rgb,
    ))
}

/// Convert an RGB24 frame into `format`.
pub fn to_surface(frame: &Frame, format: SurfaceFormat) -> Result<Frame> {
    if frame.format != SurfaceFormat::Rgb24 {
        if frame.format == format {
            return Ok(frame.clone());
        }
        return Err(failure(format!(
            "expected an rgb24 intermediate, got {}",
            frame.format
        )));
    }
    if !frame.is_valid() {
        return Err(failure(format!(
            "invalid rgb24 frame {}x{} ({} bytes)",
            frame.width,
            frame.height,
            frame.pixels().len()
        )));
    }
    match format {
        SurfaceFormat::Rgb24 => Ok(frame.clone()),
        SurfaceFormat::Rgb32 => {
            let pixel_count = frame.width as usize * frame.height as usize;
            let mut out = Vec::with_capacity(pixel_count * 4);
            for p in frame.pixels()[..pixel_count * 3].chunks_exact(3) {
                out.extend_from_slice(&[p[2], p[1], p[0], 0xff]);
            }
            Ok(Frame::new(
                frame.width,
                frame.height,
                SurfaceFormat::Rgb32,
                frame.block_id,
                out,
            ))
        }
    }
}

/// Full two-stage conversion used on the delivery path.
pub fn to_presentation(raw: &RawFrame, format: SurfaceFormat) -> Result<Frame> {
    let rgb = to_rgb(raw)?;
    to_surface(&rgb, format)
}

fn failure(message: String) -> anyhow::Error {
    SessionError::ConversionFailure(message).into()
}

fn rows(data: &[u8], stride: usize, height: usize) -> impl Iterator<Item = &[u8]> {
    data.chunks(stride).take(height)
}

fn put(rgb: &mut [u8], width: usize, i: usize, j: usize, px: [u8; 3]) {
    let offset = (j * width + i) * 3;
    rgb[offset..offset + 3].copy_from_slice(&px);
}

fn yuyv_to_rgb(raw: &RawFrame, rgb: &mut [u8]) {
    let w = raw.width as usize;
    for (j, row) in rows(&raw.data, raw.stride, raw.height as usize).enumerate() {
        for i in 0..w {
            let pair = (i / 2) * 4;
            let y = row[pair + if i % 2 == 0 { 0 } else { 2 }] as f32;
            let u = row[pair + 1] as f32 - 128.0;
            let v = row.get(pair + 3).copied().unwrap_or(128) as f32 - 128.0;
            put(rgb, w, i, j, bt601(y, u, v));
        }
    }
}

fn nv12_to_rgb(raw: &RawFrame, rgb: &mut [u8]) {
    let w = raw.width as usize;
    let h = raw.height as usize;
    let y_plane = raw.stride * h;
    for j in 0..h {
        for i in 0..w {
            let y = raw.data[j * raw.stride + i] as f32;
            let uv_index = y_plane + (j / 2) * raw.stride + (i / 2) * 2;
            let u = raw.data[uv_index] as f32 - 128.0;
            let v = raw.data.get(uv_index + 1).copied().unwrap_or(128) as f32 - 128.0;
            put(rgb, w, i, j, bt601(y, u, v));
        }
    }
}

fn bt601(y: f32, u: f32, v: f32) -> [u8; 3] {
    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;
    [clamp_to_u8(r), clamp_to_u8(g), clamp_to_u8(b)]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[derive(Clone, Copy)]
enum Channel {
    R,
    G,
    B,
}

/// Colour of each site in a 2x2 cell, in order (0,0) (1,0) (0,1) (1,1).
fn bayer_pattern(format: PixelFormat) -> [Channel; 4] {
    use Channel::*;
    match format {
        PixelFormat::BayerBg8 => [B, G, G, R],
        PixelFormat::BayerGr8 => [G, R, B, G],
        PixelFormat::BayerGb8 => [G, B, R, G],
        _ => [R, G, G, B],
    }
}

/// Nearest-neighbour demosaic: every pixel of a 2x2 cell gets the cell's
/// R, averaged G and B.
fn demosaic(raw: &RawFrame, rgb: &mut [u8]) {
    let w = raw.width as usize;
    let h = raw.height as usize;
    let pattern = bayer_pattern(raw.pixel_format);
    let sample = |x: usize, y: usize| raw.data[y.min(h - 1) * raw.stride + x.min(w - 1)] as u16;

    for by in (0..h).step_by(2) {
        for bx in (0..w).step_by(2) {
            let sites = [
                sample(bx, by),
                sample(bx + 1, by),
                sample(bx, by + 1),
                sample(bx + 1, by + 1),
            ];
            let (mut r, mut g, mut b, mut greens) = (0u16, 0u16, 0u16, 0u16);
            for (channel, value) in pattern.iter().zip(sites) {
                match channel {
                    Channel::R => r = value,
                    Channel::B => b = value,
                    Channel::G => {
                        g += value;
                        greens += 1;
                    }
                }
            }
            let px = [r as u8, (g / greens.max(1)) as u8, b as u8];
            for y in by..(by + 2).min(h) {
                for x in bx..(bx + 2).min(w) {
                    put(rgb, w, x, y, px);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn raw(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> RawFrame {
        RawFrame {
            width,
            height,
            stride: format.min_stride(width),
            pixel_format: format,
            block_id: 7,
            data,
        }
    }

    #[test]
    fn mono8_expands_to_gray() -> Result<()> {
        let frame = to_rgb(&raw(2, 1, PixelFormat::Mono8, vec![10, 200]))?;
        assert_eq!(frame.pixels(), &[10, 10, 10, 200, 200, 200]);
        assert_eq!(frame.block_id, 7);
        Ok(())
    }

    #[test]
    fn mono16_keeps_high_byte() -> Result<()> {
        let frame = to_rgb(&raw(1, 1, PixelFormat::Mono16, vec![0x34, 0x12]))?;
        assert_eq!(frame.pixels(), &[0x12, 0x12, 0x12]);
        Ok(())
    }

    #[test]
    fn bgr_is_swapped() -> Result<()> {
        let frame = to_rgb(&raw(1, 1, PixelFormat::Bgr8, vec![1, 2, 3]))?;
        assert_eq!(frame.pixels(), &[3, 2, 1]);
        Ok(())
    }

    #[test]
    fn padded_stride_is_skipped() -> Result<()> {
        let mut frame = raw(1, 2, PixelFormat::Mono8, vec![5, 0xee, 6, 0xee]);
        frame.stride = 2;
        let rgb = to_rgb(&frame)?;
        assert_eq!(rgb.pixels(), &[5, 5, 5, 6, 6, 6]);
        Ok(())
    }

    #[test]
    fn nv12_neutral_chroma_is_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let frame = to_rgb(&raw(2, 2, PixelFormat::Nv12, nv12))?;
        assert_eq!(frame.pixels(), &[128u8; 12][..]);
        Ok(())
    }

    #[test]
    fn yuyv_neutral_chroma_is_gray() -> Result<()> {
        let frame = to_rgb(&raw(2, 1, PixelFormat::Yuyv, vec![64, 128, 192, 128]))?;
        assert_eq!(frame.pixels(), &[64, 64, 64, 192, 192, 192]);
        Ok(())
    }

    #[test]
    fn bayer_rg_cell_fills_all_sites() -> Result<()> {
        // R G / G B
        let frame = to_rgb(&raw(2, 2, PixelFormat::BayerRg8, vec![200, 100, 50, 10]))?;
        for px in frame.pixels().chunks_exact(3) {
            assert_eq!(px, &[200, 75, 10]);
        }
        Ok(())
    }

    #[test]
    fn short_buffer_is_a_conversion_failure() {
        let err = to_rgb(&raw(4, 4, PixelFormat::Rgb8, vec![0; 10])).unwrap_err();
        assert_eq!(SessionError::kind_of(&err), ErrorKind::ConversionFailure);
    }

    #[test]
    fn rgb32_is_bgrx_little_endian() -> Result<()> {
        let rgb = Frame::new(1, 1, SurfaceFormat::Rgb24, 3, vec![1, 2, 3]);
        let out = to_surface(&rgb, SurfaceFormat::Rgb32)?;
        assert_eq!(out.pixels(), &[3, 2, 1, 0xff]);
        assert_eq!(out.stride, 4);
        assert_eq!(out.block_id, 3);
        Ok(())
    }
}
