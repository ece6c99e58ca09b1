//! Frame types.
//!
//! - `RawFrame`: sensor data exactly as the driver delivered it.
//! - `RawGrab`: one retrieval result (succeeded or not).
//! - `Frame`: decoded pixels in a `SurfaceFormat`, ready for capture results or
//!   presentation.
//!
//! Frames are handed along by value: driver → pump (conversion) → dispatcher
//! (presentation). Nothing here keeps a frame around after it is presented.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};

/// Raw sensor pixel layouts a driver may deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Mono8,
    /// 16 bits per pixel, little-endian.
    Mono16,
    Rgb8,
    Bgr8,
    /// Packed YUV 4:2:2 as `Y0 U Y1 V`.
    Yuyv,
    /// Y plane followed by interleaved UV at half resolution.
    Nv12,
    BayerRg8,
    BayerBg8,
    BayerGr8,
    BayerGb8,
}

impl PixelFormat {
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono16 => "Mono16",
            PixelFormat::Rgb8 => "RGB8",
            PixelFormat::Bgr8 => "BGR8",
            PixelFormat::Yuyv => "YUV422_YUYV",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::BayerRg8 => "BayerRG8",
            PixelFormat::BayerBg8 => "BayerBG8",
            PixelFormat::BayerGr8 => "BayerGR8",
            PixelFormat::BayerGb8 => "BayerGB8",
        }
    }

    /// Minimum row length in bytes for `width` pixels.
    ///
    /// NV12 reports the luma row; the chroma plane is accounted for by
    /// `buffer_len`.
    pub fn min_stride(&self, width: u32) -> usize {
        let w = width as usize;
        match self {
            PixelFormat::Mono8
            | PixelFormat::Nv12
            | PixelFormat::BayerRg8
            | PixelFormat::BayerBg8
            | PixelFormat::BayerGr8
            | PixelFormat::BayerGb8 => w,
            PixelFormat::Mono16 | PixelFormat::Yuyv => w * 2,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => w * 3,
        }
    }

    /// Bytes needed for a frame with the given row stride.
    pub fn buffer_len(&self, stride: usize, height: u32) -> usize {
        let h = height as usize;
        match self {
            PixelFormat::Nv12 => stride * h + stride * h.div_ceil(2),
            _ => stride * h,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let format = match s {
            "Mono8" => PixelFormat::Mono8,
            "Mono16" => PixelFormat::Mono16,
            "RGB8" | "RGB8Packed" => PixelFormat::Rgb8,
            "BGR8" | "BGR8Packed" => PixelFormat::Bgr8,
            "YUV422_YUYV" | "YUYV" => PixelFormat::Yuyv,
            "NV12" => PixelFormat::Nv12,
            "BayerRG8" => PixelFormat::BayerRg8,
            "BayerBG8" => PixelFormat::BayerBg8,
            "BayerGR8" => PixelFormat::BayerGr8,
            "BayerGB8" => PixelFormat::BayerGb8,
            other => return Err(anyhow!("unknown pixel format '{}'", other)),
        };
        Ok(format)
    }
}

/// Pixel formats a frame can carry after conversion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SurfaceFormat {
    /// Packed `R G B`, 3 bytes per pixel. The intermediate format.
    Rgb24,
    /// `0xffRRGGBB` words stored little-endian (`B G R 0xff`).
    #[default]
    Rgb32,
}

impl SurfaceFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            SurfaceFormat::Rgb24 => 3,
            SurfaceFormat::Rgb32 => 4,
        }
    }
}

impl fmt::Display for SurfaceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceFormat::Rgb24 => f.write_str("rgb24"),
            SurfaceFormat::Rgb32 => f.write_str("rgb32"),
        }
    }
}

impl FromStr for SurfaceFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rgb24" | "rgb888" => Ok(SurfaceFormat::Rgb24),
            "rgb32" | "xrgb" => Ok(SurfaceFormat::Rgb32),
            other => Err(anyhow!("unknown surface format '{}'", other)),
        }
    }
}

/// Sensor data as delivered by a driver.
#[derive(Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Row length in bytes (may include padding).
    pub stride: usize,
    pub pixel_format: PixelFormat,
    /// Driver-assigned sequence number.
    pub block_id: u64,
    pub data: Vec<u8>,
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("pixel_format", &self.pixel_format)
            .field("block_id", &self.block_id)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Result of one retrieval attempt.
#[derive(Debug)]
pub struct RawGrab {
    pub succeeded: bool,
    pub payload: Option<RawFrame>,
    /// Driver's description of an unsuccessful grab.
    pub error: Option<String>,
}

impl RawGrab {
    pub fn success(frame: RawFrame) -> Self {
        Self {
            succeeded: true,
            payload: Some(frame),
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            payload: None,
            error: Some(reason.into()),
        }
    }

    pub fn timed_out() -> Self {
        Self {
            succeeded: false,
            payload: None,
            error: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        !self.succeeded && self.error.is_none()
    }

    /// Payload of a successful grab.
    pub fn into_frame(self) -> Option<RawFrame> {
        if self.succeeded {
            self.payload
        } else {
            None
        }
    }
}

/// A decoded frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub format: SurfaceFormat,
    pub block_id: u64,
    pixels: Vec<u8>,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        format: SurfaceFormat,
        block_id: u64,
        pixels: Vec<u8>,
    ) -> Self {
        Self {
            width,
            height,
            stride: width as usize * format.bytes_per_pixel(),
            format,
            block_id,
            pixels,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.stride >= self.width as usize * self.format.bytes_per_pixel()
            && self.pixels.len() >= self.stride * self.height as usize
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("block_id", &self.block_id)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}
