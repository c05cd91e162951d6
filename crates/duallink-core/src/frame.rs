//! Frame containers shared by the capture and encode stages.
//!
//! # I420 layout
//!
//! ```text
//! ┌──────────────────────────┐  stride_y × height
//! │            Y             │
//! ├─────────────┬────────────┘
//! │      U      │               stride_u × ⌈height / 2⌉
//! ├─────────────┤
//! │      V      │               stride_v × ⌈height / 2⌉
//! └─────────────┘
//! ```
//!
//! All three planes live in one contiguous allocation.

use bytes::Bytes;

use crate::types::{Resolution, VideoCodec};

/// Bytes needed for an I420 image with the given plane strides.
pub fn i420_data_size(height: u32, stride_y: usize, stride_u: usize, stride_v: usize) -> usize {
    let height = height as usize;
    stride_y * height + (stride_u + stride_v) * height.div_ceil(2)
}

// MARK: - I420Buffer

/// Planar YUV 4:2:0 frame produced by the colour converter.
#[derive(Clone)]
pub struct I420Buffer {
    width:        u32,
    height:       u32,
    stride_y:     usize,
    stride_u:     usize,
    stride_v:     usize,
    data:         Vec<u8>,
    timestamp_us: u64,
}

impl I420Buffer {
    /// Tightly packed buffer: `stride_y = width`, chroma strides `⌈width / 2⌉`.
    pub fn new(width: u32, height: u32) -> Self {
        let stride_uv = (width as usize).div_ceil(2);
        Self::with_strides(width, height, width as usize, stride_uv, stride_uv)
    }

    /// Buffer with explicit strides. Strides narrower than the plane width are
    /// widened to the minimum.
    pub fn with_strides(
        width: u32,
        height: u32,
        stride_y: usize,
        stride_u: usize,
        stride_v: usize,
    ) -> Self {
        let chroma_width = (width as usize).div_ceil(2);
        let stride_y = stride_y.max(width as usize);
        let stride_u = stride_u.max(chroma_width);
        let stride_v = stride_v.max(chroma_width);
        let size = i420_data_size(height, stride_y, stride_u, stride_v);
        Self {
            width,
            height,
            stride_y,
            stride_u,
            stride_v,
            data: vec![0; size],
            timestamp_us: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn stride_y(&self) -> usize {
        self.stride_y
    }

    pub fn stride_u(&self) -> usize {
        self.stride_u
    }

    pub fn stride_v(&self) -> usize {
        self.stride_v
    }

    /// Allocated bytes backing the three planes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn chroma_width(&self) -> usize {
        (self.width as usize).div_ceil(2)
    }

    pub fn chroma_height(&self) -> usize {
        (self.height as usize).div_ceil(2)
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn set_timestamp_us(&mut self, timestamp_us: u64) {
        self.timestamp_us = timestamp_us;
    }

    fn y_len(&self) -> usize {
        self.stride_y * self.height as usize
    }

    fn u_len(&self) -> usize {
        self.stride_u * self.chroma_height()
    }

    fn v_len(&self) -> usize {
        self.stride_v * self.chroma_height()
    }

    pub fn data_y(&self) -> &[u8] {
        &self.data[..self.y_len()]
    }

    pub fn data_u(&self) -> &[u8] {
        let start = self.y_len();
        &self.data[start..start + self.u_len()]
    }

    pub fn data_v(&self) -> &[u8] {
        let start = self.y_len() + self.u_len();
        &self.data[start..start + self.v_len()]
    }

    /// Mutable views of the Y, U and V planes.
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let (y_len, u_len, v_len) = (self.y_len(), self.u_len(), self.v_len());
        let (y, rest) = self.data.split_at_mut(y_len);
        let (u, rest) = rest.split_at_mut(u_len);
        (y, u, &mut rest[..v_len])
    }
}

impl std::fmt::Debug for I420Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I420Buffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride_y", &self.stride_y)
            .field("stride_u", &self.stride_u)
            .field("stride_v", &self.stride_v)
            .field("capacity", &self.data.len())
            .field("timestamp_us", &self.timestamp_us)
            .finish()
    }
}

// MARK: - FrameType

/// Frame type hint passed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Key,
    Delta,
}

// MARK: - EncodedImage

/// One compressed access unit surfaced to the encoded-image callback.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// H.264 Annex-B byte stream (start-code delimited NAL units).
    pub data: Bytes,
    pub is_keyframe: bool,
    pub width: u32,
    pub height: u32,
    pub timestamp_us: u64,
    pub codec: VideoCodec,
}

impl EncodedImage {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
