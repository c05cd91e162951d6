//! H.264 encoding for desktop capture sessions.
//!
//! [`EncodeAdapter`] owns the encoder session: it initializes a
//! [`VideoEncoder`] backend lazily on the first frame, forwards frames,
//! and classifies keyframes from the bitstream it gets back.
//!
//! Backends are produced by an [`EncoderFactory`]. With the `gstreamer`
//! feature, [`default_encoder_factory`] detects the installed GStreamer
//! H.264 encoders (VA-API, NVENC, Quick Sync, x264, OpenH264).

pub mod adapter;
pub mod backend;
pub mod dump;
pub mod h264;

#[cfg(feature = "gstreamer")]
pub mod gst;

pub use adapter::{EncodeAdapter, EncoderConfig};
pub use backend::{
    default_encoder_factory, CodecSettings, EncodedPacket, EncoderFactory, VideoEncoder,
    KEY_FRAME_INTERVAL,
};
