use std::sync::Arc;
use std::time::Duration;

use duallink_core::{EncoderBackend, EncoderError, EncoderQuality, FrameType, I420Buffer, VideoCodec};

/// Interval between forced IDR frames requested from the backend.
pub const KEY_FRAME_INTERVAL: Duration = Duration::from_millis(1200);

/// RTP clock rate for video payloads.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

// ── Codec settings ────────────────────────────────────────────────────────────

/// Parameters handed to [`VideoEncoder::init_encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct CodecSettings {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub clock_rate: u32,
    pub start_bitrate_kbps: u32,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub max_framerate: u32,
    pub quality: EncoderQuality,
    /// SDP format parameters (`profile-level-id`, `packetization-mode`, ...).
    pub format_params: Vec<(&'static str, &'static str)>,
}

impl CodecSettings {
    /// Constrained Baseline 3.1, non-interleaved packetization.
    pub fn h264(width: u32, height: u32) -> Self {
        Self {
            codec: VideoCodec::H264,
            width,
            height,
            clock_rate: VIDEO_CLOCK_RATE,
            start_bitrate_kbps: 0,
            min_bitrate_kbps: 0,
            max_bitrate_kbps: 0,
            max_framerate: 0,
            quality: EncoderQuality::default(),
            format_params: vec![
                ("level-asymmetry-allowed", "1"),
                ("packetization-mode", "1"),
                ("profile-level-id", "42e01f"),
            ],
        }
    }

    pub fn format_param(&self, key: &str) -> Option<&'static str> {
        self.format_params.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// Key interval expressed in frames at `max_framerate`, never below one.
    pub fn key_interval_frames(&self, key_interval: Duration) -> u32 {
        let frames = key_interval.as_millis() as u64 * self.max_framerate.max(1) as u64 / 1000;
        frames.max(1) as u32
    }
}

// ── VideoEncoder ──────────────────────────────────────────────────────────────

/// One chunk of encoder output. Keyframe classification is left to the caller.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Annex-B byte stream.
    pub data: Vec<u8>,
    pub timestamp_us: u64,
}

/// Encoder backend capability.
///
/// `encode` is synchronous: whatever the backend has produced for the
/// submitted frame is returned from the call. Backends with internal latency
/// may return an empty vector and emit the packet on a later call.
pub trait VideoEncoder: Send {
    /// Element or library name, for logging.
    fn name(&self) -> &str;

    fn is_hardware_accelerated(&self) -> bool;

    fn init_encode(
        &mut self,
        settings: &CodecSettings,
        core_count: usize,
        key_interval: Duration,
    ) -> Result<(), EncoderError>;

    fn encode(
        &mut self,
        frame: &I420Buffer,
        frame_type: FrameType,
    ) -> Result<Vec<EncodedPacket>, EncoderError>;

    fn set_rates(&mut self, bitrate_kbps: u32, framerate: u32) -> Result<(), EncoderError>;

    /// Tear down the backend. Must be safe to call more than once.
    fn release(&mut self);
}

/// Creates an uninitialized backend of the requested family.
pub type EncoderFactory =
    Arc<dyn Fn(EncoderBackend) -> Result<Box<dyn VideoEncoder>, EncoderError> + Send + Sync>;

/// Factory backed by GStreamer element detection.
#[cfg(feature = "gstreamer")]
pub fn default_encoder_factory() -> EncoderFactory {
    Arc::new(|backend| {
        let encoder = crate::gst::GstH264Encoder::detect(backend)?;
        Ok(Box::new(encoder) as Box<dyn VideoEncoder>)
    })
}

/// Without the `gstreamer` feature there is no built-in backend.
#[cfg(not(feature = "gstreamer"))]
pub fn default_encoder_factory() -> EncoderFactory {
    Arc::new(|backend| {
        Err(EncoderError::BackendUnavailable {
            backend: format!("{backend} (built without the `gstreamer` feature)"),
        })
    })
}
