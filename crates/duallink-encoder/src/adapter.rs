use std::path::PathBuf;

use bytes::Bytes;
use duallink_core::{
    CaptureParameters, EncodedImage, EncoderBackend, EncoderError, EncoderQuality, FrameType,
    I420Buffer, VideoCodec,
};
use tracing::{debug, error, info, warn};

use crate::backend::{CodecSettings, EncoderFactory, VideoEncoder, KEY_FRAME_INTERVAL};
use crate::dump::BitstreamDump;
use crate::h264;

// ── EncoderConfig ─────────────────────────────────────────────────────────────

/// Encoder-facing subset of [`CaptureParameters`], with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub backend: EncoderBackend,
    pub quality: EncoderQuality,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub max_framerate: u32,
    pub dump_path: Option<PathBuf>,
}

impl EncoderConfig {
    pub fn from_parameters(params: &CaptureParameters) -> Self {
        let min_bitrate_kbps = params.effective_min_bitrate_kbps();
        if params.min_bitrate_kbps > 0 && min_bitrate_kbps < params.min_bitrate_kbps {
            warn!(
                "minBitrate {} kbps exceeds maxBitrate; clamped to {} kbps",
                params.min_bitrate_kbps, min_bitrate_kbps
            );
        }
        Self {
            backend: params.encoder_backend,
            quality: params.encoder_quality,
            min_bitrate_kbps,
            max_bitrate_kbps: params.effective_max_bitrate_kbps(),
            max_framerate: params.effective_fps(),
            dump_path: params.encoded_file_path.clone(),
        }
    }

    fn clamp_bitrate(&self, kbps: u32) -> u32 {
        kbps.max(self.min_bitrate_kbps).min(self.max_bitrate_kbps)
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::from_parameters(&CaptureParameters::default())
    }
}

// ── EncodeSession ─────────────────────────────────────────────────────────────

struct EncodeSession {
    encoder:          Box<dyn VideoEncoder>,
    width:            u32,
    height:           u32,
    min_bitrate_kbps: u32,
    max_bitrate_kbps: u32,
    max_framerate:    u32,
    core_count:       usize,
    next_frame_type:  FrameType,
}

enum SessionSlot {
    Empty,
    Active(EncodeSession),
    /// Init failed; frames are dropped until the next `configure`.
    Failed,
}

// ── EncodeAdapter ─────────────────────────────────────────────────────────────

/// Lazily initialized H.264 encoder session.
///
/// The backend is created on the first [`encode_frame`](Self::encode_frame)
/// call, using that frame's geometry. A later frame with a different
/// geometry tears the session down and initializes a new one, starting
/// with a keyframe.
pub struct EncodeAdapter {
    factory:             EncoderFactory,
    config:              EncoderConfig,
    target_bitrate_kbps: Option<u32>,
    session:             SessionSlot,
    pending_keyframe:    bool,
    dump:                Option<BitstreamDump>,
}

impl EncodeAdapter {
    pub fn new(factory: EncoderFactory) -> Self {
        Self {
            factory,
            config: EncoderConfig::default(),
            target_bitrate_kbps: None,
            session: SessionSlot::Empty,
            pending_keyframe: false,
            dump: None,
        }
    }

    /// `true` while a backend is initialized and accepting frames.
    pub fn is_initialized(&self) -> bool {
        matches!(self.session, SessionSlot::Active(_))
    }

    pub fn encoder_name(&self) -> Option<&str> {
        match &self.session {
            SessionSlot::Active(session) => Some(session.encoder.name()),
            _ => None,
        }
    }

    /// Apply the parameters of a newly started capture session.
    ///
    /// Clears a previous init failure. A live session keeps running with the
    /// new rates unless the backend family changed.
    pub fn configure(&mut self, config: EncoderConfig) {
        if matches!(self.session, SessionSlot::Failed) {
            self.session = SessionSlot::Empty;
        }

        let backend_changed = config.backend != self.config.backend;
        let dump_changed = config.dump_path != self.config.dump_path || self.dump.is_none();
        self.config = config;
        self.target_bitrate_kbps = None;

        if dump_changed {
            self.dump = self.config.dump_path.as_deref().and_then(|path| {
                BitstreamDump::open(path)
                    .map_err(|e| warn!("Cannot open encoded dump {}: {}", path.display(), e))
                    .ok()
            });
        }

        if backend_changed {
            self.release();
            return;
        }

        let start_bitrate = self.start_bitrate_kbps();
        if let SessionSlot::Active(session) = &mut self.session {
            session.min_bitrate_kbps = self.config.min_bitrate_kbps;
            session.max_bitrate_kbps = self.config.max_bitrate_kbps;
            session.max_framerate = self.config.max_framerate;
            if let Err(e) = session.encoder.set_rates(start_bitrate, session.max_framerate) {
                warn!("Encoder {} rejected new rates: {}", session.encoder.name(), e);
            }
        }
    }

    /// Update the target bitrate (clamped to the configured bounds) and
    /// framerate. `0` leaves the framerate unchanged.
    pub fn set_rates(&mut self, bitrate_kbps: u32, framerate: u32) {
        let bitrate = self.config.clamp_bitrate(bitrate_kbps);
        if bitrate != bitrate_kbps {
            debug!("Requested {} kbps clamped to {} kbps", bitrate_kbps, bitrate);
        }
        if framerate > 0 {
            self.config.max_framerate = framerate;
        }
        self.target_bitrate_kbps = Some(bitrate);

        if let SessionSlot::Active(session) = &mut self.session {
            session.max_framerate = self.config.max_framerate;
            if let Err(e) = session.encoder.set_rates(bitrate, session.max_framerate) {
                warn!("Encoder {} rejected new rates: {}", session.encoder.name(), e);
            }
        }
    }

    /// Ask for the next encoded frame to be a keyframe.
    pub fn request_keyframe(&mut self) {
        match &mut self.session {
            SessionSlot::Active(session) => session.next_frame_type = FrameType::Key,
            _ => self.pending_keyframe = true,
        }
    }

    /// Tear down the encoder session. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let SessionSlot::Active(mut session) =
            std::mem::replace(&mut self.session, SessionSlot::Empty)
        {
            session.encoder.release();
            info!("H.264 encoder {} released", session.encoder.name());
        }
        if let Some(dump) = self.dump.as_mut() {
            dump.flush();
        }
    }

    /// Encode one frame. Returns the access units the backend produced,
    /// which may be none.
    pub fn encode_frame(&mut self, frame: &I420Buffer) -> Vec<EncodedImage> {
        if matches!(self.session, SessionSlot::Failed) {
            return Vec::new();
        }

        if let SessionSlot::Active(session) = &self.session {
            if (session.width, session.height) != (frame.width(), frame.height()) {
                info!(
                    "Frame geometry changed {}×{} → {}×{}; reinitializing encoder",
                    session.width, session.height, frame.width(), frame.height()
                );
                self.release();
                self.pending_keyframe = true;
            }
        }

        if matches!(self.session, SessionSlot::Empty) {
            match self.init_session(frame.width(), frame.height()) {
                Ok(session) => self.session = SessionSlot::Active(session),
                Err(e) => {
                    error!("H.264 encoder init failed: {}", e);
                    self.session = SessionSlot::Failed;
                    return Vec::new();
                }
            }
        }

        let SessionSlot::Active(session) = &mut self.session else {
            return Vec::new();
        };

        let frame_type = std::mem::replace(&mut session.next_frame_type, FrameType::Delta);
        let packets = match session.encoder.encode(frame, frame_type) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("Encoder {} dropped frame: {}", session.encoder.name(), e);
                return Vec::new();
            }
        };

        let mut images = Vec::with_capacity(packets.len());
        for packet in packets {
            if packet.data.is_empty() {
                continue;
            }
            if let Some(dump) = self.dump.as_mut() {
                dump.write(&packet.data);
            }
            images.push(EncodedImage {
                is_keyframe: h264::is_keyframe(&packet.data),
                data: Bytes::from(packet.data),
                width: session.width,
                height: session.height,
                timestamp_us: packet.timestamp_us,
                codec: VideoCodec::H264,
            });
        }
        images
    }

    fn start_bitrate_kbps(&self) -> u32 {
        self.target_bitrate_kbps.unwrap_or(self.config.min_bitrate_kbps)
    }

    fn init_session(&mut self, width: u32, height: u32) -> Result<EncodeSession, EncoderError> {
        let mut encoder = (self.factory)(self.config.backend)?;

        let mut settings = CodecSettings::h264(width, height);
        settings.start_bitrate_kbps = self.start_bitrate_kbps();
        settings.min_bitrate_kbps = self.config.min_bitrate_kbps;
        settings.max_bitrate_kbps = self.config.max_bitrate_kbps;
        settings.max_framerate = self.config.max_framerate;
        settings.quality = self.config.quality;

        let core_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        if let Err(e) = encoder.init_encode(&settings, core_count, KEY_FRAME_INTERVAL) {
            encoder.release();
            return Err(e);
        }

        info!(
            "{} encoder {} ready: {}×{} @{}fps {}-{} kbps (hw={})",
            settings.codec.payload_name(),
            encoder.name(),
            width,
            height,
            settings.max_framerate,
            settings.min_bitrate_kbps,
            settings.max_bitrate_kbps,
            encoder.is_hardware_accelerated()
        );

        let next_frame_type = if std::mem::take(&mut self.pending_keyframe) {
            FrameType::Key
        } else {
            FrameType::Delta
        };

        Ok(EncodeSession {
            encoder,
            width,
            height,
            min_bitrate_kbps: settings.min_bitrate_kbps,
            max_bitrate_kbps: settings.max_bitrate_kbps,
            max_framerate: settings.max_framerate,
            core_count,
            next_frame_type,
        })
    }
}

impl Drop for EncodeAdapter {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for EncodeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("EncodeAdapter");
        s.field("config", &self.config);
        match &self.session {
            SessionSlot::Empty => s.field("session", &"empty"),
            SessionSlot::Failed => s.field("session", &"failed"),
            SessionSlot::Active(session) => s
                .field("encoder", &session.encoder.name())
                .field("geometry", &(session.width, session.height))
                .field("bitrate_kbps", &(session.min_bitrate_kbps, session.max_bitrate_kbps))
                .field("core_count", &session.core_count),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::backend::EncodedPacket;

    const IDR_AU: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x65, 0x88];
    const DELTA_AU: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A];

    #[derive(Default)]
    struct Log {
        created:    usize,
        inits:      Vec<CodecSettings>,
        frames:     Vec<FrameType>,
        rates:      Vec<(u32, u32)>,
        releases:   usize,
        fail_init:  bool,
        /// Emit an IDR on this frame index regardless of the hint.
        idr_at:     Option<usize>,
    }

    struct MockEncoder(Arc<Mutex<Log>>);

    impl VideoEncoder for MockEncoder {
        fn name(&self) -> &str {
            "mock"
        }

        fn is_hardware_accelerated(&self) -> bool {
            false
        }

        fn init_encode(
            &mut self,
            settings: &CodecSettings,
            _core_count: usize,
            _key_interval: Duration,
        ) -> Result<(), EncoderError> {
            let mut log = self.0.lock().unwrap();
            log.inits.push(settings.clone());
            if log.fail_init {
                return Err(EncoderError::InitFailed { reason: "mock".into() });
            }
            Ok(())
        }

        fn encode(
            &mut self,
            frame: &I420Buffer,
            frame_type: FrameType,
        ) -> Result<Vec<EncodedPacket>, EncoderError> {
            let mut log = self.0.lock().unwrap();
            let index = log.frames.len();
            log.frames.push(frame_type);
            let idr = frame_type == FrameType::Key || log.idr_at == Some(index);
            let data = if idr { IDR_AU } else { DELTA_AU };
            Ok(vec![EncodedPacket { data: data.to_vec(), timestamp_us: frame.timestamp_us() }])
        }

        fn set_rates(&mut self, bitrate_kbps: u32, framerate: u32) -> Result<(), EncoderError> {
            self.0.lock().unwrap().rates.push((bitrate_kbps, framerate));
            Ok(())
        }

        fn release(&mut self) {
            self.0.lock().unwrap().releases += 1;
        }
    }

    fn adapter() -> (EncodeAdapter, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let factory_log = log.clone();
        let factory: EncoderFactory = Arc::new(move |_backend| {
            factory_log.lock().unwrap().created += 1;
            Ok(Box::new(MockEncoder(factory_log.clone())) as Box<dyn VideoEncoder>)
        });
        (EncodeAdapter::new(factory), log)
    }

    #[test]
    fn initializes_lazily_with_first_frame_geometry() {
        let (mut adapter, log) = adapter();
        adapter.configure(EncoderConfig::from_parameters(&CaptureParameters {
            fps: 0,
            max_bitrate_kbps: 0,
            min_bitrate_kbps: 0,
            ..Default::default()
        }));
        assert!(!adapter.is_initialized());
        assert_eq!(log.lock().unwrap().created, 0);

        let images = adapter.encode_frame(&I420Buffer::new(1280, 720));
        assert!(adapter.is_initialized());
        assert_eq!(images.len(), 1);
        assert_eq!((images[0].width, images[0].height), (1280, 720));

        let log = log.lock().unwrap();
        let settings = &log.inits[0];
        assert_eq!((settings.width, settings.height), (1280, 720));
        assert_eq!(settings.min_bitrate_kbps, 3000);
        assert_eq!(settings.max_bitrate_kbps, 6000);
        assert_eq!(settings.start_bitrate_kbps, 3000);
        assert_eq!(settings.max_framerate, 30);
        assert_eq!(log.frames, vec![FrameType::Delta]);
    }

    #[test]
    fn keyframe_flag_comes_from_bitstream() {
        let (mut adapter, log) = adapter();
        log.lock().unwrap().idr_at = Some(2);
        let frame = I420Buffer::new(64, 64);

        let flags: Vec<bool> = (0..4)
            .flat_map(|_| adapter.encode_frame(&frame))
            .map(|image| image.is_keyframe)
            .collect();
        assert_eq!(flags, vec![false, false, true, false]);
        assert!(log.lock().unwrap().frames.iter().all(|t| *t == FrameType::Delta));
    }

    #[test]
    fn init_failure_drops_frames_until_reconfigured() {
        let (mut adapter, log) = adapter();
        log.lock().unwrap().fail_init = true;
        let frame = I420Buffer::new(64, 64);

        assert!(adapter.encode_frame(&frame).is_empty());
        assert!(adapter.encode_frame(&frame).is_empty());
        assert!(!adapter.is_initialized());
        {
            let log = log.lock().unwrap();
            assert_eq!(log.created, 1);
            assert_eq!(log.releases, 1);
            assert!(log.frames.is_empty());
        }

        log.lock().unwrap().fail_init = false;
        adapter.configure(EncoderConfig::default());
        assert_eq!(adapter.encode_frame(&frame).len(), 1);
        assert_eq!(log.lock().unwrap().created, 2);
    }

    #[test]
    fn geometry_change_reinitializes_with_keyframe() {
        let (mut adapter, log) = adapter();
        adapter.encode_frame(&I420Buffer::new(800, 600));
        adapter.encode_frame(&I420Buffer::new(800, 600));
        let images = adapter.encode_frame(&I420Buffer::new(1024, 768));

        assert_eq!((images[0].width, images[0].height), (1024, 768));
        assert!(images[0].is_keyframe);
        let log = log.lock().unwrap();
        assert_eq!(log.inits.len(), 2);
        assert_eq!(log.releases, 1);
        assert_eq!(log.frames, vec![FrameType::Delta, FrameType::Delta, FrameType::Key]);
    }

    #[test]
    fn requested_keyframe_applies_once() {
        let (mut adapter, log) = adapter();
        let frame = I420Buffer::new(64, 64);
        adapter.request_keyframe();
        adapter.encode_frame(&frame);
        adapter.encode_frame(&frame);
        adapter.request_keyframe();
        adapter.encode_frame(&frame);
        adapter.encode_frame(&frame);
        assert_eq!(
            log.lock().unwrap().frames,
            vec![FrameType::Key, FrameType::Delta, FrameType::Key, FrameType::Delta]
        );
    }

    #[test]
    fn rates_are_clamped_and_forwarded() {
        let (mut adapter, log) = adapter();
        adapter.configure(EncoderConfig::from_parameters(&CaptureParameters {
            min_bitrate_kbps: 2000,
            max_bitrate_kbps: 4000,
            ..Default::default()
        }));
        adapter.set_rates(10_000, 0);
        adapter.encode_frame(&I420Buffer::new(64, 64));
        assert_eq!(log.lock().unwrap().inits[0].start_bitrate_kbps, 4000);

        adapter.set_rates(500, 15);
        assert_eq!(log.lock().unwrap().rates, vec![(2000, 15)]);
    }

    #[test]
    fn release_is_idempotent() {
        let (mut adapter, log) = adapter();
        adapter.release();
        adapter.encode_frame(&I420Buffer::new(64, 64));
        adapter.release();
        adapter.release();
        assert!(!adapter.is_initialized());
        assert_eq!(log.lock().unwrap().releases, 1);
    }

    #[test]
    fn encoded_stream_is_appended_to_the_dump_file() {
        let path = std::env::temp_dir().join(format!("duallink-adapter-dump-{}.h264", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let (mut adapter, log) = adapter();
        log.lock().unwrap().idr_at = Some(0);
        adapter.configure(EncoderConfig { dump_path: Some(path.clone()), ..EncoderConfig::default() });

        let frame = I420Buffer::new(64, 64);
        let mut delivered = Vec::new();
        for _ in 0..2 {
            for image in adapter.encode_frame(&frame) {
                delivered.extend_from_slice(&image.data);
            }
        }
        adapter.release();

        let written = std::fs::read(&path).expect("read dump");
        assert_eq!(written, [IDR_AU, DELTA_AU].concat());
        assert_eq!(written, delivered);
        let _ = std::fs::remove_file(&path);
    }
}
