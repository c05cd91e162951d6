//! GStreamer H.264 encoder backends.
//!
//! # Encoder priority (highest to lowest)
//!
//! | Encoder        | Backend     | Notes |
//! |----------------|-------------|-------|
//! | `vaapih264enc` | VA-API HW   | Intel / AMD, gstreamer-vaapi |
//! | `vah264enc`    | VA HW       | Intel / AMD, newer `va` plugin |
//! | `nvh264enc`    | NVENC HW    | NVIDIA GPU |
//! | `qsvh264enc`   | Quick Sync  | Intel oneVPL |
//! | `x264enc`      | Software    | gst-plugins-ugly |
//! | `openh264enc`  | Software    | Cisco OpenH264 |
//!
//! A hardware request falls back to software when no hardware element is
//! installed.
//!
//! # Pipeline
//!
//! ```text
//! appsrc (I420, caps from VideoInfo)
//!   → <encoder>
//!   → video/x-h264,stream-format=byte-stream,alignment=au
//!   → h264parse config-interval=-1   (SPS/PPS before every IDR)
//!   → appsink
//! ```

use std::time::Duration;

use duallink_core::{EncoderBackend, EncoderError, EncoderQuality, FrameType, I420Buffer};
use gstreamer::{self as gst, prelude::*};
use gstreamer_app::{AppSink, AppSrc};
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::backend::{CodecSettings, EncodedPacket, VideoEncoder};

// ── Encoder candidates ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitrateUnit {
    Kbps,
    Bps,
}

/// One GStreamer H.264 encoder element and how to drive it.
#[derive(Debug, Clone, Copy)]
pub struct EncoderCandidate {
    pub element:       &'static str,
    pub hardware:      bool,
    base_props:        &'static str,
    /// Property strings for speed / balanced / quality.
    presets:           [&'static str; 3],
    bitrate_unit:      BitrateUnit,
    key_interval_prop: &'static str,
    threads_prop:      Option<&'static str>,
}

const HARDWARE_CANDIDATES: &[EncoderCandidate] = &[
    EncoderCandidate {
        element:           "vaapih264enc",
        hardware:          true,
        base_props:        "rate-control=cbr",
        presets:           ["quality-level=7", "quality-level=4", "quality-level=1"],
        bitrate_unit:      BitrateUnit::Kbps,
        key_interval_prop: "keyframe-period",
        threads_prop:      None,
    },
    EncoderCandidate {
        element:           "vah264enc",
        hardware:          true,
        base_props:        "rate-control=cbr",
        presets:           ["target-usage=7", "target-usage=4", "target-usage=1"],
        bitrate_unit:      BitrateUnit::Kbps,
        key_interval_prop: "key-int-max",
        threads_prop:      None,
    },
    EncoderCandidate {
        element:           "nvh264enc",
        hardware:          true,
        base_props:        "rc-mode=cbr zerolatency=true",
        presets:           ["preset=low-latency-hp", "preset=low-latency-hq", "preset=hq"],
        bitrate_unit:      BitrateUnit::Kbps,
        key_interval_prop: "gop-size",
        threads_prop:      None,
    },
    EncoderCandidate {
        element:           "qsvh264enc",
        hardware:          true,
        base_props:        "rate-control=cbr",
        presets:           ["target-usage=7", "target-usage=4", "target-usage=1"],
        bitrate_unit:      BitrateUnit::Kbps,
        key_interval_prop: "gop-size",
        threads_prop:      None,
    },
];

const SOFTWARE_CANDIDATES: &[EncoderCandidate] = &[
    EncoderCandidate {
        element:           "x264enc",
        hardware:          false,
        base_props:        "tune=zerolatency",
        presets:           ["speed-preset=ultrafast", "speed-preset=veryfast", "speed-preset=medium"],
        bitrate_unit:      BitrateUnit::Kbps,
        key_interval_prop: "key-int-max",
        threads_prop:      Some("threads"),
    },
    EncoderCandidate {
        element:           "openh264enc",
        hardware:          false,
        base_props:        "usage-type=screen rate-control=bitrate",
        presets:           ["complexity=low", "complexity=medium", "complexity=high"],
        bitrate_unit:      BitrateUnit::Bps,
        key_interval_prop: "gop-size",
        threads_prop:      Some("multi-thread"),
    },
];

impl EncoderCandidate {
    fn bitrate_value(&self, kbps: u32) -> u32 {
        match self.bitrate_unit {
            BitrateUnit::Kbps => kbps,
            BitrateUnit::Bps => kbps.saturating_mul(1000),
        }
    }

    fn preset(&self, quality: EncoderQuality) -> &'static str {
        match quality {
            EncoderQuality::Speed => self.presets[0],
            EncoderQuality::Balanced => self.presets[1],
            EncoderQuality::Quality => self.presets[2],
        }
    }

    fn pipeline_description(
        &self,
        settings: &CodecSettings,
        core_count: usize,
        key_interval: Duration,
    ) -> String {
        let start_kbps = settings.start_bitrate_kbps.max(settings.min_bitrate_kbps);
        let mut encoder = format!(
            "{} name=enc {} {} bitrate={} {}={}",
            self.element,
            self.base_props,
            self.preset(settings.quality),
            self.bitrate_value(start_kbps),
            self.key_interval_prop,
            settings.key_interval_frames(key_interval),
        );
        if let Some(threads) = self.threads_prop {
            encoder.push_str(&format!(" {threads}={core_count}"));
        }

        format!(
            "appsrc name=src is-live=true format=time \
             ! {encoder} \
             ! video/x-h264,stream-format=byte-stream,alignment=au \
             ! h264parse config-interval=-1 \
             ! appsink name=sink sync=false max-buffers=8 drop=false"
        )
    }
}

fn candidates_for(backend: EncoderBackend) -> impl Iterator<Item = &'static EncoderCandidate> {
    let hardware: &'static [EncoderCandidate] = match backend {
        EncoderBackend::Hardware => HARDWARE_CANDIDATES,
        EncoderBackend::Software => &[],
    };
    hardware.iter().chain(SOFTWARE_CANDIDATES.iter())
}

// ── GstH264Encoder ────────────────────────────────────────────────────────────

struct RunningPipeline {
    pipeline:       gst::Pipeline,
    appsrc:         AppSrc,
    appsink:        AppSink,
    encoder:        gst::Element,
    info:           gst_video::VideoInfo,
    frame_duration: gst::ClockTime,
}

impl RunningPipeline {
    fn fill_buffer(&self, frame: &I420Buffer) -> Result<gst::Buffer, EncoderError> {
        let failed = |reason: String| EncoderError::EncodeFailed { reason };

        let mut buffer = gst::Buffer::with_size(self.info.size())
            .map_err(|e| failed(format!("allocating buffer: {e}")))?;
        {
            let buffer_mut = buffer
                .get_mut()
                .ok_or_else(|| failed("buffer not writable".into()))?;
            buffer_mut.set_pts(gst::ClockTime::from_useconds(frame.timestamp_us()));
            buffer_mut.set_duration(self.frame_duration);

            let mut vframe =
                gst_video::VideoFrameRef::from_buffer_ref_writable(buffer_mut, &self.info)
                    .map_err(|e| failed(format!("mapping video frame: {e}")))?;

            let planes = [
                (frame.data_y(), frame.stride_y(), frame.width() as usize, frame.height() as usize),
                (frame.data_u(), frame.stride_u(), frame.chroma_width(), frame.chroma_height()),
                (frame.data_v(), frame.stride_v(), frame.chroma_width(), frame.chroma_height()),
            ];
            for (index, (src, src_stride, row_bytes, rows)) in planes.into_iter().enumerate() {
                let dst_stride = vframe.plane_stride()[index] as usize;
                let dst = vframe
                    .plane_data_mut(index as u32)
                    .map_err(|e| failed(format!("plane {index}: {e}")))?;
                for row in 0..rows {
                    let d = row * dst_stride;
                    let s = row * src_stride;
                    dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
                }
            }
        }
        Ok(buffer)
    }

    fn force_keyframe(&self) {
        let event = gst_video::DownstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        let sent = self
            .encoder
            .static_pad("sink")
            .map(|pad| pad.send_event(event))
            .unwrap_or(false);
        if !sent {
            debug!("Force-key-unit event not handled");
        }
    }

    fn shutdown(self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// H.264 encoder running a GStreamer pipeline per initialized session.
pub struct GstH264Encoder {
    candidate: EncoderCandidate,
    running:   Option<RunningPipeline>,
}

impl GstH264Encoder {
    /// Pick the best installed encoder element for `backend`.
    pub fn detect(backend: EncoderBackend) -> Result<Self, EncoderError> {
        gst::init().map_err(|e| EncoderError::GStreamerPipeline(e.to_string()))?;

        let candidate = candidates_for(backend)
            .find(|c| gst::ElementFactory::find(c.element).is_some())
            .copied()
            .ok_or_else(|| EncoderError::BackendUnavailable { backend: backend.to_string() })?;

        if backend == EncoderBackend::Hardware && !candidate.hardware {
            warn!("No hardware H.264 encoder found; falling back to {}", candidate.element);
        }
        info!("H.264 encoder selected: {}", candidate.element);
        Ok(Self { candidate, running: None })
    }
}

impl VideoEncoder for GstH264Encoder {
    fn name(&self) -> &str {
        self.candidate.element
    }

    fn is_hardware_accelerated(&self) -> bool {
        self.candidate.hardware
    }

    fn init_encode(
        &mut self,
        settings: &CodecSettings,
        core_count: usize,
        key_interval: Duration,
    ) -> Result<(), EncoderError> {
        self.release();
        let init_failed = |reason: String| EncoderError::InitFailed { reason };

        let fps = settings.max_framerate.max(1);
        let info = gst_video::VideoInfo::builder(
            gst_video::VideoFormat::I420,
            settings.width,
            settings.height,
        )
        .fps(gst::Fraction::new(fps as i32, 1))
        .build()
        .map_err(|e| init_failed(format!("video info: {e}")))?;
        let caps = info.to_caps().map_err(|e| init_failed(format!("caps: {e}")))?;

        let desc = self.candidate.pipeline_description(settings, core_count, key_interval);
        debug!("Encoder pipeline: {}", desc);

        let pipeline = gst::parse::launch(&desc)
            .map_err(|e| EncoderError::GStreamerPipeline(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| EncoderError::GStreamerPipeline("expected a Pipeline".into()))?;
        let element = |name: &str| {
            pipeline
                .by_name(name)
                .ok_or_else(|| EncoderError::GStreamerPipeline(format!("missing element '{name}'")))
        };
        let appsrc = element("src")?
            .downcast::<AppSrc>()
            .map_err(|_| EncoderError::GStreamerPipeline("expected AppSrc".into()))?;
        let appsink = element("sink")?
            .downcast::<AppSink>()
            .map_err(|_| EncoderError::GStreamerPipeline("expected AppSink".into()))?;
        let encoder = element("enc")?;

        appsrc.set_caps(Some(&caps));
        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(init_failed(format!("pipeline → Playing: {e}")));
        }

        info!(
            "Encoder pipeline running: {}×{} @{}fps {} kbps ({})",
            settings.width,
            settings.height,
            fps,
            settings.start_bitrate_kbps,
            self.candidate.element
        );
        self.running = Some(RunningPipeline {
            pipeline,
            appsrc,
            appsink,
            encoder,
            info,
            frame_duration: gst::ClockTime::from_useconds(1_000_000 / fps as u64),
        });
        Ok(())
    }

    fn encode(
        &mut self,
        frame: &I420Buffer,
        frame_type: FrameType,
    ) -> Result<Vec<EncodedPacket>, EncoderError> {
        let running = self.running.as_ref().ok_or(EncoderError::NotInitialized)?;
        if (frame.width(), frame.height()) != (running.info.width(), running.info.height()) {
            return Err(EncoderError::EncodeFailed {
                reason: format!(
                    "frame {}×{} does not match session {}×{}",
                    frame.width(),
                    frame.height(),
                    running.info.width(),
                    running.info.height()
                ),
            });
        }

        if frame_type == FrameType::Key {
            running.force_keyframe();
        }
        let buffer = running.fill_buffer(frame)?;
        running
            .appsrc
            .push_buffer(buffer)
            .map_err(|e| EncoderError::EncodeFailed { reason: format!("appsrc push_buffer: {e:?}") })?;

        // Wait briefly for this frame's access unit, then drain without blocking.
        let mut packets = Vec::new();
        let mut timeout = gst::ClockTime::from_mseconds(50);
        while let Some(sample) = running.appsink.try_pull_sample(timeout) {
            timeout = gst::ClockTime::ZERO;
            let Some(buffer) = sample.buffer() else { continue };
            let map = buffer
                .map_readable()
                .map_err(|e| EncoderError::EncodeFailed { reason: format!("mapping sample: {e}") })?;
            packets.push(EncodedPacket {
                data: map.as_slice().to_vec(),
                timestamp_us: buffer.pts().map(|t| t.useconds()).unwrap_or(frame.timestamp_us()),
            });
        }
        Ok(packets)
    }

    fn set_rates(&mut self, bitrate_kbps: u32, framerate: u32) -> Result<(), EncoderError> {
        let running = self.running.as_ref().ok_or(EncoderError::NotInitialized)?;
        let value = self.candidate.bitrate_value(bitrate_kbps);
        running.encoder.set_property_from_str("bitrate", &value.to_string());
        debug!(
            "{} bitrate → {} kbps (framerate {} applies at next init)",
            self.candidate.element, bitrate_kbps, framerate
        );
        Ok(())
    }

    fn release(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown();
            debug!("Encoder pipeline stopped ({})", self.candidate.element);
        }
    }
}

impl Drop for GstH264Encoder {
    fn drop(&mut self) {
        self.release();
    }
}
