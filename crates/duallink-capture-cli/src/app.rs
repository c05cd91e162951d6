//! Command-line capture session: options, statistics and the run loop.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use duallink_capture_desktop::{
    default_device_factory, DesktopCapturer, DesktopMediaList, DeviceFactory, LoggingMediaListObserver,
    SyntheticControl,
};
use duallink_core::{CaptureParameters, EncodedImage, I420Buffer, Resolution, Source, SourceId};
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "DUALLINK_CAPTURE_CONFIG";
pub const MODE_ENV: &str = "DUALLINK_CAPTURE_MODE";
pub const DEVICE_ENV: &str = "DUALLINK_CAPTURE_DEVICE";
pub const SECONDS_ENV: &str = "DUALLINK_CAPTURE_SECONDS";
pub const SOURCE_ENV: &str = "DUALLINK_CAPTURE_SOURCE";

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Raw,
    Encoded,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" | "i420" => Ok(Self::Raw),
            "encoded" | "h264" => Ok(Self::Encoded),
            other => bail!("unknown capture mode {other:?} (expected raw or encoded)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChoice {
    Synthetic,
    XShm,
}

impl FromStr for DeviceChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synthetic" | "test" => Ok(Self::Synthetic),
            "xshm" | "x11" => Ok(Self::XShm),
            other => bail!("unknown capture device {other:?} (expected synthetic or xshm)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CliOptions {
    pub params:   CaptureParameters,
    pub mode:     Mode,
    pub device:   DeviceChoice,
    /// `None` runs until Ctrl+C.
    pub duration: Option<Duration>,
    /// Case-insensitive substring of the source title to capture.
    pub source:   Option<String>,
}

impl CliOptions {
    /// Options from the first command-line argument and `DUALLINK_CAPTURE_*`.
    pub fn from_env() -> Result<Self> {
        Self::parse(std::env::args().nth(1), |key| std::env::var(key).ok())
    }

    /// `config` is a path to a JSON parameter file or inline JSON. It falls
    /// back to `DUALLINK_CAPTURE_CONFIG`, then to default parameters.
    pub fn parse(config: Option<String>, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let params = match config.or_else(|| var(CONFIG_ENV)) {
            Some(config) => load_parameters(&config)?,
            None => CaptureParameters::default(),
        };

        let mode = var(MODE_ENV).map(|s| s.parse()).transpose()?.unwrap_or(Mode::Raw);
        let device = var(DEVICE_ENV)
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(DeviceChoice::Synthetic);

        let duration = match var(SECONDS_ENV) {
            Some(s) => {
                let secs: f64 = s.trim().parse().with_context(|| format!("{SECONDS_ENV}={s}"))?;
                Some(Duration::try_from_secs_f64(secs).with_context(|| format!("{SECONDS_ENV}={s}"))?)
            }
            None => None,
        };

        let source = var(SOURCE_ENV).filter(|s| !s.trim().is_empty());

        Ok(Self { params, mode, device, duration, source })
    }
}

fn load_parameters(config: &str) -> Result<CaptureParameters> {
    let text = if config.trim_start().starts_with('{') {
        config.to_owned()
    } else {
        std::fs::read_to_string(config).with_context(|| format!("reading capture parameters from {config}"))?
    };
    serde_json::from_str(&text).context("parsing capture parameters")
}

fn device_factory(choice: DeviceChoice) -> Result<DeviceFactory> {
    match choice {
        DeviceChoice::Synthetic => {
            let control = SyntheticControl::new();
            control.add_screen("", 1920, 1080);
            control.add_screen("", 1280, 720);
            control.add_window("Synthetic terminal", 1279, 719);
            Ok(control.device_factory())
        }
        DeviceChoice::XShm if cfg!(feature = "xshm") => Ok(default_device_factory()),
        DeviceChoice::XShm => bail!("built without the `xshm` feature"),
    }
}

/// First source whose title contains `filter`, ignoring case.
pub fn pick_source(sources: &[Source], filter: &str) -> Option<SourceId> {
    let filter = filter.to_lowercase();
    let chosen = sources.iter().find(|s| s.title.to_lowercase().contains(&filter));
    if chosen.is_none() {
        warn!("No source matches {:?}; using the default", filter);
    }
    chosen.map(|s| s.id)
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Frames delivered in the last second.
#[derive(Debug, Default)]
pub struct FpsCounter {
    timestamps: VecDeque<Instant>,
}

impl FpsCounter {
    pub fn tick_at(&mut self, now: Instant) {
        self.timestamps.push_back(now);
        self.prune(now);
    }

    pub fn fps_at(&mut self, now: Instant) -> f32 {
        self.prune(now);
        self.timestamps.len() as f32
    }

    fn prune(&mut self, now: Instant) {
        while self.timestamps.front().map_or(false, |t| now.duration_since(*t) > Duration::from_secs(1)) {
            self.timestamps.pop_front();
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    pub frames:    u64,
    pub bytes:     u64,
    pub keyframes: u64,
    pub geometry:  Option<Resolution>,
    fps:           FpsCounter,
}

impl Stats {
    pub fn record_frame(&mut self, frame: &I420Buffer) {
        self.frames += 1;
        self.bytes += frame.capacity() as u64;
        self.geometry = Some(frame.resolution());
        self.fps.tick_at(Instant::now());
    }

    pub fn record_image(&mut self, image: &EncodedImage) {
        self.frames += 1;
        self.bytes += image.size() as u64;
        if image.is_keyframe {
            self.keyframes += 1;
        }
        self.geometry = Some(Resolution::new(image.width, image.height));
        self.fps.tick_at(Instant::now());
    }

    fn report(&mut self, encoder: Option<&str>) {
        let geometry = self.geometry.map_or_else(|| "-".to_owned(), |g| g.to_string());
        info!(
            "{:>5.1} fps | {} frames | {} | {:.1} MiB | {} keyframes | encoder {}",
            self.fps.fps_at(Instant::now()),
            self.frames,
            geometry,
            self.bytes as f64 / (1024.0 * 1024.0),
            self.keyframes,
            encoder.unwrap_or("-")
        );
    }
}

fn lock(stats: &Mutex<Stats>) -> MutexGuard<'_, Stats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Run loop ──────────────────────────────────────────────────────────────────

/// Source list logged at startup and refreshed with every status line.
fn open_media_list(factory: &DeviceFactory, options: &CliOptions) -> Option<DesktopMediaList> {
    let opened = DesktopMediaList::new(factory, options.params.source_type)
        .map(|list| list.with_observer(LoggingMediaListObserver));
    match opened {
        Ok(mut list) => {
            refresh_media_list(&mut list);
            Some(list)
        }
        Err(e) => {
            warn!("Source list unavailable: {}", e);
            None
        }
    }
}

fn refresh_media_list(list: &mut DesktopMediaList) {
    if let Err(e) = list.update(false, false) {
        warn!("Source list refresh failed: {}", e);
    }
}

pub async fn run(options: CliOptions) -> Result<()> {
    let factory = device_factory(options.device)?;
    let mut media_list = open_media_list(&factory, &options);
    let mut builder = DesktopCapturer::builder().device_factory(factory);
    if let Some(filter) = options.source.clone() {
        builder = builder.observer(move |sources: &[Source]| pick_source(sources, &filter));
    }
    let capturer = builder.build();

    let stats = Arc::new(Mutex::new(Stats::default()));
    let sink = Arc::clone(&stats);
    let started = match options.mode {
        Mode::Raw => capturer.start_capturing_raw(
            move |frame: Arc<I420Buffer>| lock(&sink).record_frame(&frame),
            options.params.clone(),
        ),
        Mode::Encoded => capturer.start_capturing_encoded(
            move |image: &EncodedImage| lock(&sink).record_image(image),
            options.params.clone(),
        ),
    };
    if !started {
        bail!("capture did not start");
    }
    info!("Capturing ({:?} via {:?}); Ctrl+C to stop", options.mode, options.device);

    let deadline = async {
        match options.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl+C received, stopping");
                break;
            }
            _ = &mut deadline => {
                info!("Capture duration elapsed");
                break;
            }
            _ = status.tick() => {
                if let Some(list) = media_list.as_mut() {
                    refresh_media_list(list);
                }
                let encoder = capturer.encoder_name();
                lock(&stats).report(encoder.as_deref());
            }
        }
    }

    capturer.stop_capturing(true);
    let stats = lock(&stats);
    info!("Delivered {} frames ({} keyframes)", stats.frames, stats.keyframes);
    Ok(())
}
