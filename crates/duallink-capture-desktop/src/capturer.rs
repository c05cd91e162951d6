//! App-facing capture surface.
//!
//! ```text
//!  caller thread                     capture worker ("duallink-capture")
//!  ─────────────                     ───────────────────────────────────
//!  start_capturing_*  ──spawn──►     open device → negotiate source
//!        ◄──────── ready / error ──  │
//!                                    loop every 1/fps:
//!                                      capture_frame
//!                                      ColorConverter::convert
//!                                      lock(router) → raw cb | encode → encoded cb
//!  stop_capturing ── stop flag ──►   │
//!                 ── lock(router), clear target
//!                 ── join ◄───────── device.stop(), exit
//! ```
//!
//! A delivery callback may call [`DesktopCapturer::stop_capturing`] (or drop
//! the last handle to the capturer). On the worker that only raises the stop
//! flag; the worker clears the target itself once the callback returns, and
//! the thread is reaped by the next start or stop from another thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;

use duallink_core::{CaptureError, CaptureParameters};
use duallink_encoder::{default_encoder_factory, EncodeAdapter, EncoderConfig, EncoderFactory};
use tracing::{debug, error, info, warn};

use crate::convert::{ColorConverter, Conversion};
use crate::device::{default_device_factory, CaptureDevice, CaptureResult, DeviceFactory};
use crate::router::{DeliveryRouter, EncodedImageCallback, RawFrameCallback};
use crate::scheduler::{CaptureScheduler, StopSignal, Tick};
use crate::source::{SourceObserver, SourceSelector};

const WORKER_THREAD_NAME: &str = "duallink-capture";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Capturing,
    Stopping,
}

// ── Capture loop (runs on the worker) ─────────────────────────────────────────

/// Logs the first failure of a streak loudly and the rest quietly.
#[derive(Debug, Default)]
struct FailureStreak {
    count: u64,
}

impl FailureStreak {
    fn failed(&mut self, result: CaptureResult) {
        self.count += 1;
        if self.count == 1 {
            warn!("Capture failed ({:?}); dropping frames until the source recovers", result);
        } else {
            debug!("Capture failed ({:?}), {} in a row", result, self.count);
        }
    }

    fn recovered(&mut self) {
        if self.count > 0 {
            info!("Capture recovered after {} failed attempts", self.count);
            self.count = 0;
        }
    }
}

/// State shared between the capturer and its worker.
#[derive(Clone)]
struct Shared {
    router: Arc<Mutex<DeliveryRouter>>,
    state:  Arc<Mutex<SessionState>>,
    /// Worker of the running session, set on the worker before its first tick.
    worker: Arc<Mutex<Option<WorkerLink>>>,
}

/// Identifies the capture worker so a stop issued from one of its callbacks
/// can be recognized.
#[derive(Clone)]
struct WorkerLink {
    thread:          ThreadId,
    stop:            Arc<StopSignal>,
    release_encoder: Arc<AtomicBool>,
}

struct CaptureLoop {
    device:          Box<dyn CaptureDevice>,
    converter:       ColorConverter,
    router:          Arc<Mutex<DeliveryRouter>>,
    state:           Arc<Mutex<SessionState>>,
    release_encoder: Arc<AtomicBool>,
    failures:        FailureStreak,
    epoch:           Instant,
}

impl CaptureLoop {
    fn open(
        factory: DeviceFactory,
        observer: Option<Arc<dyn SourceObserver>>,
        shared: Shared,
        release_encoder: Arc<AtomicBool>,
        stop: &Arc<StopSignal>,
        params: CaptureParameters,
    ) -> Result<Self, CaptureError> {
        let mut device = factory(&params)?;
        device.start()?;

        if let Err(e) = SourceSelector::new(device.as_mut()).negotiate(observer.as_deref()) {
            device.stop();
            return Err(e);
        }

        *lock(&shared.worker) = Some(WorkerLink {
            thread: thread::current().id(),
            stop: Arc::clone(stop),
            release_encoder: Arc::clone(&release_encoder),
        });

        Ok(Self {
            device,
            converter: ColorConverter::new(params.target_resolution()),
            router: shared.router,
            state: shared.state,
            release_encoder,
            failures: FailureStreak::default(),
            epoch: Instant::now(),
        })
    }
}

impl Tick for CaptureLoop {
    fn tick(&mut self, stop: &StopSignal) {
        let Self { device, converter, router, release_encoder, failures, epoch, .. } = self;
        let router = router.as_ref();

        device.capture_frame(&mut |result, frame| match (result, frame) {
            (CaptureResult::Success, Some(frame)) => {
                failures.recovered();
                if stop.is_stopped() {
                    return;
                }
                let timestamp_us = epoch.elapsed().as_micros() as u64;
                if let Conversion::Converted(buffer) = converter.convert(&frame, timestamp_us) {
                    let mut router = lock(router);
                    // Re-checked under the lock: stop_capturing clears the
                    // target while holding it.
                    if !stop.is_stopped() {
                        router.deliver(buffer, stop);
                    }
                    // Stopped from inside the callback: nobody else will
                    // clear the target before the next start.
                    if stop.is_stopped() {
                        router.clear(release_encoder.load(Ordering::Acquire));
                    }
                }
            }
            (CaptureResult::Success, None) => debug!("Capture succeeded without a frame"),
            (result, _) => failures.failed(result),
        });
    }

    fn finish(&mut self) {
        self.device.stop();
        *lock(&self.state) = SessionState::Idle;
    }
}

// ── DesktopCapturer ───────────────────────────────────────────────────────────

struct CaptureSession {
    scheduler:       CaptureScheduler,
    params:          CaptureParameters,
    release_encoder: Arc<AtomicBool>,
}

enum DeliveryRequest {
    Raw(Box<dyn RawFrameCallback>),
    Encoded(Box<dyn EncodedImageCallback>),
}

/// Captures a screen or window on a worker thread and delivers either raw
/// I420 frames or H.264 access units to one callback.
///
/// All methods take `&self` and may be called from any thread. Callbacks run
/// on the capture worker while an internal lock is held; from a callback
/// only [`stop_capturing`](Self::stop_capturing), [`state`](Self::state) and
/// [`is_capturing`](Self::is_capturing) may be called.
pub struct DesktopCapturer {
    device_factory: DeviceFactory,
    observer:       Option<Arc<dyn SourceObserver>>,
    shared:         Shared,
    session:        Mutex<Option<CaptureSession>>,
}

impl DesktopCapturer {
    /// Capturer using the compiled-in capture and encoder backends.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> DesktopCapturerBuilder {
        DesktopCapturerBuilder::default()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn is_capturing(&self) -> bool {
        self.state() == SessionState::Capturing
    }

    /// Parameters of the running session.
    pub fn parameters(&self) -> Option<CaptureParameters> {
        lock(&self.session)
            .as_ref()
            .filter(|s| !s.scheduler.is_stop_requested())
            .map(|s| s.params.clone())
    }

    /// Name of the initialized encoder backend, if any.
    pub fn encoder_name(&self) -> Option<String> {
        lock(&self.shared.router).encoder().encoder_name().map(str::to_owned)
    }

    /// Start delivering raw I420 frames. Returns `false` if capture could
    /// not start; nothing is left running in that case.
    pub fn start_capturing_raw(&self, callback: impl RawFrameCallback + 'static, params: CaptureParameters) -> bool {
        self.start(DeliveryRequest::Raw(Box::new(callback)), params)
    }

    /// Start delivering H.264 access units. The encoder is created when the
    /// first frame arrives.
    pub fn start_capturing_encoded(
        &self,
        callback: impl EncodedImageCallback + 'static,
        params: CaptureParameters,
    ) -> bool {
        self.start(DeliveryRequest::Encoded(Box::new(callback)), params)
    }

    /// Stop the session. Once this returns no callback is running or will
    /// run, except the one this is called from. Returns `false` if nothing
    /// was capturing.
    ///
    /// With `release_encoder == false` the encoder session survives for the
    /// next encoded start.
    pub fn stop_capturing(&self, release_encoder: bool) -> bool {
        if let Some(link) = self.current_worker() {
            return self.stop_from_worker(&link, release_encoder);
        }

        let mut session = lock(&self.session);
        let Some(mut active) = session.take() else {
            debug!("stop_capturing: not capturing");
            return false;
        };

        if active.scheduler.is_stop_requested() {
            // Already stopped from one of its callbacks.
            active.scheduler.join();
            lock(&self.shared.router).clear(release_encoder);
            self.clear_worker();
            debug!("stop_capturing: session was stopped from its callback");
            return false;
        }

        self.set_state(SessionState::Stopping);
        active.release_encoder.store(release_encoder, Ordering::Release);
        active.scheduler.request_stop();
        lock(&self.shared.router).clear(release_encoder);
        active.scheduler.join();
        self.clear_worker();
        self.set_state(SessionState::Idle);
        info!("Desktop capture stopped");
        true
    }

    /// Change the encoder target bitrate and framerate.
    pub fn set_rates(&self, bitrate_kbps: u32, framerate: u32) {
        lock(&self.shared.router).encoder_mut().set_rates(bitrate_kbps, framerate);
    }

    /// Make the next encoded frame a keyframe.
    pub fn request_keyframe(&self) {
        lock(&self.shared.router).encoder_mut().request_keyframe();
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.shared.state) = state;
    }

    /// The worker link, when called on the capture worker.
    fn current_worker(&self) -> Option<WorkerLink> {
        let current = thread::current().id();
        lock(&self.shared.worker).as_ref().filter(|link| link.thread == current).cloned()
    }

    fn clear_worker(&self) {
        *lock(&self.shared.worker) = None;
    }

    /// The router lock is held by this very thread; only raise the flag.
    fn stop_from_worker(&self, link: &WorkerLink, release_encoder: bool) -> bool {
        if link.stop.is_stopped() {
            debug!("stop_capturing: already stopping");
            return false;
        }
        link.release_encoder.store(release_encoder, Ordering::Release);
        link.stop.stop();
        self.set_state(SessionState::Stopping);
        info!("Desktop capture stopped from its callback");
        true
    }

    /// Join a worker that was stopped from its own callback.
    fn reap(&self, session: &mut Option<CaptureSession>) {
        if session.as_ref().is_some_and(|s| s.scheduler.is_stop_requested()) {
            if let Some(mut stale) = session.take() {
                stale.scheduler.join();
                self.clear_worker();
            }
        }
    }

    fn register(&self, request: DeliveryRequest, params: &CaptureParameters) {
        let mut router = lock(&self.shared.router);
        match request {
            DeliveryRequest::Raw(callback) => router.set_raw_callback(callback),
            DeliveryRequest::Encoded(callback) => {
                router.set_encoded_callback(callback, EncoderConfig::from_parameters(params))
            }
        }
    }

    fn start(&self, request: DeliveryRequest, params: CaptureParameters) -> bool {
        let mut session = lock(&self.session);
        self.reap(&mut session);

        if let Some(active) = session.as_mut() {
            // Device-level settings stay until the next stop/start.
            info!("Capture already running; replacing the delivery target");
            self.register(request, &params);
            active.params.max_bitrate_kbps = params.max_bitrate_kbps;
            active.params.min_bitrate_kbps = params.min_bitrate_kbps;
            return true;
        }

        self.register(request, &params);

        let factory = Arc::clone(&self.device_factory);
        let observer = self.observer.clone();
        let shared = self.shared.clone();
        let release_encoder = Arc::new(AtomicBool::new(true));
        let worker_release = Arc::clone(&release_encoder);
        let worker_params = params.clone();
        let started = CaptureScheduler::start(WORKER_THREAD_NAME, params.frame_interval(), move |stop| {
            CaptureLoop::open(factory, observer, shared, worker_release, stop, worker_params)
        });

        match started {
            Ok(scheduler) => {
                info!(
                    "Desktop capture started: {:?} @{}fps, cursor={}, policy={:#x}",
                    params.source_type,
                    params.effective_fps(),
                    params.cursor_enabled,
                    params.capture_policy.0
                );
                *session = Some(CaptureSession { scheduler, params, release_encoder });
                self.set_state(SessionState::Capturing);
                true
            }
            Err(e) => {
                error!("Failed to start desktop capture: {}", e);
                lock(&self.shared.router).clear(true);
                false
            }
        }
    }
}

impl Default for DesktopCapturer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DesktopCapturer {
    fn drop(&mut self) {
        self.stop_capturing(true);
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct DesktopCapturerBuilder {
    device_factory:  Option<DeviceFactory>,
    encoder_factory: Option<EncoderFactory>,
    observer:        Option<Arc<dyn SourceObserver>>,
}

impl DesktopCapturerBuilder {
    pub fn device_factory(mut self, factory: DeviceFactory) -> Self {
        self.device_factory = Some(factory);
        self
    }

    pub fn encoder_factory(mut self, factory: EncoderFactory) -> Self {
        self.encoder_factory = Some(factory);
        self
    }

    /// Observer consulted for the capture source on every start.
    pub fn observer(mut self, observer: impl SourceObserver + 'static) -> Self {
        let observer: Arc<dyn SourceObserver> = Arc::new(observer);
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> DesktopCapturer {
        let encoder = EncodeAdapter::new(self.encoder_factory.unwrap_or_else(default_encoder_factory));
        DesktopCapturer {
            device_factory: self.device_factory.unwrap_or_else(default_device_factory),
            observer: self.observer,
            shared: Shared {
                router: Arc::new(Mutex::new(DeliveryRouter::new(encoder))),
                state: Arc::new(Mutex::new(SessionState::Idle)),
                worker: Arc::new(Mutex::new(None)),
            },
            session: Mutex::new(None),
        }
    }
}
