//! Capture worker thread and pacing.
//!
//! The worker runs a [`Tick`] task at a fixed target interval. After each
//! tick it sleeps for whatever is left of the interval; a tick that overruns
//! is followed immediately by the next one, and lost time is never made up
//! with extra ticks.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use duallink_core::CaptureError;
use tracing::{debug, info, warn};

// ── Pacer ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacer {
    interval: Duration,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleep owed after a tick that took `elapsed`. `None` means tick again now.
    pub fn delay_after(&self, elapsed: Duration) -> Option<Duration> {
        self.interval.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

// ── StopSignal ────────────────────────────────────────────────────────────────

/// Stop flag the worker can also sleep on.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond:    Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`, waking early on stop. Returns `true` if stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

// ── Tick ──────────────────────────────────────────────────────────────────────

/// One unit of periodic work.
pub trait Tick {
    fn tick(&mut self, stop: &StopSignal);

    /// Called once on the worker after the last tick.
    fn finish(&mut self) {}
}

/// Run `task` until `stop` is raised. Returns the number of ticks issued.
pub fn run_paced<T: Tick + ?Sized>(task: &mut T, pacer: &Pacer, stop: &StopSignal) -> u64 {
    let mut ticks = 0u64;
    while !stop.is_stopped() {
        let started = Instant::now();
        task.tick(stop);
        ticks += 1;

        let elapsed = started.elapsed();
        match pacer.delay_after(elapsed) {
            Some(delay) => {
                if stop.wait_timeout(delay) {
                    break;
                }
            }
            None => debug!(
                "Capture tick took {:?} (interval {:?}); not sleeping",
                elapsed,
                pacer.interval()
            ),
        }
    }
    task.finish();
    ticks
}

// ── CaptureScheduler ──────────────────────────────────────────────────────────

/// Owns the capture worker thread.
///
/// The task is built on the worker by `setup`, so thread-affine resources
/// (the capture device) never leave it. `setup` also receives the worker's
/// stop signal. [`start`](Self::start) blocks until setup has finished and
/// fails without leaving a thread behind.
#[derive(Debug)]
pub struct CaptureScheduler {
    stop:   Arc<StopSignal>,
    handle: Option<JoinHandle<u64>>,
}

impl CaptureScheduler {
    pub fn start<T, F>(name: &str, interval: Duration, setup: F) -> Result<Self, CaptureError>
    where
        T: Tick,
        F: FnOnce(&Arc<StopSignal>) -> Result<T, CaptureError> + Send + 'static,
    {
        let stop = Arc::new(StopSignal::new());
        let worker_stop = Arc::clone(&stop);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CaptureError>>();

        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let mut task = match setup(&worker_stop) {
                    Ok(task) => task,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return 0;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                drop(ready_tx);
                run_paced(&mut task, &Pacer::new(interval), &worker_stop)
            })
            .map_err(CaptureError::ThreadSpawn)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                debug!("Capture worker '{}' running every {:?}", name, interval);
                Ok(Self { stop, handle: Some(handle) })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            // Setup panicked before reporting.
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::WorkerLost)
            }
        }
    }

    /// Ask the worker to exit after the current tick. Does not wait.
    pub fn request_stop(&self) {
        self.stop.stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Wait for the worker to exit. When called on the worker itself (the
    /// owner was dropped from a callback) the thread is detached instead.
    pub fn join(&mut self) {
        let Some(handle) = self.handle.take() else { return };
        if handle.thread().id() == thread::current().id() {
            debug!("Capture worker released from its own thread; detaching");
            return;
        }
        match handle.join() {
            Ok(ticks) => info!("Capture worker exited after {} ticks", ticks),
            Err(_) => warn!("Capture worker panicked"),
        }
    }

    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }
}

impl Drop for CaptureScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_covers_remaining_interval() {
        let pacer = Pacer::new(Duration::from_millis(33));
        assert_eq!(pacer.delay_after(Duration::from_millis(8)), Some(Duration::from_millis(25)));
        assert_eq!(pacer.delay_after(Duration::from_millis(33)), None);
        assert_eq!(pacer.delay_after(Duration::from_millis(120)), None);
    }

    /// Tick whose cost follows a script, recording when each tick starts.
    struct Scripted {
        costs:  Vec<Duration>,
        starts: Vec<Instant>,
    }

    impl Tick for Scripted {
        fn tick(&mut self, stop: &StopSignal) {
            self.starts.push(Instant::now());
            match self.costs.get(self.starts.len() - 1) {
                Some(cost) => thread::sleep(*cost),
                None => stop.stop(),
            }
        }
    }

    #[test]
    fn overrun_is_not_made_up_with_a_burst() {
        let interval = Duration::from_millis(20);
        let mut costs = vec![Duration::ZERO; 2];
        costs.push(Duration::from_millis(110));
        costs.extend([Duration::ZERO; 4]);
        let mut task = Scripted { costs, starts: Vec::new() };

        let stop = StopSignal::new();
        let ticks = run_paced(&mut task, &Pacer::new(interval), &stop);
        assert_eq!(ticks, 8);

        let gaps: Vec<Duration> = task.starts.windows(2).map(|w| w[1] - w[0]).collect();
        // The slow tick is followed at once by the next one...
        assert!(gaps[2] >= Duration::from_millis(110));
        assert!(gaps[2] < Duration::from_millis(110) + interval);
        // ...and every later tick waits a full interval again.
        for gap in &gaps[3..] {
            assert!(*gap >= Duration::from_millis(18), "burst gap {gap:?}");
        }
    }

    struct Counter {
        ticks:    Arc<Mutex<u64>>,
        finished: Arc<Mutex<bool>>,
    }

    impl Tick for Counter {
        fn tick(&mut self, _stop: &StopSignal) {
            *self.ticks.lock().unwrap() += 1;
        }

        fn finish(&mut self) {
            *self.finished.lock().unwrap() = true;
        }
    }

    #[test]
    fn worker_ticks_at_interval_and_stops() {
        let ticks = Arc::new(Mutex::new(0));
        let finished = Arc::new(Mutex::new(false));
        let (t, f) = (ticks.clone(), finished.clone());

        let mut scheduler = CaptureScheduler::start("test-capture", Duration::from_millis(20), move |_| {
            Ok(Counter { ticks: t, finished: f })
        })
        .expect("scheduler starts");
        thread::sleep(Duration::from_millis(200));
        scheduler.stop();

        let count = *ticks.lock().unwrap();
        assert!((4..=14).contains(&count), "ticks: {count}");
        assert!(*finished.lock().unwrap());

        thread::sleep(Duration::from_millis(60));
        assert_eq!(*ticks.lock().unwrap(), count);
    }

    #[test]
    fn failed_setup_leaves_no_worker() {
        let result = CaptureScheduler::start::<Counter, _>("test-capture", Duration::from_millis(20), |_| {
            Err(CaptureError::DeviceUnavailable { reason: "test".into() })
        });
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable { .. })));
    }

    #[test]
    fn task_can_stop_its_own_worker() {
        struct StopAfter(u64, Arc<StopSignal>);

        impl Tick for StopAfter {
            fn tick(&mut self, _stop: &StopSignal) {
                self.0 = self.0.saturating_sub(1);
                if self.0 == 0 {
                    self.1.stop();
                }
            }
        }

        let mut scheduler = CaptureScheduler::start("test-capture", Duration::from_millis(5), |stop| {
            Ok(StopAfter(3, Arc::clone(stop)))
        })
        .expect("scheduler starts");
        let started = Instant::now();
        while !scheduler.is_stop_requested() {
            assert!(started.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.join();
    }

    #[test]
    fn stop_wakes_a_sleeping_worker() {
        let stop = Arc::new(StopSignal::new());
        let waiter = Arc::clone(&stop);
        let started = Instant::now();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        stop.stop();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
