//! Generated-frame capture device.
//!
//! Renders a BGRA gradient with a moving white band for a set of simulated
//! screens and windows. A [`SyntheticControl`] handle shared with the device
//! lets the owner resize, minimize, remove and restore sources, and slow
//! down each capture, while a session is running.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use duallink_core::{CaptureError, CaptureParameters, Source, SourceId, SourceKind, SourceType};
use tracing::debug;

use crate::device::{CaptureDevice, CaptureResult, DesktopFrame, DeviceFactory};

/// Padding added to every row, as real capture backends do.
const ROW_PADDING: usize = 64;
const BAND_ROWS: usize = 8;

#[derive(Debug, Clone)]
struct SyntheticSource {
    id:        SourceId,
    title:     String,
    kind:      SourceKind,
    width:     u32,
    height:    u32,
    minimized: bool,
    present:   bool,
}

#[derive(Debug, Default)]
struct ControlState {
    sources:      Vec<SyntheticSource>,
    next_id:      u64,
    capture_cost: Duration,
    unavailable:  bool,
    selected:     Option<SourceId>,
    captures:     u64,
}

// ── SyntheticControl ──────────────────────────────────────────────────────────

/// Shared handle for scripting what a [`SyntheticDevice`] captures.
#[derive(Debug, Clone, Default)]
pub struct SyntheticControl {
    state: Arc<Mutex<ControlState>>,
}

impl SyntheticControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, title: &str, kind: SourceKind, width: u32, height: u32) -> SourceId {
        let mut state = self.state();
        state.next_id += 1;
        let id = SourceId(state.next_id);
        state.sources.push(SyntheticSource {
            id,
            title: title.to_owned(),
            kind,
            width,
            height,
            minimized: false,
            present: true,
        });
        id
    }

    /// Add a screen. An empty title is reported as "Screen N".
    pub fn add_screen(&self, title: &str, width: u32, height: u32) -> SourceId {
        self.add(title, SourceKind::Screen, width, height)
    }

    pub fn add_window(&self, title: &str, width: u32, height: u32) -> SourceId {
        self.add(title, SourceKind::Window, width, height)
    }

    fn with_source(&self, id: SourceId, f: impl FnOnce(&mut SyntheticSource)) {
        if let Some(source) = self.state().sources.iter_mut().find(|s| s.id == id) {
            f(source);
        }
    }

    pub fn resize(&self, id: SourceId, width: u32, height: u32) {
        self.with_source(id, |s| {
            s.width = width;
            s.height = height;
        });
    }

    pub fn set_title(&self, id: SourceId, title: &str) {
        self.with_source(id, |s| s.title = title.to_owned());
    }

    /// A minimized window is captured as a 1×1 frame.
    pub fn set_minimized(&self, id: SourceId, minimized: bool) {
        self.with_source(id, |s| s.minimized = minimized);
    }

    /// Make the source vanish, as a closed window does.
    pub fn remove(&self, id: SourceId) {
        self.with_source(id, |s| s.present = false);
    }

    pub fn restore(&self, id: SourceId) {
        self.with_source(id, |s| s.present = true);
    }

    /// Time every capture request takes.
    pub fn set_capture_cost(&self, cost: Duration) {
        self.state().capture_cost = cost;
    }

    /// Make the device factory fail, as when no display is reachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Number of capture requests served so far.
    pub fn capture_count(&self) -> u64 {
        self.state().captures
    }

    /// Source last selected by a device.
    pub fn selected(&self) -> Option<SourceId> {
        self.state().selected
    }

    pub fn device_factory(&self) -> DeviceFactory {
        let control = self.clone();
        Arc::new(move |params| {
            let device = SyntheticDevice::open(control.clone(), params)?;
            Ok(Box::new(device) as Box<dyn CaptureDevice>)
        })
    }
}

// ── SyntheticDevice ───────────────────────────────────────────────────────────

pub struct SyntheticDevice {
    control:  SyntheticControl,
    kind:     SourceKind,
    selected: Option<SourceId>,
    pixels:   Vec<u8>,
    /// Geometry `pixels` was painted for: width, height, stride.
    painted:  (u32, u32, usize),
    band_row: usize,
    started:  bool,
}

impl SyntheticDevice {
    pub fn open(control: SyntheticControl, params: &CaptureParameters) -> Result<Self, CaptureError> {
        if control.state().unavailable {
            return Err(CaptureError::DeviceUnavailable { reason: "synthetic display disconnected".into() });
        }
        let kind = match params.source_type {
            SourceType::FullScreen => SourceKind::Screen,
            SourceType::Application => SourceKind::Window,
        };
        Ok(Self {
            control,
            kind,
            selected: None,
            pixels: Vec::new(),
            painted: (0, 0, 0),
            band_row: 0,
            started: false,
        })
    }

    fn paint_row(row: &mut [u8], y: usize, width: usize, height: usize) {
        let g = (y * 255 / height.max(1)) as u8;
        for (x, px) in row[..width * 4].chunks_exact_mut(4).enumerate() {
            px[0] = (x * 255 / width.max(1)) as u8;
            px[1] = g;
            px[2] = 0x80;
            px[3] = 0xFF;
        }
    }

    /// Repaint the gradient on geometry change, then move the band.
    fn render(&mut self, width: u32, height: u32) -> (usize, &[u8]) {
        let (w, h) = (width as usize, height as usize);
        let stride = w * 4 + ROW_PADDING;

        if self.painted != (width, height, stride) {
            self.pixels.clear();
            self.pixels.resize(stride * h, 0);
            for (y, row) in self.pixels.chunks_exact_mut(stride).enumerate() {
                Self::paint_row(row, y, w, h);
            }
            self.painted = (width, height, stride);
            self.band_row = 0;
        } else if h > 0 {
            for y in self.band_row..(self.band_row + BAND_ROWS).min(h) {
                Self::paint_row(&mut self.pixels[y * stride..(y + 1) * stride], y, w, h);
            }
            self.band_row = (self.band_row + BAND_ROWS) % h;
        }

        for y in self.band_row..(self.band_row + BAND_ROWS).min(h) {
            self.pixels[y * stride..y * stride + w * 4].fill(0xFF);
        }
        (stride, &self.pixels)
    }
}

impl CaptureDevice for SyntheticDevice {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.started = true;
        Ok(())
    }

    fn capture_frame(&mut self, on_result: &mut dyn FnMut(CaptureResult, Option<DesktopFrame<'_>>)) {
        let (source, cost) = {
            let mut state = self.control.state();
            state.captures += 1;
            let source = state
                .sources
                .iter()
                .filter(|s| s.kind == self.kind)
                .find(|s| match self.selected {
                    Some(id) => s.id == id,
                    None => s.present,
                })
                .cloned();
            (source, state.capture_cost)
        };

        if !cost.is_zero() {
            std::thread::sleep(cost);
        }

        let Some(source) = source.filter(|s| s.present && self.started) else {
            on_result(CaptureResult::ErrorTemporary, None);
            return;
        };

        let (width, height) = if source.minimized { (1, 1) } else { (source.width, source.height) };
        let (stride, data) = self.render(width, height);
        on_result(CaptureResult::Success, Some(DesktopFrame { width, height, stride, data }));
    }

    fn source_list(&mut self) -> Result<Vec<Source>, CaptureError> {
        let state = self.control.state();
        Ok(state
            .sources
            .iter()
            .filter(|s| s.present && s.kind == self.kind)
            .enumerate()
            .map(|(position, s)| Source::new(s.id, s.title.clone(), s.kind, position))
            .collect())
    }

    fn select_source(&mut self, id: SourceId) -> bool {
        let mut state = self.control.state();
        let known = state.sources.iter().any(|s| s.id == id && s.present && s.kind == self.kind);
        if known {
            self.selected = Some(id);
            state.selected = Some(id);
        }
        known
    }

    fn stop(&mut self) {
        self.started = false;
        debug!("Synthetic capture device stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(device: &mut SyntheticDevice) -> (CaptureResult, Option<(u32, u32, usize)>) {
        let mut seen = (CaptureResult::ErrorPermanent, None);
        device.capture_frame(&mut |result, frame| {
            seen = (result, frame.map(|f| (f.width, f.height, f.stride)));
        });
        seen
    }

    #[test]
    fn lists_sources_of_requested_kind() {
        let control = SyntheticControl::new();
        control.add_screen("", 1920, 1080);
        control.add_window("Terminal", 800, 600);
        control.add_screen("", 1280, 720);

        let mut screens = SyntheticDevice::open(control.clone(), &CaptureParameters::default())
            .expect("device");
        let titles: Vec<_> = screens.source_list().expect("list").into_iter().map(|s| s.title).collect();
        assert_eq!(titles, vec!["Screen 1", "Screen 2"]);

        let params = CaptureParameters { source_type: SourceType::Application, ..Default::default() };
        let mut windows = SyntheticDevice::open(control, &params).expect("device");
        let titles: Vec<_> = windows.source_list().expect("list").into_iter().map(|s| s.title).collect();
        assert_eq!(titles, vec!["Terminal"]);
    }

    #[test]
    fn frames_follow_source_state() {
        let control = SyntheticControl::new();
        let id = control.add_screen("", 320, 240);
        let mut device = SyntheticDevice::open(control.clone(), &CaptureParameters::default())
            .expect("device");
        device.start().expect("start");
        assert!(device.select_source(id));
        assert_eq!(control.selected(), Some(id));

        assert_eq!(capture(&mut device), (CaptureResult::Success, Some((320, 240, 320 * 4 + 64))));

        control.set_minimized(id, true);
        assert_eq!(capture(&mut device).1.map(|(w, h, _)| (w, h)), Some((1, 1)));

        control.set_minimized(id, false);
        control.remove(id);
        assert_eq!(capture(&mut device), (CaptureResult::ErrorTemporary, None));

        control.restore(id);
        control.resize(id, 330, 250);
        assert_eq!(capture(&mut device).1.map(|(w, h, _)| (w, h)), Some((330, 250)));
        assert_eq!(control.capture_count(), 4);
    }

    #[test]
    fn unknown_and_removed_sources_cannot_be_selected() {
        let control = SyntheticControl::new();
        let id = control.add_screen("", 64, 64);
        let mut device = SyntheticDevice::open(control.clone(), &CaptureParameters::default())
            .expect("device");
        assert!(!device.select_source(SourceId(999)));
        control.remove(id);
        assert!(!device.select_source(id));
    }

    #[test]
    fn unavailable_display_fails_open() {
        let control = SyntheticControl::new();
        control.set_unavailable(true);
        let result = SyntheticDevice::open(control, &CaptureParameters::default());
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable { .. })));
    }
}
