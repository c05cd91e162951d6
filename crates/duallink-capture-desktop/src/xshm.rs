//! X11 screen capture through `scrap` (XShm).
//!
//! Each X display is one screen source; its id is the display index.
//! Window capture is not available on this backend.

use std::io::ErrorKind;

use duallink_core::{CaptureError, CaptureParameters, CapturePolicy, Source, SourceId, SourceKind, SourceType};
use scrap::{Capturer, Display};
use tracing::{debug, info, warn};

use crate::device::{CaptureDevice, CaptureResult, DesktopFrame};

pub struct XShmDevice {
    selected: usize,
    capturer: Option<Capturer>,
}

impl XShmDevice {
    pub fn open(params: &CaptureParameters) -> Result<Self, CaptureError> {
        if params.source_type == SourceType::Application {
            return Err(CaptureError::DeviceUnavailable {
                reason: "window capture is not supported by the XShm backend".into(),
            });
        }
        let displays = Display::all().map_err(|e| CaptureError::DeviceUnavailable {
            reason: format!("enumerating X displays: {e}"),
        })?;
        if displays.is_empty() {
            return Err(CaptureError::DeviceUnavailable { reason: "no X display found".into() });
        }
        if !params.cursor_enabled {
            warn!("XShm capture always includes the cursor");
        }
        let unsupported = CapturePolicy::WINDOW_EFFECTS | CapturePolicy::MAGNIFICATION;
        if params.capture_policy.0 & unsupported.0 != 0 {
            debug!("XShm ignores capture policy flags {:#x}", params.capture_policy.0 & unsupported.0);
        }
        Ok(Self { selected: 0, capturer: None })
    }

    fn open_capturer(index: usize) -> Result<Capturer, CaptureError> {
        let display = Display::all()
            .map_err(|e| CaptureError::DeviceUnavailable { reason: e.to_string() })?
            .into_iter()
            .nth(index)
            .ok_or(CaptureError::SourceNotFound(SourceId(index as u64)))?;
        let (width, height) = (display.width(), display.height());
        let capturer = Capturer::new(display)
            .map_err(|e| CaptureError::DeviceUnavailable { reason: format!("XShm capturer: {e}") })?;
        info!("XShm capturing display {} ({}×{})", index, width, height);
        Ok(capturer)
    }
}

impl CaptureDevice for XShmDevice {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.capturer = Some(Self::open_capturer(self.selected)?);
        Ok(())
    }

    fn capture_frame(&mut self, on_result: &mut dyn FnMut(CaptureResult, Option<DesktopFrame<'_>>)) {
        let Some(capturer) = self.capturer.as_mut() else {
            on_result(CaptureResult::ErrorPermanent, None);
            return;
        };
        let (width, height) = (capturer.width() as u32, capturer.height() as u32);
        match capturer.frame() {
            Ok(frame) => {
                let stride = frame.len() / (height.max(1) as usize);
                on_result(
                    CaptureResult::Success,
                    Some(DesktopFrame { width, height, stride, data: &frame }),
                );
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                on_result(CaptureResult::ErrorTemporary, None);
            }
            Err(e) => {
                warn!("XShm capture failed: {}", e);
                on_result(CaptureResult::ErrorPermanent, None);
            }
        }
    }

    fn source_list(&mut self) -> Result<Vec<Source>, CaptureError> {
        let displays = Display::all()
            .map_err(|e| CaptureError::DeviceUnavailable { reason: e.to_string() })?;
        Ok((0..displays.len())
            .map(|index| Source::new(SourceId(index as u64), "", SourceKind::Screen, index))
            .collect())
    }

    fn select_source(&mut self, id: SourceId) -> bool {
        let index = id.0 as usize;
        match Self::open_capturer(index) {
            Ok(capturer) => {
                self.selected = index;
                self.capturer = Some(capturer);
                true
            }
            Err(e) => {
                warn!("Cannot select display {}: {}", id, e);
                false
            }
        }
    }

    fn stop(&mut self) {
        self.capturer = None;
    }
}
