use std::sync::Arc;

use duallink_core::{CaptureError, CaptureParameters, Resolution, Source, SourceId};

// ── Capture results ───────────────────────────────────────────────────────────

/// Outcome of one capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureResult {
    Success,
    /// Nothing to deliver this time (no new frame, source gone, window hidden).
    ErrorTemporary,
    /// The source will not produce frames again without reselection.
    ErrorPermanent,
}

/// A borrowed BGRA frame, valid for the duration of the result callback.
#[derive(Debug, Clone, Copy)]
pub struct DesktopFrame<'a> {
    pub width:  u32,
    pub height: u32,
    /// Bytes per row, at least `width * 4`.
    pub stride: usize,
    pub data:   &'a [u8],
}

impl<'a> DesktopFrame<'a> {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Whether `data` covers every row at the declared stride.
    pub fn is_well_formed(&self) -> bool {
        let row_bytes = self.width as usize * 4;
        if self.stride < row_bytes {
            return false;
        }
        match self.height as usize {
            0 => true,
            rows => self.data.len() >= self.stride * (rows - 1) + row_bytes,
        }
    }
}

// ── CaptureDevice ─────────────────────────────────────────────────────────────

/// OS-level screen or window grabber.
///
/// A device is created, driven and dropped on the capture worker thread, so
/// implementations need not be `Send`.
pub trait CaptureDevice {
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Capture once and report through `on_result`. The frame is only
    /// present on [`CaptureResult::Success`].
    fn capture_frame(&mut self, on_result: &mut dyn FnMut(CaptureResult, Option<DesktopFrame<'_>>));

    fn source_list(&mut self) -> Result<Vec<Source>, CaptureError>;

    fn select_source(&mut self, id: SourceId) -> bool;

    fn stop(&mut self) {}
}

/// Opens a device for the given session parameters.
pub type DeviceFactory =
    Arc<dyn Fn(&CaptureParameters) -> Result<Box<dyn CaptureDevice>, CaptureError> + Send + Sync>;

/// The platform capture backend compiled into this build.
#[cfg(feature = "xshm")]
pub fn default_device_factory() -> DeviceFactory {
    Arc::new(|params| {
        let device = crate::xshm::XShmDevice::open(params)?;
        Ok(Box::new(device) as Box<dyn CaptureDevice>)
    })
}

#[cfg(not(feature = "xshm"))]
pub fn default_device_factory() -> DeviceFactory {
    Arc::new(|_params| {
        Err(CaptureError::DeviceUnavailable {
            reason: "no native capture backend compiled in (enable the `xshm` feature)".into(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_shape_checks_stride_and_length() {
        let data = vec![0u8; 128];
        let ok = DesktopFrame { width: 4, height: 3, stride: 24, data: &data[..24 * 2 + 16] };
        assert!(ok.is_well_formed());

        let short = DesktopFrame { width: 4, height: 3, stride: 24, data: &data[..24 * 2 + 15] };
        assert!(!short.is_well_formed());

        let narrow = DesktopFrame { width: 8, height: 1, stride: 16, data: &data };
        assert!(!narrow.is_well_formed());
    }
}
