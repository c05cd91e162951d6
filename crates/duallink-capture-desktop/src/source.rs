use duallink_core::{CaptureError, Source, SourceId};
use tracing::{info, warn};

use crate::device::CaptureDevice;

/// Application hook asked to pick a capture source when a session starts.
pub trait SourceObserver: Send + Sync {
    /// Return the id to capture, or `None` to keep the device default.
    fn on_capture_source_needed(&self, sources: &[Source]) -> Option<SourceId>;
}

impl<F> SourceObserver for F
where
    F: Fn(&[Source]) -> Option<SourceId> + Send + Sync,
{
    fn on_capture_source_needed(&self, sources: &[Source]) -> Option<SourceId> {
        self(sources)
    }
}

/// Source enumeration and selection on a capture device.
pub struct SourceSelector<'a> {
    device: &'a mut dyn CaptureDevice,
}

impl<'a> SourceSelector<'a> {
    pub fn new(device: &'a mut dyn CaptureDevice) -> Self {
        Self { device }
    }

    pub fn enumerate(&mut self) -> Vec<Source> {
        match self.device.source_list() {
            Ok(sources) => sources,
            Err(e) => {
                warn!("Capture source enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    pub fn select(&mut self, id: SourceId) -> bool {
        self.device.select_source(id)
    }

    /// Let `observer` choose among the device's sources.
    ///
    /// Without an observer, or when it declines, the device keeps its
    /// default source and `Ok(None)` is returned. A chosen id the device
    /// does not know fails the session start.
    pub fn negotiate(
        &mut self,
        observer: Option<&dyn SourceObserver>,
    ) -> Result<Option<SourceId>, CaptureError> {
        let Some(observer) = observer else { return Ok(None) };

        let sources = self.enumerate();
        if sources.is_empty() {
            warn!("No capture sources listed; using the device default");
            return Ok(None);
        }

        let Some(id) = observer.on_capture_source_needed(&sources) else {
            return Ok(None);
        };
        if !self.select(id) {
            return Err(CaptureError::SourceNotFound(id));
        }
        if let Some(source) = sources.iter().find(|s| s.id == id) {
            info!("Capturing {}", source);
        }
        Ok(Some(id))
    }
}
