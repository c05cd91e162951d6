//! Persistent list of capture sources with change notifications.
//!
//! A [`DesktopMediaList`] opens its own capture device on a dedicated worker
//! thread, so enumeration and thumbnail captures never leave the thread the
//! device was created on. Each [`update`](DesktopMediaList::update)
//! re-enumerates the device and reports what changed since the last one.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use duallink_core::{CaptureError, CaptureParameters, I420Buffer, Resolution, Source, SourceId, SourceType};
use tracing::{debug, info, warn};

use crate::convert::{ColorConverter, Conversion};
use crate::device::{CaptureDevice, CaptureResult, DeviceFactory};

const WORKER_THREAD_NAME: &str = "duallink-media-list";

pub const DEFAULT_THUMBNAIL_SIZE: Resolution = Resolution { width: 160, height: 90 };

/// One entry of a [`DesktopMediaList`].
#[derive(Debug, Clone)]
pub struct MediaSource {
    pub source:    Source,
    /// Last thumbnail captured for the source, in I420 at the list's
    /// thumbnail size.
    pub thumbnail: Option<Arc<I420Buffer>>,
}

/// Receives list changes. `index` is the entry's position in
/// [`DesktopMediaList::sources`] at the time of the call.
pub trait MediaListObserver: Send {
    fn on_source_added(&mut self, _index: usize, _source: &MediaSource) {}
    fn on_source_removed(&mut self, _index: usize, _source: &MediaSource) {}
    fn on_source_title_changed(&mut self, _index: usize, _source: &MediaSource) {}
    fn on_source_thumbnail_changed(&mut self, _index: usize, _source: &MediaSource) {}
}

// ── Worker ────────────────────────────────────────────────────────────────────

enum Request {
    List(mpsc::Sender<Result<Vec<Source>, CaptureError>>),
    Thumbnail {
        id:    SourceId,
        size:  Resolution,
        reply: mpsc::Sender<Option<Arc<I420Buffer>>>,
    },
}

struct ThumbnailCapture {
    size:      Resolution,
    converter: ColorConverter,
}

impl ThumbnailCapture {
    fn capture(&mut self, device: &mut dyn CaptureDevice, id: SourceId, size: Resolution) -> Option<Arc<I420Buffer>> {
        if size != self.size {
            *self = Self { size, converter: ColorConverter::new(Some(size)) };
        }
        if !device.select_source(id) {
            debug!("Thumbnail skipped: source {} is gone", id);
            return None;
        }

        let converter = &mut self.converter;
        let mut thumbnail = None;
        device.capture_frame(&mut |result, frame| {
            if let (CaptureResult::Success, Some(frame)) = (result, frame) {
                if let Conversion::Converted(buffer) = converter.convert(&frame, 0) {
                    thumbnail = Some(buffer);
                }
            }
        });
        thumbnail
    }
}

fn serve(mut device: Box<dyn CaptureDevice>, requests: mpsc::Receiver<Request>) {
    let mut thumbnails = ThumbnailCapture {
        size: DEFAULT_THUMBNAIL_SIZE,
        converter: ColorConverter::new(Some(DEFAULT_THUMBNAIL_SIZE)),
    };
    for request in requests {
        match request {
            Request::List(reply) => {
                let _ = reply.send(device.source_list());
            }
            Request::Thumbnail { id, size, reply } => {
                let _ = reply.send(thumbnails.capture(device.as_mut(), id, size));
            }
        }
    }
    device.stop();
    debug!("Media list worker exiting");
}

// ── DesktopMediaList ──────────────────────────────────────────────────────────

/// Screens or windows of one capture device, kept in enumeration order.
pub struct DesktopMediaList {
    source_type:    SourceType,
    sources:        Vec<MediaSource>,
    thumbnail_size: Resolution,
    observer:       Option<Box<dyn MediaListObserver>>,
    requests:       Option<mpsc::Sender<Request>>,
    worker:         Option<JoinHandle<()>>,
}

impl DesktopMediaList {
    /// Open a device for `source_type` on the list's worker. The list starts
    /// empty; call [`update`](Self::update) to fill it.
    pub fn new(factory: &DeviceFactory, source_type: SourceType) -> Result<Self, CaptureError> {
        let factory = Arc::clone(factory);
        let (requests, incoming) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CaptureError>>();

        let worker = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_owned())
            .spawn(move || {
                let params = CaptureParameters { source_type, ..Default::default() };
                let opened = factory(&params).and_then(|mut device| device.start().map(|()| device));
                match opened {
                    Ok(device) => {
                        let _ = ready_tx.send(Ok(()));
                        serve(device, incoming);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(CaptureError::ThreadSpawn)?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                source_type,
                sources: Vec::new(),
                thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
                observer: None,
                requests: Some(requests),
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(CaptureError::WorkerLost)
            }
        }
    }

    pub fn with_observer(mut self, observer: impl MediaListObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn with_thumbnail_size(mut self, size: Resolution) -> Self {
        self.thumbnail_size = size.even_floor();
        self
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn sources(&self) -> &[MediaSource] {
        &self.sources
    }

    /// Re-enumerate the device and notify the observer about every source
    /// that appeared, disappeared or was renamed. Entries are reordered to
    /// follow the enumeration; thumbnails survive for sources that stay.
    ///
    /// `force_reload` first reports every known source as removed, so the
    /// observer sees the whole list again. Returns the number of sources.
    pub fn update(&mut self, force_reload: bool, get_thumbnails: bool) -> Result<usize, CaptureError> {
        let listed = self.request(Request::List)??;

        if force_reload {
            while let Some(removed) = self.sources.pop() {
                if let Some(observer) = self.observer.as_mut() {
                    observer.on_source_removed(self.sources.len(), &removed);
                }
            }
        }

        // Walk backwards so every reported index is still valid.
        for index in (0..self.sources.len()).rev() {
            let id = self.sources[index].source.id;
            if listed.iter().all(|s| s.id != id) {
                let removed = self.sources.remove(index);
                debug!("Source removed: {}", removed.source);
                if let Some(observer) = self.observer.as_mut() {
                    observer.on_source_removed(index, &removed);
                }
            }
        }

        let mut previous = std::mem::take(&mut self.sources);
        for (index, source) in listed.into_iter().enumerate() {
            match previous.iter().position(|m| m.source.id == source.id) {
                Some(at) => {
                    let mut entry = previous.remove(at);
                    let renamed = entry.source.title != source.title;
                    entry.source = source;
                    self.sources.push(entry);
                    if renamed {
                        debug!("Source renamed: {}", self.sources[index].source);
                        if let Some(observer) = self.observer.as_mut() {
                            observer.on_source_title_changed(index, &self.sources[index]);
                        }
                    }
                }
                None => {
                    debug!("Source added: {}", source);
                    self.sources.push(MediaSource { source, thumbnail: None });
                    if let Some(observer) = self.observer.as_mut() {
                        observer.on_source_added(index, &self.sources[index]);
                    }
                }
            }
        }

        if get_thumbnails {
            for index in 0..self.sources.len() {
                self.refresh_thumbnail(index)?;
            }
        }
        Ok(self.sources.len())
    }

    /// Capture a fresh thumbnail for `id`. Returns `None` when the source is
    /// not in the list or produced no frame (gone, minimized).
    pub fn thumbnail(&mut self, id: SourceId) -> Result<Option<Arc<I420Buffer>>, CaptureError> {
        match self.sources.iter().position(|m| m.source.id == id) {
            Some(index) => self.refresh_thumbnail(index),
            None => Ok(None),
        }
    }

    fn refresh_thumbnail(&mut self, index: usize) -> Result<Option<Arc<I420Buffer>>, CaptureError> {
        let id = self.sources[index].source.id;
        let size = self.thumbnail_size;
        let Some(thumbnail) = self.request(|reply| Request::Thumbnail { id, size, reply })? else {
            return Ok(None);
        };
        self.sources[index].thumbnail = Some(Arc::clone(&thumbnail));
        if let Some(observer) = self.observer.as_mut() {
            observer.on_source_thumbnail_changed(index, &self.sources[index]);
        }
        Ok(Some(thumbnail))
    }

    fn request<T>(&self, make: impl FnOnce(mpsc::Sender<T>) -> Request) -> Result<T, CaptureError> {
        let requests = self.requests.as_ref().ok_or(CaptureError::WorkerLost)?;
        let (reply, response) = mpsc::channel();
        requests.send(make(reply)).map_err(|_| CaptureError::WorkerLost)?;
        response.recv().map_err(|_| CaptureError::WorkerLost)
    }
}

impl Drop for DesktopMediaList {
    fn drop(&mut self) {
        drop(self.requests.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Media list worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for DesktopMediaList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesktopMediaList")
            .field("source_type", &self.source_type)
            .field("sources", &self.sources.len())
            .field("thumbnail_size", &self.thumbnail_size)
            .finish()
    }
}

/// Logs list changes at info level.
#[derive(Debug, Default)]
pub struct LoggingMediaListObserver;

impl MediaListObserver for LoggingMediaListObserver {
    fn on_source_added(&mut self, index: usize, source: &MediaSource) {
        info!("[{}] {} available", index, source.source);
    }

    fn on_source_removed(&mut self, index: usize, source: &MediaSource) {
        info!("[{}] {} gone", index, source.source);
    }

    fn on_source_title_changed(&mut self, index: usize, source: &MediaSource) {
        info!("[{}] {} renamed", index, source.source);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::synthetic::SyntheticControl;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl MediaListObserver for Recorder {
        fn on_source_added(&mut self, index: usize, source: &MediaSource) {
            self.0.lock().unwrap().push(format!("+{index} {}", source.source.title));
        }

        fn on_source_removed(&mut self, index: usize, source: &MediaSource) {
            self.0.lock().unwrap().push(format!("-{index} {}", source.source.title));
        }

        fn on_source_title_changed(&mut self, index: usize, source: &MediaSource) {
            self.0.lock().unwrap().push(format!("~{index} {}", source.source.title));
        }

        fn on_source_thumbnail_changed(&mut self, index: usize, _source: &MediaSource) {
            self.0.lock().unwrap().push(format!("#{index}"));
        }
    }

    fn window_list(control: &SyntheticControl) -> (DesktopMediaList, Recorder) {
        let recorder = Recorder::default();
        let list = DesktopMediaList::new(&control.device_factory(), SourceType::Application)
            .expect("media list")
            .with_observer(recorder.clone());
        (list, recorder)
    }

    #[test]
    fn reports_added_removed_and_renamed_sources() {
        let control = SyntheticControl::new();
        let editor = control.add_window("Editor", 800, 600);
        let terminal = control.add_window("Terminal", 640, 480);
        let (mut list, events) = window_list(&control);

        assert_eq!(list.update(false, false).expect("update"), 2);
        assert_eq!(events.take(), vec!["+0 Editor", "+1 Terminal"]);

        control.remove(editor);
        control.set_title(terminal, "Terminal - build");
        control.add_window("Browser", 1024, 768);
        assert_eq!(list.update(false, false).expect("update"), 2);
        assert_eq!(events.take(), vec!["-0 Editor", "~0 Terminal - build", "+1 Browser"]);

        control.restore(editor);
        assert_eq!(list.update(false, false).expect("update"), 3);
        assert_eq!(events.take(), vec!["+0 Editor"]);
        let titles: Vec<_> = list.sources().iter().map(|m| m.source.title.as_str()).collect();
        assert_eq!(titles, vec!["Editor", "Terminal - build", "Browser"]);

        // Nothing changed, nothing reported.
        list.update(false, false).expect("update");
        assert!(events.take().is_empty());
    }

    #[test]
    fn force_reload_reannounces_every_source() {
        let control = SyntheticControl::new();
        control.add_window("Editor", 800, 600);
        control.add_window("Terminal", 640, 480);
        let (mut list, events) = window_list(&control);
        list.update(false, false).expect("update");
        events.take();

        list.update(true, false).expect("update");
        assert_eq!(events.take(), vec!["-1 Terminal", "-0 Editor", "+0 Editor", "+1 Terminal"]);
    }

    #[test]
    fn thumbnails_are_scaled_and_kept_across_updates() {
        let control = SyntheticControl::new();
        let screen = control.add_screen("", 320, 240);
        let recorder = Recorder::default();
        let mut list = DesktopMediaList::new(&control.device_factory(), SourceType::FullScreen)
            .expect("media list")
            .with_observer(recorder.clone());

        list.update(false, true).expect("update");
        assert_eq!(recorder.take(), vec!["+0 Screen 1", "#0"]);
        let thumbnail = list.sources()[0].thumbnail.clone().expect("thumbnail");
        assert_eq!((thumbnail.width(), thumbnail.height()), (160, 90));

        list.update(false, false).expect("update");
        assert!(list.sources()[0].thumbnail.is_some());

        control.set_minimized(screen, true);
        assert!(list.thumbnail(screen).expect("thumbnail").is_none());
        assert!(list.thumbnail(SourceId(999)).expect("thumbnail").is_none());
    }

    #[test]
    fn unavailable_display_fails_creation() {
        let control = SyntheticControl::new();
        control.set_unavailable(true);
        let result = DesktopMediaList::new(&control.device_factory(), SourceType::FullScreen);
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable { .. })));
    }
}
