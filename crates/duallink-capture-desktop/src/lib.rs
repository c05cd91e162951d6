//! duallink-capture-desktop: screen and window capture pipeline.
//!
//! # Capture backends
//!
//! | Backend | Feature | Sources |
//! |---------|---------|---------|
//! | Synthetic test pattern | always | scripted screens and windows |
//! | X11 XShm (`scrap`) | `xshm` | one screen per X display |
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use duallink_capture_desktop::{DesktopCapturer, SyntheticControl};
//! use duallink_core::{CaptureParameters, I420Buffer};
//!
//! let control = SyntheticControl::new();
//! control.add_screen("", 1920, 1080);
//! let capturer = DesktopCapturer::builder()
//!     .device_factory(control.device_factory())
//!     .build();
//!
//! let params = CaptureParameters { fps: 30, ..Default::default() };
//! capturer.start_capturing_raw(|frame: Arc<I420Buffer>| {
//!     // frame: I420 planes, even width/height
//! }, params);
//! // ...
//! capturer.stop_capturing(true);
//! ```
//!
//! # Architecture
//!
//! ```text
//! CaptureScheduler (worker thread, paced at 1/fps)
//!        │ capture_frame
//!        ▼
//! CaptureDevice ──► DesktopFrame (BGRA, strided)
//!                          │
//!                    ColorConverter ──► FrameBufferPool (Arc<I420Buffer>)
//!                          │
//!                    DeliveryRouter ──► RawFrameCallback
//!                          │
//!                    EncodeAdapter  ──► EncodedImageCallback
//! ```
//!
//! [`DesktopMediaList`] keeps a separate device on its own thread to track
//! which screens or windows exist and to capture their thumbnails.

pub mod buffer_pool;
pub mod capturer;
pub mod convert;
pub mod device;
pub mod media_list;
pub mod router;
pub mod scheduler;
pub mod source;
pub mod synthetic;

#[cfg(feature = "xshm")]
pub mod xshm;

pub use buffer_pool::FrameBufferPool;
pub use capturer::{DesktopCapturer, DesktopCapturerBuilder, SessionState};
pub use convert::{ColorConverter, Conversion};
pub use device::{default_device_factory, CaptureDevice, CaptureResult, DesktopFrame, DeviceFactory};
pub use media_list::{
    DesktopMediaList, LoggingMediaListObserver, MediaListObserver, MediaSource, DEFAULT_THUMBNAIL_SIZE,
};
pub use router::{DeliveryMode, DeliveryRouter, EncodedImageCallback, RawFrameCallback};
pub use scheduler::{CaptureScheduler, Pacer, StopSignal, Tick};
pub use source::{SourceObserver, SourceSelector};
pub use synthetic::{SyntheticControl, SyntheticDevice};
