pub mod config;
pub mod errors;
pub mod frame;
pub mod types;

pub use config::{CaptureParameters, CapturePolicy, EncoderBackend, EncoderQuality, SourceType};
pub use errors::{CaptureError, EncoderError};
pub use frame::{i420_data_size, EncodedImage, FrameType, I420Buffer};
pub use types::*;
