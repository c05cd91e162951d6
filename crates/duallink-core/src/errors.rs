use thiserror::Error;

use crate::types::SourceId;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture device unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    #[error("Capture source {0} not found")]
    SourceNotFound(SourceId),

    #[error("Failed to spawn capture thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("Capture thread exited before reporting readiness")]
    WorkerLost,
}

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("No {backend} H.264 encoder available")]
    BackendUnavailable { backend: String },

    #[error("Encoder initialization failed: {reason}")]
    InitFailed { reason: String },

    #[error("Failed to encode frame: {reason}")]
    EncodeFailed { reason: String },

    #[error("Encoder not initialized")]
    NotInitialized,

    #[error("GStreamer pipeline error: {0}")]
    GStreamerPipeline(String),
}
