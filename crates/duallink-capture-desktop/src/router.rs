use std::sync::Arc;

use duallink_core::{EncodedImage, I420Buffer};
use duallink_encoder::{EncodeAdapter, EncoderConfig};
use tracing::debug;

use crate::scheduler::StopSignal;

// ── Callbacks ─────────────────────────────────────────────────────────────────

/// Receives converted frames on the capture thread.
///
/// Keeping the `Arc` past the call is allowed; the pipeline then allocates a
/// new buffer for the next frame instead of overwriting this one.
pub trait RawFrameCallback: Send {
    fn on_frame(&mut self, frame: Arc<I420Buffer>);
}

impl<F> RawFrameCallback for F
where
    F: FnMut(Arc<I420Buffer>) + Send,
{
    fn on_frame(&mut self, frame: Arc<I420Buffer>) {
        self(frame)
    }
}

/// Receives H.264 access units on the capture thread.
pub trait EncodedImageCallback: Send {
    fn on_encoded_image(&mut self, image: &EncodedImage);
}

impl<F> EncodedImageCallback for F
where
    F: FnMut(&EncodedImage) + Send,
{
    fn on_encoded_image(&mut self, image: &EncodedImage) {
        self(image)
    }
}

// ── DeliveryRouter ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    None,
    Raw,
    Encoded,
}

pub enum DeliveryTarget {
    None,
    Raw(Box<dyn RawFrameCallback>),
    Encoded(Box<dyn EncodedImageCallback>),
}

/// Sends each converted frame to the single registered callback, through the
/// encoder when the target is encoded.
pub struct DeliveryRouter {
    target:  DeliveryTarget,
    encoder: EncodeAdapter,
}

impl DeliveryRouter {
    pub fn new(encoder: EncodeAdapter) -> Self {
        Self { target: DeliveryTarget::None, encoder }
    }

    pub fn mode(&self) -> DeliveryMode {
        match self.target {
            DeliveryTarget::None => DeliveryMode::None,
            DeliveryTarget::Raw(_) => DeliveryMode::Raw,
            DeliveryTarget::Encoded(_) => DeliveryMode::Encoded,
        }
    }

    /// Replace the target with a raw callback. Releases any encoder session.
    pub fn set_raw_callback(&mut self, callback: Box<dyn RawFrameCallback>) {
        self.encoder.release();
        self.target = DeliveryTarget::Raw(callback);
    }

    /// Replace the target with an encoded callback using `config`.
    pub fn set_encoded_callback(&mut self, callback: Box<dyn EncodedImageCallback>, config: EncoderConfig) {
        self.encoder.configure(config);
        self.target = DeliveryTarget::Encoded(callback);
    }

    /// Drop the registered callback.
    pub fn clear(&mut self, release_encoder: bool) {
        self.target = DeliveryTarget::None;
        if release_encoder {
            self.encoder.release();
        }
    }

    pub fn encoder(&self) -> &EncodeAdapter {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut EncodeAdapter {
        &mut self.encoder
    }

    /// Deliver one frame. Returns how many callback invocations it caused.
    ///
    /// Access units left over once `stop` is raised (possibly by the
    /// callback itself) are dropped.
    pub fn deliver(&mut self, frame: Arc<I420Buffer>, stop: &StopSignal) -> usize {
        match &mut self.target {
            DeliveryTarget::None => 0,
            DeliveryTarget::Raw(callback) => {
                callback.on_frame(frame);
                1
            }
            DeliveryTarget::Encoded(callback) => {
                let images = self.encoder.encode_frame(&frame);
                drop(frame);
                let mut delivered = 0;
                for image in &images {
                    if stop.is_stopped() {
                        break;
                    }
                    debug!(
                        "Encoded {} bytes {}×{} key={}",
                        image.size(),
                        image.width,
                        image.height,
                        image.is_keyframe
                    );
                    callback.on_encoded_image(image);
                    delivered += 1;
                }
                delivered
            }
        }
    }
}

impl std::fmt::Debug for DeliveryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryRouter")
            .field("mode", &self.mode())
            .field("encoder", &self.encoder)
            .finish()
    }
}
