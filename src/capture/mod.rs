pub mod decoder;
pub mod frame;
pub mod source;
pub mod synthetic;
pub mod v4l2;

pub use frame::{Frame, FrameMetadata, PixelFormat, Rotation};
pub use source::FrameSource;
pub use synthetic::TestPatternCapture;
pub use v4l2::V4l2Capture;

use std::time::Duration;

use thiserror::Error;

/// Errors raised while binding a camera or pulling frames from it.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to bind capture device {device}: {reason}")]
    Bind { device: String, reason: String },
    #[error("frame acquisition failed: {0}")]
    Acquire(#[from] std::io::Error),
    #[error("failed to decode {format:?} frame: {reason}")]
    Decode { format: PixelFormat, reason: String },
    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("rotation must be a multiple of 90 degrees, got {0}")]
    InvalidRotation(u32),
    #[error("capture stream not started")]
    NotStarted,
    /// No frame arrived within the device's wait. The capture loop treats
    /// this as a tick and only reports it once it repeats.
    #[error("no frame within {0:?}")]
    Timeout(Duration),
}

/// A camera that yields frames one at a time.
///
/// `next_frame` may block until the device has a frame ready. Implementations
/// run on the dedicated capture thread owned by [`FrameSource`].
pub trait CaptureDevice: Send {
    /// Human readable device name, used in logs and error reports.
    fn name(&self) -> String;

    /// Acquire the device and start streaming.
    fn start(&mut self) -> Result<(), CaptureError>;

    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Stop streaming and release the device. Must be safe to call twice.
    fn stop(&mut self);
}
