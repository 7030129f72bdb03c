//! Seam to the external hand-landmark model

pub mod mapper;
pub mod stub;

pub use mapper::map_detection;
pub use stub::StubDetector;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::gateway::Completion;
use crate::pipeline::preprocess::PreprocessedImage;

/// Points per detected hand.
pub const HAND_POINTS: usize = 21;

/// One model output point, normalized to the input image (`x`, `y` in 0..1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedLandmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Raw detector output: one point list per detected hand, in model order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub hands: Vec<Vec<NormalizedLandmark>>,
}

impl RawDetection {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Error reported by a detector backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("detector error: {0}")]
pub struct DetectorError(pub String);

impl DetectorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Startup configuration handed to a detector backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorOptions {
    pub max_hands: usize,
    /// Side of the square RGB24 input image
    pub input_size: u32,
    /// Live-stream mode: results arrive asynchronously, one per submitted image
    pub streaming: bool,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            max_hands: 2,
            input_size: 256,
            streaming: true,
        }
    }
}

/// An asynchronous image → hand landmarks model.
///
/// `detect_async` must return promptly and settle `completion` exactly once,
/// from any thread, when inference finishes. Dropping the completion without
/// settling it reports the request as abandoned. The image belongs to the
/// detector until it drops it.
pub trait HandDetector: Send + Sync {
    fn detect_async(&self, image: PreprocessedImage, completion: Completion);

    /// Release model resources. In-flight requests may be abandoned.
    fn close(&self) -> Result<(), DetectorError>;
}
