//! Stand-in detector used when no model backend is linked

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info};

use super::{DetectorError, DetectorOptions, HandDetector, RawDetection};
use crate::pipeline::gateway::Completion;
use crate::pipeline::preprocess::PreprocessedImage;

/// Reports zero hands for every image after a fixed latency.
///
/// Completions fire on the tokio runtime, which plays the part of the model's
/// own inference threads.
pub struct StubDetector {
    runtime: Handle,
    latency: Duration,
    closed: Arc<AtomicBool>,
}

impl StubDetector {
    pub fn new(runtime: Handle, options: DetectorOptions, latency: Duration) -> Self {
        info!(
            max_hands = options.max_hands,
            input_size = options.input_size,
            ?latency,
            "Stub hand detector ready"
        );
        Self {
            runtime,
            latency,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl HandDetector for StubDetector {
    fn detect_async(&self, image: PreprocessedImage, completion: Completion) {
        let latency = self.latency;
        let closed = self.closed.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(latency).await;
            drop(image);
            if closed.load(Ordering::Acquire) {
                // Dropping the completion abandons the request
                debug!("Stub detector closed mid-inference");
                return;
            }
            completion.succeed(RawDetection::empty());
        });
    }

    fn close(&self) -> Result<(), DetectorError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
