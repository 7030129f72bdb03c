//! Pipeline supervisor: capture → preprocess → detect → map → overlay
//!
//! Three contexts meet here. The capture thread offers frames into the
//! latest-frame slot. The single frame worker takes them one at a time,
//! preprocesses and submits. The detector settles requests on its own
//! threads and the listener publishes straight to the renderer from there.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, trace, warn};

use super::gateway::{
    DetectionError, DetectionGateway, DetectionListener, GatewayOptions, GatewayState,
    SubmitOutcome,
};
use super::latest::{latest_frame_channel, FrameReceiver, SlotMonitor};
use super::preprocess::{FramePreprocessor, PreprocessedImage};
use crate::capture::source::CaptureErrorHandler;
use crate::capture::{CaptureDevice, CaptureError, FrameSource};
use crate::detection::{map_detection, HandDetector, RawDetection};
use crate::overlay::OverlayRenderer;
use crate::{Config, Metrics, PipelineStats};

/// Capacity for pending detection notices. Notices past this are dropped
/// rather than blocking the detector. Capture failures have their own
/// channel and are never dropped.
const NOTICE_CAPACITY: usize = 32;

/// Notices surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The camera failed to bind or stopped producing; capture is halted
    /// until [`Pipeline::rebind`].
    CaptureFailed(String),
    /// One inference failed. The next frame proceeds normally.
    DetectionFailed(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to spawn frame worker: {0}")]
    Worker(#[from] std::io::Error),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Everything the pipeline needs to start.
pub struct PipelineParts {
    pub config: Config,
    pub device: Box<dyn CaptureDevice>,
    pub detector: Arc<dyn HandDetector>,
    /// Runtime for the inference deadline, if one is configured
    pub runtime: Option<Handle>,
}

/// Forwards detections straight to the overlay, bypassing any UI state.
struct OverlayListener {
    renderer: Arc<OverlayRenderer>,
    notices: flume::Sender<PipelineEvent>,
}

impl DetectionListener for OverlayListener {
    fn on_result(&self, detection: RawDetection, timestamp: Instant) {
        let keypoints = map_detection(&detection);
        trace!(
            points = keypoints.len(),
            "detection ready {:?} after capture",
            timestamp.elapsed()
        );
        self.renderer.publish(keypoints);
    }

    fn on_error(&self, error: DetectionError, _timestamp: Instant) {
        warn!("Hand detection error: {}", error);
        let _ = self
            .notices
            .try_send(PipelineEvent::DetectionFailed(error.to_string()));
    }
}

type PreviewSlot = ArcSwapOption<PreprocessedImage>;

/// The single frame-processing thread.
struct FrameWorker {
    handle: Option<JoinHandle<()>>,
}

impl FrameWorker {
    fn spawn(
        frames: FrameReceiver,
        mut preprocessor: FramePreprocessor,
        gateway: Arc<DetectionGateway>,
        preview: Arc<PreviewSlot>,
        stats: Arc<PipelineStats>,
        core: Option<usize>,
    ) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("frame-worker".into())
            .spawn(move || {
                if let Some(core) = core {
                    pin_to_core(core);
                }
                debug!("frame worker starting");

                while let Some(frame) = frames.recv() {
                    let sequence = frame.sequence();
                    let image = match preprocessor.process(frame) {
                        Ok(image) => image,
                        Err(e) => {
                            debug!(sequence, "dropping corrupt frame: {}", e);
                            stats.record_corrupt();
                            continue;
                        }
                    };
                    stats.record_processed();
                    preview.store(Some(Arc::new(image.clone())));

                    match gateway.submit(image) {
                        SubmitOutcome::Accepted => trace!(sequence, "frame submitted"),
                        SubmitOutcome::Rejected => {}
                        SubmitOutcome::Closed => break,
                    }
                }

                debug!("frame worker exiting");
            })?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Frame worker panicked");
            }
        }
    }
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .is_some_and(core_affinity::set_for_current);
    if pinned {
        info!("Frame worker pinned to core {}", core);
    } else {
        warn!("Could not pin frame worker to core {}", core);
    }
}

pub struct Pipeline {
    source: FrameSource,
    worker: FrameWorker,
    gateway: Arc<DetectionGateway>,
    renderer: Arc<OverlayRenderer>,
    preview: Arc<PreviewSlot>,
    /// At most one per binding, so unbounded
    failures: flume::Receiver<PipelineEvent>,
    notices: flume::Receiver<PipelineEvent>,
    frames: SlotMonitor,
    stats: Arc<PipelineStats>,
    shut_down: bool,
}

impl Pipeline {
    /// Wire the components and bind the camera.
    #[instrument(skip(parts), fields(device = %parts.device.name()))]
    pub fn start(parts: PipelineParts) -> Result<Self, PipelineError> {
        let PipelineParts {
            config,
            device,
            detector,
            runtime,
        } = parts;

        let (failures_tx, failures) = flume::unbounded();
        let (notices_tx, notices) = flume::bounded(NOTICE_CAPACITY);
        let renderer = Arc::new(OverlayRenderer::default());
        let preview = Arc::new(PreviewSlot::empty());
        let stats = Arc::new(PipelineStats::default());

        let listener = Arc::new(OverlayListener {
            renderer: renderer.clone(),
            notices: notices_tx,
        });
        let gateway = Arc::new(DetectionGateway::new(
            detector,
            listener,
            GatewayOptions {
                inference_timeout: config.pipeline.inference_timeout(),
            },
            runtime,
        ));

        let (frame_tx, frame_rx) = latest_frame_channel();
        let frames = frame_tx.monitor();

        let preprocessor =
            FramePreprocessor::new(config.detector.input_size, config.capture.mirror());
        let worker = match FrameWorker::spawn(
            frame_rx,
            preprocessor,
            gateway.clone(),
            preview.clone(),
            stats.clone(),
            config.pipeline.worker_core,
        ) {
            Ok(worker) => worker,
            Err(e) => {
                gateway.close();
                return Err(e.into());
            }
        };

        let on_error: CaptureErrorHandler = Arc::new(move |e: &CaptureError| {
            let _ = failures_tx.send(PipelineEvent::CaptureFailed(e.to_string()));
        });
        let source =
            FrameSource::new(frame_tx, on_error).with_stall_limit(config.capture.stall_limit);

        let mut pipeline = Self {
            source,
            worker,
            gateway,
            renderer,
            preview,
            failures,
            notices,
            frames,
            stats,
            shut_down: false,
        };
        // On failure the returned error drops `pipeline`, which shuts it down
        pipeline.source.bind(device)?;
        info!("Pipeline started");
        Ok(pipeline)
    }

    /// Bind a camera again after a capture failure.
    pub fn rebind(&mut self, device: Box<dyn CaptureDevice>) -> Result<(), CaptureError> {
        self.source.bind(device)
    }

    pub fn renderer(&self) -> &Arc<OverlayRenderer> {
        &self.renderer
    }

    /// Most recent preprocessed frame, for preview and snapshots.
    pub fn preview(&self) -> Option<Arc<PreprocessedImage>> {
        self.preview.load_full()
    }

    /// Next pending event without waiting. Capture failures come before
    /// detection notices.
    pub fn try_event(&self) -> Option<PipelineEvent> {
        self.failures
            .try_recv()
            .or_else(|_| self.notices.try_recv())
            .ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn wait_event(&self, timeout: Duration) -> Option<PipelineEvent> {
        if let Some(event) = self.try_event() {
            return Some(event);
        }
        flume::Selector::new()
            .recv(&self.failures, Result::ok)
            .recv(&self.notices, Result::ok)
            .wait_timeout(timeout)
            .ok()
            .flatten()
    }

    pub fn is_capturing(&self) -> bool {
        self.source.is_bound()
    }

    pub fn detector_state(&self) -> GatewayState {
        self.gateway.state()
    }

    pub fn metrics(&self) -> Metrics {
        let frames = self.frames.stats();
        let gateway = self.gateway.stats();
        Metrics {
            frames_captured: frames.offered,
            frames_dropped: frames.dropped,
            frames_processed: self.stats.frames_processed(),
            frames_corrupt: self.stats.frames_corrupt(),
            submissions_accepted: gateway.accepted,
            submissions_rejected: gateway.rejected,
            detections: gateway.results,
            detection_errors: gateway.errors,
        }
    }

    /// Release the camera, stop the frame worker, then close the detector.
    /// Idempotent; never fails. No callback starts after this returns.
    #[instrument(skip(self))]
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        self.source.close();
        self.worker.join();
        self.gateway.close();
        self.preview.store(None);
        info!("Pipeline shut down");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
