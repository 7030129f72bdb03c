//! Single in-flight inference gate in front of the hand detector
//!
//! The gateway is Idle or Busy. `submit` wins the Idle → Busy transition with a
//! compare-and-swap or drops its image; nothing is ever queued. Each accepted
//! request hands the detector a [`Completion`], and whichever settles it first
//! (the detector, its drop, or the optional deadline) moves the gateway back to
//! Idle *before* the listener runs, so a submit issued from inside a callback
//! is accepted.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, trace, warn};

use super::preprocess::PreprocessedImage;
use crate::detection::{DetectorError, HandDetector, RawDetection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GatewayState {
    Idle = 0,
    Busy = 1,
}

/// Atomic two-state cell. The CAS is the only read-modify-write in the pipeline.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(GatewayState::Idle as u8))
    }

    /// Idle → Busy. Exactly one of several racing callers succeeds.
    fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(
                GatewayState::Idle as u8,
                GatewayState::Busy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn release(&self) {
        self.0.store(GatewayState::Idle as u8, Ordering::Release);
    }

    fn get(&self) -> GatewayState {
        match self.0.load(Ordering::Acquire) {
            0 => GatewayState::Idle,
            _ => GatewayState::Busy,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectionError {
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error("detector dropped the request without a result")]
    Abandoned,
    #[error("inference exceeded the {0:?} deadline")]
    TimedOut(Duration),
}

/// Receives the outcome of every accepted submission, exactly once each.
///
/// Called from whatever context settles the request, concurrently with the
/// frame worker.
pub trait DetectionListener: Send + Sync {
    /// `timestamp` is the capture time of the frame the detection came from.
    fn on_result(&self, detection: RawDetection, timestamp: Instant);

    fn on_error(&self, error: DetectionError, timestamp: Instant);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handed to the detector; a callback will follow
    Accepted,
    /// An inference is already in flight; the image was dropped
    Rejected,
    /// The gateway is closed; the image was dropped
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayOptions {
    /// Settle a request as timed out after this long. `None` keeps the legacy
    /// behaviour where a stalled detector holds the gateway Busy indefinitely.
    pub inference_timeout: Option<Duration>,
}

/// Counter snapshot of a gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub accepted: u64,
    pub rejected: u64,
    pub results: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    results: AtomicU64,
    errors: AtomicU64,
}

struct Shared {
    state: StateCell,
    closed: AtomicBool,
    listener: Arc<dyn DetectionListener>,
    counters: CachePadded<Counters>,
}

/// One accepted submission.
struct Ticket {
    shared: Arc<Shared>,
    settled: AtomicBool,
    timestamp: Instant,
    sequence: u64,
    submitted_at: Instant,
}

impl Ticket {
    fn settle(&self, outcome: Result<RawDetection, DetectionError>) {
        // Late completions after a deadline lose here and must not touch the state
        if self.settled.swap(true, Ordering::AcqRel) {
            trace!(sequence = self.sequence, "request already settled");
            return;
        }

        let shared = &self.shared;
        shared.state.release();

        if shared.closed.load(Ordering::Acquire) {
            debug!(sequence = self.sequence, "gateway closed, dropping outcome");
            return;
        }

        match outcome {
            Ok(detection) => {
                debug!(
                    sequence = self.sequence,
                    hands = detection.hands.len(),
                    "inference took {:?}",
                    self.submitted_at.elapsed()
                );
                shared.counters.results.fetch_add(1, Ordering::Relaxed);
                metrics::histogram!("detection_latency_ms")
                    .record(self.timestamp.elapsed().as_secs_f64() * 1000.0);
                shared.listener.on_result(detection, self.timestamp);
            }
            Err(error) => {
                debug!(sequence = self.sequence, %error, "inference failed");
                shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("detections_failed").increment(1);
                shared.listener.on_error(error, self.timestamp);
            }
        }
    }
}

/// Promise that a [`HandDetector`] settles exactly once per request.
///
/// Settling consumes the completion. Dropping it unsettled reports
/// [`DetectionError::Abandoned`].
pub struct Completion {
    ticket: Option<Arc<Ticket>>,
    timestamp: Instant,
    sequence: u64,
}

impl Completion {
    /// Capture timestamp of the submitted frame, for detectors that need a
    /// monotonic clock per call.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn succeed(mut self, detection: RawDetection) {
        if let Some(ticket) = self.ticket.take() {
            ticket.settle(Ok(detection));
        }
    }

    pub fn fail(mut self, error: DetectorError) {
        if let Some(ticket) = self.ticket.take() {
            ticket.settle(Err(error.into()));
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            ticket.settle(Err(DetectionError::Abandoned));
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("sequence", &self.sequence)
            .finish()
    }
}

pub struct DetectionGateway {
    shared: Arc<Shared>,
    detector: Arc<dyn HandDetector>,
    timeout: Option<Duration>,
    runtime: Option<Handle>,
}

impl DetectionGateway {
    /// `runtime` drives the inference deadline; without it no deadline applies.
    pub fn new(
        detector: Arc<dyn HandDetector>,
        listener: Arc<dyn DetectionListener>,
        options: GatewayOptions,
        runtime: Option<Handle>,
    ) -> Self {
        let timeout = match (options.inference_timeout, &runtime) {
            (Some(timeout), Some(_)) => {
                info!("Inference deadline set to {:?}", timeout);
                Some(timeout)
            }
            (Some(_), None) => {
                warn!("Inference deadline requested without a runtime; requests may stall");
                None
            }
            (None, _) => None,
        };

        Self {
            shared: Arc::new(Shared {
                state: StateCell::new(),
                closed: AtomicBool::new(false),
                listener,
                counters: CachePadded::new(Counters::default()),
            }),
            detector,
            timeout,
            runtime,
        }
    }

    /// Hand an image to the detector if none is in flight. Never blocks.
    pub fn submit(&self, image: PreprocessedImage) -> SubmitOutcome {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return SubmitOutcome::Closed;
        }
        if !shared.state.try_acquire() {
            shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("submissions_rejected").increment(1);
            trace!(sequence = image.sequence, "detector busy, frame shed");
            return SubmitOutcome::Rejected;
        }
        shared.counters.accepted.fetch_add(1, Ordering::Relaxed);

        let ticket = Arc::new(Ticket {
            shared: shared.clone(),
            settled: AtomicBool::new(false),
            timestamp: image.timestamp,
            sequence: image.sequence,
            submitted_at: Instant::now(),
        });

        if let (Some(timeout), Some(runtime)) = (self.timeout, &self.runtime) {
            let ticket = ticket.clone();
            runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                ticket.settle(Err(DetectionError::TimedOut(timeout)));
            });
        }

        let completion = Completion {
            timestamp: ticket.timestamp,
            sequence: ticket.sequence,
            ticket: Some(ticket),
        };
        self.detector.detect_async(image, completion);
        SubmitOutcome::Accepted
    }

    pub fn state(&self) -> GatewayState {
        self.shared.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> GatewayStats {
        let c = &self.shared.counters;
        GatewayStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            results: c.results.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and release the detector. Idempotent; close errors
    /// are logged, never returned. No callback starts once the close is
    /// visible; one that already passed the check may still be running.
    #[instrument(skip(self))]
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.detector.close() {
            warn!("Ignoring detector close error: {}", e);
        }
        info!("Detection gateway closed");
    }
}
