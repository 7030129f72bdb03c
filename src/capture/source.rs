//! Capture thread feeding the keep-only-latest frame channel

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, instrument, warn};

use super::{CaptureDevice, CaptureError};
use crate::pipeline::latest::FrameSender;

/// Called once per binding when the device fails to bind or stops producing.
pub type CaptureErrorHandler = Arc<dyn Fn(&CaptureError) + Send + Sync>;

/// Consecutive [`CaptureError::Timeout`]s tolerated before the device counts
/// as failed.
pub const DEFAULT_STALL_LIMIT: u32 = 5;

struct Binding {
    device: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns the camera binding and the thread that pulls frames from it.
///
/// Frames are offered to the latest-frame channel without ever waiting on the
/// consumer. A bind or acquisition failure is reported to the error handler
/// once, after which the source stays silent until [`FrameSource::bind`] is
/// called again. A device that times out waiting for a frame is retried
/// until the stall limit is reached.
pub struct FrameSource {
    sender: Option<FrameSender>,
    on_error: CaptureErrorHandler,
    stall_limit: u32,
    binding: Option<Binding>,
}

impl FrameSource {
    pub fn new(sender: FrameSender, on_error: CaptureErrorHandler) -> Self {
        Self {
            sender: Some(sender),
            on_error,
            stall_limit: DEFAULT_STALL_LIMIT,
            binding: None,
        }
    }

    pub fn with_stall_limit(mut self, stall_limit: u32) -> Self {
        self.stall_limit = stall_limit.max(1);
        self
    }

    /// Bind a device and start producing frames, replacing any current binding.
    #[instrument(skip(self, device), fields(device = %device.name()))]
    pub fn bind(&mut self, device: Box<dyn CaptureDevice>) -> Result<(), CaptureError> {
        self.release();

        let name = device.name();
        let sender = self.sender.clone().ok_or_else(|| CaptureError::Bind {
            device: name.clone(),
            reason: "frame source is closed".into(),
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name("frame-source".into())
            .spawn({
                let stop = stop.clone();
                let on_error = self.on_error.clone();
                let stall_limit = self.stall_limit;
                move || run_capture(device, sender, stop, on_error, stall_limit)
            })?;

        info!("Capture bound to {}", name);
        self.binding = Some(Binding {
            device: name,
            stop,
            handle,
        });
        Ok(())
    }

    /// Whether a capture thread is currently producing frames.
    pub fn is_bound(&self) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| !binding.handle.is_finished())
    }

    /// Stop the capture thread and release the device. Idempotent.
    pub fn release(&mut self) {
        let Some(binding) = self.binding.take() else {
            return;
        };
        binding.stop.store(true, Ordering::Release);
        if binding.handle.join().is_err() {
            warn!("Capture thread for {} panicked", binding.device);
        }
        info!("Capture released from {}", binding.device);
    }

    /// Release the binding and disconnect the consumer.
    pub fn close(&mut self) {
        self.release();
        self.sender = None;
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_capture(
    mut device: Box<dyn CaptureDevice>,
    sender: FrameSender,
    stop: Arc<AtomicBool>,
    on_error: CaptureErrorHandler,
    stall_limit: u32,
) {
    if let Err(e) = device.start() {
        error!("Failed to bind {}: {}", device.name(), e);
        on_error(&e);
        return;
    }

    let mut stalls = 0;
    while !stop.load(Ordering::Acquire) {
        match device.next_frame() {
            Ok(frame) => {
                stalls = 0;
                if sender.offer(frame) {
                    debug!("Dropped stale frame");
                }
            }
            Err(CaptureError::Timeout(waited)) if stalls + 1 < stall_limit => {
                stalls += 1;
                warn!(stalls, "No frame from {} within {:?}", device.name(), waited);
            }
            Err(e) => {
                if !stop.load(Ordering::Acquire) {
                    error!("Capture error on {}: {}", device.name(), e);
                    on_error(&e);
                }
                break;
            }
        }
    }

    device.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, Rotation, TestPatternCapture};
    use crate::pipeline::latest::latest_frame_channel;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FailingBind;

    impl CaptureDevice for FailingBind {
        fn name(&self) -> String {
            "failing".into()
        }

        fn start(&mut self) -> Result<(), CaptureError> {
            Err(CaptureError::Bind {
                device: "failing".into(),
                reason: "no camera".into(),
            })
        }

        fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            unreachable!("never started")
        }

        fn stop(&mut self) {}
    }

    /// Times out on every call, except every `frame_every`-th call
    /// (when non-zero) which yields a frame.
    struct StallingCamera {
        calls: Arc<AtomicUsize>,
        frame_every: usize,
        pattern: TestPatternCapture,
    }

    impl StallingCamera {
        fn new(frame_every: usize) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let camera = Self {
                calls: calls.clone(),
                frame_every,
                pattern: TestPatternCapture::new(4, 4, 0, Rotation::Deg0),
            };
            (camera, calls)
        }
    }

    impl CaptureDevice for StallingCamera {
        fn name(&self) -> String {
            "stalling".into()
        }

        fn start(&mut self) -> Result<(), CaptureError> {
            self.pattern.start()
        }

        fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.frame_every != 0 && call % self.frame_every == 0 {
                return self.pattern.next_frame();
            }
            let wait = Duration::from_millis(2);
            thread::sleep(wait);
            Err(CaptureError::Timeout(wait))
        }

        fn stop(&mut self) {
            self.pattern.stop();
        }
    }

    fn counting_handler() -> (CaptureErrorHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let handler: CaptureErrorHandler = {
            let count = count.clone();
            Arc::new(move |_e: &CaptureError| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        (handler, count)
    }

    fn wait_until_unbound(source: &FrameSource) {
        for _ in 0..200 {
            if !source.is_bound() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("capture thread did not stop");
    }

    #[test]
    fn bind_failure_is_reported_once() {
        let (tx, rx) = latest_frame_channel();
        let (handler, errors) = counting_handler();
        let mut source = FrameSource::new(tx, handler);

        source.bind(Box::new(FailingBind)).unwrap();
        wait_until_unbound(&source);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn acquisition_failure_halts_until_rebind() {
        let (tx, rx) = latest_frame_channel();
        let (handler, errors) = counting_handler();
        let mut source = FrameSource::new(tx, handler);

        let device = TestPatternCapture::new(4, 4, 0, Rotation::Deg0).with_frame_limit(3);
        source.bind(Box::new(device)).unwrap();
        wait_until_unbound(&source);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_recv().map(|f| f.sequence()), Some(3));

        let device = TestPatternCapture::new(4, 4, 0, Rotation::Deg0).with_frame_limit(1);
        source.bind(Box::new(device)).unwrap();
        wait_until_unbound(&source);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(rx.try_recv().map(|f| f.sequence()), Some(1));
    }

    #[test]
    fn release_is_silent_and_idempotent() {
        let (tx, rx) = latest_frame_channel();
        let (handler, errors) = counting_handler();
        let mut source = FrameSource::new(tx, handler);

        source
            .bind(Box::new(TestPatternCapture::new(4, 4, 500, Rotation::Deg0)))
            .unwrap();
        assert!(rx.recv().is_some());
        source.release();
        source.release();
        assert!(!source.is_bound());
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        source.close();
        while rx.recv().is_some() {}
    }

    #[test]
    fn closed_source_refuses_bind() {
        let (tx, _rx) = latest_frame_channel();
        let (handler, _) = counting_handler();
        let mut source = FrameSource::new(tx, handler);
        source.close();
        let err = source
            .bind(Box::new(TestPatternCapture::new(4, 4, 0, Rotation::Deg0)))
            .unwrap_err();
        assert!(matches!(err, CaptureError::Bind { .. }));
    }

    #[test]
    fn stalled_device_is_reported_after_the_stall_limit() {
        let (tx, _rx) = latest_frame_channel();
        let (handler, errors) = counting_handler();
        let mut source = FrameSource::new(tx, handler).with_stall_limit(3);

        let (camera, calls) = StallingCamera::new(0);
        source.bind(Box::new(camera)).unwrap();
        wait_until_unbound(&source);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn frames_between_timeouts_reset_the_stall_count() {
        let (tx, rx) = latest_frame_channel();
        let (handler, errors) = counting_handler();
        let mut source = FrameSource::new(tx, handler).with_stall_limit(3);

        // Two timeouts, then a frame, forever
        let (camera, calls) = StallingCamera::new(3);
        source.bind(Box::new(camera)).unwrap();
        while calls.load(Ordering::SeqCst) < 30 {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(source.is_bound());
        assert!(rx.try_recv().is_some());

        source.release();
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn release_returns_while_device_stalls() {
        let (tx, _rx) = latest_frame_channel();
        let (handler, errors) = counting_handler();
        let mut source = FrameSource::new(tx, handler).with_stall_limit(u32::MAX);

        let (camera, calls) = StallingCamera::new(0);
        source.bind(Box::new(camera)).unwrap();
        while calls.load(Ordering::SeqCst) < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        source.release();
        assert!(!source.is_bound());
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }
}
