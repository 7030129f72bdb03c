//! Keep-only-latest frame handoff between the capture thread and the frame worker

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender};

use crate::capture::Frame;

struct Shared {
    /// The single pending frame, replaced wholesale by the producer
    slot: ArcSwapOption<Frame>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_offered: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Counter snapshot of a latest-frame channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub offered: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Create a connected producer/consumer pair.
///
/// The sender may be cloned so a rebound capture thread can reuse the same
/// channel; the receiver cannot, so frames always go to exactly one consumer.
pub fn latest_frame_channel() -> (FrameSender, FrameReceiver) {
    let shared = Arc::new(Shared {
        slot: ArcSwapOption::empty(),
        stats: CachePadded::new(Stats::default()),
    });
    // Doorbell of capacity 1: a ring that is already pending covers any later frame
    let (bell_tx, bell_rx) = flume::bounded(1);
    (
        FrameSender {
            shared: shared.clone(),
            bell: bell_tx,
        },
        FrameReceiver {
            shared,
            bell: bell_rx,
        },
    )
}

#[derive(Clone)]
pub struct FrameSender {
    shared: Arc<Shared>,
    bell: Sender<()>,
}

impl FrameSender {
    /// Producer: replace the pending frame. Never blocks.
    ///
    /// Returns `true` if an undelivered frame was displaced and dropped.
    pub fn offer(&self, frame: Frame) -> bool {
        let stats = &self.shared.stats;
        stats.frames_offered.fetch_add(1, Ordering::Relaxed);

        let displaced = self.shared.slot.swap(Some(Arc::new(frame))).is_some();
        if displaced {
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_dropped").increment(1);
        }

        // A full bell already covers this frame; a missing consumer just drops it
        let _ = self.bell.try_send(());
        displaced
    }

    pub fn stats(&self) -> SlotStats {
        self.shared.snapshot()
    }

    /// Read-only stats handle that does not keep the channel open.
    pub fn monitor(&self) -> SlotMonitor {
        SlotMonitor {
            shared: self.shared.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SlotMonitor {
    shared: Arc<Shared>,
}

impl SlotMonitor {
    pub fn stats(&self) -> SlotStats {
        self.shared.snapshot()
    }
}

pub struct FrameReceiver {
    shared: Arc<Shared>,
    bell: Receiver<()>,
}

impl FrameReceiver {
    /// Consumer: block until a frame is pending.
    ///
    /// Returns `None` once every [`FrameSender`] is gone and nothing is pending.
    pub fn recv(&self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.take() {
                return Some(frame);
            }
            if self.bell.recv().is_err() {
                // Senders gone; a last frame may have landed before the disconnect
                return self.take();
            }
        }
    }

    /// Consumer: take the pending frame without waiting.
    pub fn try_recv(&self) -> Option<Frame> {
        let _ = self.bell.try_recv();
        self.take()
    }

    pub fn stats(&self) -> SlotStats {
        self.shared.snapshot()
    }

    fn take(&self) -> Option<Frame> {
        let frame = self.shared.slot.swap(None)?;
        self.shared
            .stats
            .frames_delivered
            .fetch_add(1, Ordering::Relaxed);
        // The producer let go of its reference inside `swap`, so this is the only one
        Some(Arc::try_unwrap(frame).unwrap_or_else(|shared| (*shared).clone()))
    }
}

impl Shared {
    fn snapshot(&self) -> SlotStats {
        SlotStats {
            offered: self.stats.frames_offered.load(Ordering::Relaxed),
            delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureDevice, Rotation, TestPatternCapture};
    use std::thread;
    use std::time::Duration;

    fn frames(n: usize) -> Vec<Frame> {
        let mut cap = TestPatternCapture::new(4, 4, 0, Rotation::Deg0);
        cap.start().unwrap();
        (0..n).map(|_| cap.next_frame().unwrap()).collect()
    }

    #[test]
    fn newer_frame_replaces_pending_one() {
        let (tx, rx) = latest_frame_channel();
        let mut it = frames(2).into_iter();
        assert!(!tx.offer(it.next().unwrap()));
        assert!(tx.offer(it.next().unwrap()));

        let got = rx.try_recv().unwrap();
        assert_eq!(got.sequence(), 2);
        assert!(rx.try_recv().is_none());
        assert_eq!(
            rx.stats(),
            SlotStats {
                offered: 2,
                delivered: 1,
                dropped: 1
            }
        );
    }

    #[test]
    fn delivered_sequence_never_goes_backwards() {
        let (tx, rx) = latest_frame_channel();
        let producer = thread::spawn(move || {
            for frame in frames(200) {
                tx.offer(frame);
            }
        });

        let mut last = 0;
        while let Some(frame) = rx.recv() {
            assert!(frame.sequence() > last);
            last = frame.sequence();
        }
        producer.join().unwrap();
        assert_eq!(last, 200);
    }

    #[test]
    fn recv_wakes_on_offer() {
        let (tx, rx) = latest_frame_channel();
        let consumer = thread::spawn(move || rx.recv().map(|f| f.sequence()));
        thread::sleep(Duration::from_millis(20));
        tx.offer(frames(1).remove(0));
        assert_eq!(consumer.join().unwrap(), Some(1));
    }

    #[test]
    fn recv_ends_when_senders_drop() {
        let (tx, rx) = latest_frame_channel();
        let monitor = tx.monitor();
        tx.offer(frames(1).remove(0));
        drop(tx);
        assert_eq!(rx.recv().map(|f| f.sequence()), Some(1));
        assert!(rx.recv().is_none());
        assert_eq!(monitor.stats().delivered, 1);
    }
}
