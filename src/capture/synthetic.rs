//! Moving gradient test pattern, used when no camera is available

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::frame::{Frame, FrameMetadata, PixelFormat, Rotation};
use super::{CaptureDevice, CaptureError};

pub struct TestPatternCapture {
    width: u32,
    height: u32,
    rotation: Rotation,
    interval: Option<Duration>,
    limit: Option<u64>,
    sequence: u64,
    running: bool,
    last: Option<Instant>,
}

impl TestPatternCapture {
    /// A pattern source paced at `fps` frames per second (0 = unpaced).
    pub fn new(width: u32, height: u32, fps: u32, rotation: Rotation) -> Self {
        Self {
            width,
            height,
            rotation,
            interval: (fps > 0).then(|| Duration::from_secs(1) / fps),
            limit: None,
            sequence: 0,
            running: false,
            last: None,
        }
    }

    /// Fail with an acquisition error after `frames` frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    fn render(&self) -> Vec<u8> {
        // Phase repeats every 64 frames
        let shift = self.sequence.wrapping_mul(4) % 256;
        let width = u64::from(self.width.max(1));
        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                pixels.push(((u64::from(x) + shift) * 255 / width) as u8);
                pixels.push((y * 255 / self.height.max(1)) as u8);
                pixels.push(shift as u8);
            }
        }
        pixels
    }
}

impl CaptureDevice for TestPatternCapture {
    fn name(&self) -> String {
        format!("synthetic:{}x{}", self.width, self.height)
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        self.running = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if !self.running {
            return Err(CaptureError::NotStarted);
        }
        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            return Err(CaptureError::Acquire(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "test pattern exhausted",
            )));
        }

        if let (Some(interval), Some(last)) = (self.interval, self.last) {
            if let Some(wait) = interval.checked_sub(last.elapsed()) {
                thread::sleep(wait);
            }
        }
        self.last = Some(Instant::now());

        self.sequence += 1;
        Ok(Frame {
            data: Bytes::from(self.render()),
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                width: self.width,
                height: self.height,
                stride: self.width * 3,
                format: PixelFormat::Rgb24,
                rotation: self.rotation,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        })
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_sequenced_and_sized() {
        let mut cap = TestPatternCapture::new(8, 4, 0, Rotation::Deg90);
        cap.start().unwrap();
        let a = cap.next_frame().unwrap();
        let b = cap.next_frame().unwrap();
        assert_eq!(a.sequence() + 1, b.sequence());
        assert!(b.timestamp >= a.timestamp);
        assert_eq!(a.data.len(), 8 * 4 * 3);
        assert_eq!(a.meta.rotation, Rotation::Deg90);
    }

    #[test]
    fn frame_limit_ends_stream() {
        let mut cap = TestPatternCapture::new(2, 2, 0, Rotation::Deg0).with_frame_limit(1);
        cap.start().unwrap();
        assert!(cap.next_frame().is_ok());
        assert!(matches!(cap.next_frame(), Err(CaptureError::Acquire(_))));
    }

    #[test]
    fn long_runs_do_not_overflow_the_pattern() {
        let mut cap = TestPatternCapture::new(640, 2, 0, Rotation::Deg0);
        cap.start().unwrap();
        cap.sequence = u64::from(u32::MAX) * 2;
        let frame = cap.next_frame().unwrap();
        assert_eq!(frame.data.len(), 640 * 2 * 3);

        // The pattern repeats every 64 frames
        let mut early = TestPatternCapture::new(640, 2, 0, Rotation::Deg0);
        early.start().unwrap();
        early.sequence = cap.sequence - 256;
        assert_eq!(early.next_frame().unwrap().data, frame.data);
    }

    #[test]
    fn requires_start() {
        let mut cap = TestPatternCapture::new(2, 2, 0, Rotation::Deg0);
        assert!(matches!(cap.next_frame(), Err(CaptureError::NotStarted)));
    }
}
