//! V4L2 capture with memory-mapped buffers

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::decoder;
use super::frame::{Frame, FrameMetadata, PixelFormat};
use super::{CaptureDevice, CaptureError};
use crate::CaptureConfig;

/// Detected capture device info
#[derive(Debug, Clone)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Find the first `/dev/videoN` that can capture and offers MJPEG or YUYV.
pub fn auto_detect_device() -> Option<FoundDevice> {
    info!("Auto-detecting capture devices...");

    (0..10)
        .map(|i| format!("/dev/video{}", i))
        .filter(|path| Path::new(path).exists())
        .find_map(|path| {
            let dev = Device::with_path(&path).ok()?;
            let caps = dev.query_caps().ok()?;
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                return None;
            }
            // Prefer MJPEG when a device lists both
            let formats = dev.enum_formats().ok()?;
            let format = if formats.iter().any(|f| f.fourcc == FourCC::new(b"MJPG")) {
                PixelFormat::Mjpeg
            } else if formats.iter().any(|f| f.fourcc == FourCC::new(b"YUYV")) {
                PixelFormat::Yuyv4
            } else {
                return None;
            };
            info!("Found {:?} device: {} - {}", format, path, caps.card);
            Some(FoundDevice { path, format })
        })
}

struct Bound {
    // Stream first: it must be dropped before the device it maps
    stream: MmapStream<'static>,
    _device: Device,
    format: PixelFormat,
    width: u32,
    height: u32,
    /// Bytes per line as negotiated with the driver
    stride: u32,
}

/// V4L2 camera producing upright-tagged RGB24 frames
pub struct V4l2Capture {
    config: CaptureConfig,
    bound: Option<Bound>,
    sequence: u64,
}

impl V4l2Capture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            bound: None,
            sequence: 0,
        }
    }

    fn bind_error(&self, device: &str, reason: impl ToString) -> CaptureError {
        CaptureError::Bind {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    fn open(&self) -> Result<Bound, CaptureError> {
        let found = if self.config.device.is_empty() {
            auto_detect_device()
                .ok_or_else(|| self.bind_error("auto", "no suitable capture device found"))?
        } else {
            FoundDevice {
                path: self.config.device.clone(),
                format: self.config.format,
            }
        };
        let path = found.path.as_str();

        let device = Device::with_path(path).map_err(|e| self.bind_error(path, e))?;
        let caps = device.query_caps().map_err(|e| self.bind_error(path, e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(self.bind_error(path, "device doesn't support video capture"));
        }

        let mut fmt = device.format().map_err(|e| self.bind_error(path, e))?;
        fmt.width = self.config.width;
        fmt.height = self.config.height;
        fmt.fourcc = match found.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
            other => return Err(CaptureError::UnsupportedFormat(other)),
        };
        // Drivers pick the closest supported size, which may not be the one asked for
        let fmt = device
            .set_format(&fmt)
            .map_err(|e| self.bind_error(path, e))?;
        if fmt.width != self.config.width || fmt.height != self.config.height {
            warn!(
                "Requested {}x{}, device negotiated {}x{}",
                self.config.width, self.config.height, fmt.width, fmt.height
            );
        }

        let mut stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, self.config.buffer_count)
                .map_err(|e| self.bind_error(path, e))?;
        // Bounded dequeue so the capture thread can notice a stop request
        stream.set_timeout(self.config.frame_timeout());

        Ok(Bound {
            stream,
            _device: device,
            format: found.format,
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
        })
    }
}

impl CaptureDevice for V4l2Capture {
    fn name(&self) -> String {
        if self.config.device.is_empty() {
            "v4l2:auto".into()
        } else {
            format!("v4l2:{}", self.config.device)
        }
    }

    #[instrument(skip(self), fields(device = %self.config.device))]
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.bound.is_some() {
            return Ok(());
        }
        let bound = self.open()?;
        info!(
            "Capture stream started with {} buffers ({}x{} {:?})",
            self.config.buffer_count, bound.width, bound.height, bound.format
        );
        self.bound = Some(bound);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let frame_timeout = self.config.frame_timeout();
        let bound = self.bound.as_mut().ok_or(CaptureError::NotStarted)?;

        let (buf, meta) = match bound.stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(CaptureError::Timeout(frame_timeout))
            }
            Err(e) => return Err(e.into()),
        };
        let timestamp = Instant::now();
        let device_timestamp = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);

        let image = decoder::decode_frame(
            &buf[..meta.bytesused as usize],
            bound.format,
            bound.width,
            bound.height,
            bound.stride,
        )?;

        self.sequence += 1;
        debug!(sequence = self.sequence, "captured frame");

        Ok(Frame {
            data: Bytes::from(image.pixels),
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                width: image.width,
                height: image.height,
                stride: image.stride,
                format: PixelFormat::Rgb24,
                rotation: self.config.rotation,
                device_timestamp: Some(device_timestamp),
            }),
            timestamp,
        })
    }

    fn stop(&mut self) {
        if self.bound.take().is_some() {
            info!("Capture stream stopped");
        }
    }
}
