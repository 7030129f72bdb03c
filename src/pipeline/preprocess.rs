//! Fused rotate + mirror + center-crop + scale into the detector's input square

use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

use crate::capture::{Frame, PixelFormat, Rotation};

/// Detector-ready upright square RGB24 image
#[derive(Clone)]
pub struct PreprocessedImage {
    pub pixels: Bytes,
    /// Side length in pixels
    pub size: u32,
    /// Capture timestamp of the source frame
    pub timestamp: Instant,
    pub sequence: u64,
}

impl std::fmt::Debug for PreprocessedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreprocessedImage")
            .field("size", &self.size)
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("frame has zero size ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("pixel format {0:?} cannot be preprocessed")]
    UnsupportedFormat(PixelFormat),
    #[error("stride {stride} is shorter than a {width} pixel row")]
    BadStride { stride: u32, width: u32 },
    #[error("buffer holds {actual} bytes, frame needs {expected}")]
    Truncated { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    bytes_per_pixel: usize,
    rotation: Rotation,
}

/// Source byte offsets for each output pixel: `rows[j] + cols[i]`.
///
/// Every rotation maps output columns and output rows to independent source
/// axes, so two tables describe the whole transform.
struct SamplingPlan {
    geometry: Geometry,
    cols: Vec<usize>,
    rows: Vec<usize>,
}

impl SamplingPlan {
    fn build(geometry: Geometry, size: u32, mirror: bool) -> Self {
        let bpp = geometry.bytes_per_pixel;
        let (w, h) = (geometry.width as usize, geometry.height as usize);
        let stride = geometry.stride as usize;

        let (upright_w, upright_h) = if geometry.rotation.is_transposed() {
            (h, w)
        } else {
            (w, h)
        };
        let side = upright_w.min(upright_h);
        let crop_x = (upright_w - side) / 2;
        let crop_y = (upright_h - side) / 2;
        let n = size as usize;

        // Nearest neighbour: sample at the centre of each output cell
        let sample = |k: usize| ((2 * k + 1) * side) / (2 * n);
        let upright_x = |i: usize| {
            let ux = crop_x + sample(i);
            if mirror {
                upright_w - 1 - ux
            } else {
                ux
            }
        };
        let upright_y = |j: usize| crop_y + sample(j);

        let (cols, rows): (Vec<usize>, Vec<usize>) = match geometry.rotation {
            Rotation::Deg0 => (
                (0..n).map(|i| upright_x(i) * bpp).collect(),
                (0..n).map(|j| upright_y(j) * stride).collect(),
            ),
            Rotation::Deg90 => (
                (0..n).map(|i| (h - 1 - upright_x(i)) * stride).collect(),
                (0..n).map(|j| upright_y(j) * bpp).collect(),
            ),
            Rotation::Deg180 => (
                (0..n).map(|i| (w - 1 - upright_x(i)) * bpp).collect(),
                (0..n).map(|j| (h - 1 - upright_y(j)) * stride).collect(),
            ),
            Rotation::Deg270 => (
                (0..n).map(|i| upright_x(i) * stride).collect(),
                (0..n).map(|j| (w - 1 - upright_y(j)) * bpp).collect(),
            ),
        };

        Self {
            geometry,
            cols,
            rows,
        }
    }
}

/// Turns raw camera frames into detector input.
///
/// Runs on the single frame worker. The sampling plan is cached per frame
/// geometry, so in steady state each call allocates only its output buffer.
pub struct FramePreprocessor {
    size: u32,
    mirror: bool,
    plan: Option<SamplingPlan>,
}

impl FramePreprocessor {
    /// `size` is the detector's square input side; `mirror` flips horizontally
    /// after rotation (front camera).
    pub fn new(size: u32, mirror: bool) -> Self {
        Self {
            size: size.max(1),
            mirror,
            plan: None,
        }
    }

    pub fn output_size(&self) -> u32 {
        self.size
    }

    /// Consume a frame and produce the detector image. The frame buffer is
    /// released when this returns.
    pub fn process(&mut self, frame: Frame) -> Result<PreprocessedImage, PreprocessError> {
        let start = Instant::now();
        let geometry = validate(&frame)?;

        if self.plan.as_ref().map(|plan| plan.geometry) != Some(geometry) {
            trace!(?geometry, "rebuilding sampling plan");
            self.plan = None;
        }
        let (size, mirror) = (self.size, self.mirror);
        let plan = self
            .plan
            .get_or_insert_with(|| SamplingPlan::build(geometry, size, mirror));

        let channels: [usize; 3] = match geometry.format {
            PixelFormat::Bgr24 => [2, 1, 0],
            _ => [0, 1, 2],
        };

        let src = &frame.data[..];
        let n = self.size as usize;
        let mut out = Vec::with_capacity(n * n * 3);
        for &row in &plan.rows {
            for &col in &plan.cols {
                let px = row + col;
                out.extend(channels.iter().map(|&c| src[px + c]));
            }
        }

        metrics::histogram!("preprocess_time_us").record(start.elapsed().as_micros() as f64);

        Ok(PreprocessedImage {
            pixels: Bytes::from(out),
            size: self.size,
            timestamp: frame.timestamp,
            sequence: frame.meta.sequence,
        })
    }
}

fn validate(frame: &Frame) -> Result<Geometry, PreprocessError> {
    let meta = &frame.meta;
    if meta.width == 0 || meta.height == 0 {
        return Err(PreprocessError::Empty {
            width: meta.width,
            height: meta.height,
        });
    }
    let bpp = meta
        .format
        .bytes_per_pixel()
        .ok_or(PreprocessError::UnsupportedFormat(meta.format))?;
    if (meta.stride as usize) < meta.width as usize * bpp {
        return Err(PreprocessError::BadStride {
            stride: meta.stride,
            width: meta.width,
        });
    }
    let expected = meta.stride as usize * meta.height as usize;
    if frame.data.len() < expected {
        return Err(PreprocessError::Truncated {
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(Geometry {
        width: meta.width,
        height: meta.height,
        stride: meta.stride,
        format: meta.format,
        bytes_per_pixel: bpp,
        rotation: meta.rotation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameMetadata;
    use std::sync::Arc;

    /// RGB frame whose red channel holds `y * width + x` and green holds 7.
    fn indexed_frame(width: u32, height: u32, rotation: Rotation) -> Frame {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(y * width + x) as u8, 7, 0]);
            }
        }
        frame_from(data, width, height, width * 3, PixelFormat::Rgb24, rotation)
    }

    fn frame_from(
        data: Vec<u8>,
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        rotation: Rotation,
    ) -> Frame {
        Frame {
            data: Bytes::from(data),
            meta: Arc::new(FrameMetadata {
                sequence: 9,
                width,
                height,
                stride,
                format,
                rotation,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    /// Red channel of each output pixel, row-major.
    fn reds(image: &PreprocessedImage) -> Vec<u8> {
        image.pixels.chunks(3).map(|px| px[0]).collect()
    }

    #[test]
    fn crops_the_centre_square() {
        // 4x2 landscape: the square is columns 1..=2
        let mut pre = FramePreprocessor::new(2, false);
        let out = pre.process(indexed_frame(4, 2, Rotation::Deg0)).unwrap();
        assert_eq!(out.size, 2);
        assert_eq!(reds(&out), vec![1, 2, 5, 6]);
    }

    #[test]
    fn mirrors_after_cropping() {
        let mut pre = FramePreprocessor::new(2, true);
        let out = pre.process(indexed_frame(4, 2, Rotation::Deg0)).unwrap();
        assert_eq!(reds(&out), vec![2, 1, 6, 5]);
    }

    #[test]
    fn rotations_move_the_top_left_corner() {
        // Raw 2x2 pixels: 0 1 / 2 3
        let cases = [
            (Rotation::Deg0, vec![0, 1, 2, 3]),
            (Rotation::Deg90, vec![2, 0, 3, 1]),
            (Rotation::Deg180, vec![3, 2, 1, 0]),
            (Rotation::Deg270, vec![1, 3, 0, 2]),
        ];
        for (rotation, expected) in cases {
            let mut pre = FramePreprocessor::new(2, false);
            let out = pre.process(indexed_frame(2, 2, rotation)).unwrap();
            assert_eq!(reds(&out), expected, "{rotation:?}");
        }
    }

    #[test]
    fn rotation_then_mirror() {
        let mut pre = FramePreprocessor::new(2, true);
        let out = pre.process(indexed_frame(2, 2, Rotation::Deg90)).unwrap();
        assert_eq!(reds(&out), vec![0, 2, 1, 3]);
    }

    #[test]
    fn portrait_after_rotation_is_cropped_vertically() {
        // Raw 4x2 rotated by 90 is upright 2x4; the square is upright rows 1..=2
        let mut pre = FramePreprocessor::new(2, false);
        let out = pre.process(indexed_frame(4, 2, Rotation::Deg90)).unwrap();
        // upright (x, y) comes from raw (y, 1 - x)
        assert_eq!(reds(&out), vec![5, 1, 6, 2]);
    }

    #[test]
    fn scales_by_sampling_cell_centres() {
        let mut pre = FramePreprocessor::new(2, false);
        let out = pre.process(indexed_frame(8, 8, Rotation::Deg0)).unwrap();
        // Samples columns/rows 2 and 6
        assert_eq!(reds(&out), vec![18, 22, 50, 54]);
    }

    #[test]
    fn upscales_to_the_requested_size() {
        let mut pre = FramePreprocessor::new(4, false);
        let out = pre.process(indexed_frame(2, 2, Rotation::Deg0)).unwrap();
        assert_eq!(out.pixels.len(), 4 * 4 * 3);
        assert_eq!(&reds(&out)[..4], &[0, 0, 1, 1]);
    }

    #[test]
    fn converts_bgr_and_rgba_to_rgb() {
        let mut pre = FramePreprocessor::new(1, false);
        let bgr = frame_from(vec![3, 2, 1], 1, 1, 3, PixelFormat::Bgr24, Rotation::Deg0);
        assert_eq!(&pre.process(bgr).unwrap().pixels[..], &[1, 2, 3]);

        let rgba = frame_from(vec![1, 2, 3, 255], 1, 1, 4, PixelFormat::Rgba32, Rotation::Deg0);
        assert_eq!(&pre.process(rgba).unwrap().pixels[..], &[1, 2, 3]);
    }

    #[test]
    fn honours_padded_stride() {
        // 2x2 RGB with two bytes of row padding
        let data = vec![10, 0, 0, 11, 0, 0, 99, 99, 12, 0, 0, 13, 0, 0, 99, 99];
        let frame = frame_from(data, 2, 2, 8, PixelFormat::Rgb24, Rotation::Deg0);
        let mut pre = FramePreprocessor::new(2, false);
        assert_eq!(reds(&pre.process(frame).unwrap()), vec![10, 11, 12, 13]);
    }

    #[test]
    fn keeps_timestamp_and_sequence() {
        let frame = indexed_frame(2, 2, Rotation::Deg0);
        let ts = frame.timestamp;
        let out = FramePreprocessor::new(2, false).process(frame).unwrap();
        assert_eq!(out.timestamp, ts);
        assert_eq!(out.sequence, 9);
    }

    #[test]
    fn plan_is_reused_for_same_geometry() {
        let mut pre = FramePreprocessor::new(2, false);
        pre.process(indexed_frame(4, 2, Rotation::Deg0)).unwrap();
        let first = pre.plan.as_ref().unwrap().cols.as_ptr();
        pre.process(indexed_frame(4, 2, Rotation::Deg0)).unwrap();
        assert_eq!(pre.plan.as_ref().unwrap().cols.as_ptr(), first);

        pre.process(indexed_frame(4, 2, Rotation::Deg180)).unwrap();
        assert_eq!(pre.plan.as_ref().unwrap().geometry.rotation, Rotation::Deg180);
    }

    #[test]
    fn rejects_corrupt_frames() {
        let mut pre = FramePreprocessor::new(2, false);

        let empty = frame_from(vec![], 0, 2, 0, PixelFormat::Rgb24, Rotation::Deg0);
        assert!(matches!(pre.process(empty), Err(PreprocessError::Empty { .. })));

        let short = frame_from(vec![0; 5], 2, 2, 6, PixelFormat::Rgb24, Rotation::Deg0);
        assert_eq!(
            pre.process(short).unwrap_err(),
            PreprocessError::Truncated {
                expected: 12,
                actual: 5
            }
        );

        let narrow = frame_from(vec![0; 12], 2, 2, 2, PixelFormat::Rgb24, Rotation::Deg0);
        assert!(matches!(pre.process(narrow), Err(PreprocessError::BadStride { .. })));

        let nv12 = frame_from(vec![0; 6], 2, 2, 2, PixelFormat::Nv12, Rotation::Deg0);
        assert_eq!(
            pre.process(nv12).unwrap_err(),
            PreprocessError::UnsupportedFormat(PixelFormat::Nv12)
        );
    }
}
