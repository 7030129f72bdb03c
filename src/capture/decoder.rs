//! Conversion of device pixel formats into packed RGB24

use super::frame::PixelFormat;
use super::CaptureError;

/// Decoded RGB24 image. Rows are `stride` bytes apart.
#[derive(Debug)]
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

/// Decode a device buffer into RGB24.
///
/// `width`/`height` are the negotiated stream dimensions and `stride` the
/// driver's bytes per line (0 when rows are packed). MJPEG frames carry their
/// own size which takes precedence.
pub fn decode_frame(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: u32,
) -> Result<DecodedImage, CaptureError> {
    match format {
        PixelFormat::Mjpeg => decode_mjpeg(data),
        // Already RGB; padded rows are left for the preprocessor to skip
        PixelFormat::Rgb24 => Ok(DecodedImage {
            pixels: data.to_vec(),
            width,
            height,
            stride: if stride == 0 { width * 3 } else { stride },
        }),
        PixelFormat::Yuyv4 => Ok(DecodedImage {
            pixels: yuyv_to_rgb(data, width, height, stride)?,
            width,
            height,
            stride: width * 3,
        }),
        other => Err(CaptureError::UnsupportedFormat(other)),
    }
}

#[cfg(feature = "fast-jpeg")]
fn decode_mjpeg(data: &[u8]) -> Result<DecodedImage, CaptureError> {
    let mut decoder = zune_jpeg::JpegDecoder::new(data);
    let pixels = decoder.decode().map_err(|e| CaptureError::Decode {
        format: PixelFormat::Mjpeg,
        reason: e.to_string(),
    })?;
    let (width, height) = decoder.dimensions().ok_or_else(|| CaptureError::Decode {
        format: PixelFormat::Mjpeg,
        reason: "missing image dimensions".into(),
    })?;
    Ok(DecodedImage {
        pixels,
        width: width as u32,
        height: height as u32,
        stride: width as u32 * 3,
    })
}

#[cfg(not(feature = "fast-jpeg"))]
fn decode_mjpeg(data: &[u8]) -> Result<DecodedImage, CaptureError> {
    let mut decoder = jpeg_decoder::Decoder::new(data);
    let pixels = decoder.decode().map_err(|e| CaptureError::Decode {
        format: PixelFormat::Mjpeg,
        reason: e.to_string(),
    })?;
    let info = decoder.info().ok_or_else(|| CaptureError::Decode {
        format: PixelFormat::Mjpeg,
        reason: "missing image info".into(),
    })?;
    if info.pixel_format != jpeg_decoder::PixelFormat::RGB24 {
        return Err(CaptureError::Decode {
            format: PixelFormat::Mjpeg,
            reason: format!("unexpected jpeg pixel format {:?}", info.pixel_format),
        });
    }
    Ok(DecodedImage {
        pixels,
        width: u32::from(info.width),
        height: u32::from(info.height),
        stride: u32::from(info.width) * 3,
    })
}

/// YUYV 4:2:2 to packed RGB24, BT.601 limited range. Source rows are
/// `stride` bytes apart (0 when packed).
pub fn yuyv_to_rgb(
    data: &[u8],
    width: u32,
    height: u32,
    stride: u32,
) -> Result<Vec<u8>, CaptureError> {
    let row = width as usize * 2;
    let stride = if stride == 0 { row } else { stride as usize };
    let rows = height as usize;
    let needed = match rows {
        0 => 0,
        n => (n - 1) * stride + row,
    };
    if width % 2 != 0 || stride < row || data.len() < needed {
        return Err(CaptureError::Decode {
            format: PixelFormat::Yuyv4,
            reason: format!(
                "buffer of {} bytes does not hold a {}x{} frame with stride {}",
                data.len(),
                width,
                height,
                stride
            ),
        });
    }

    let mut rgb = Vec::with_capacity(width as usize * rows * 3);
    for line in (0..rows).map(|r| &data[r * stride..r * stride + row]) {
        for chunk in line.chunks_exact(4) {
            let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
            rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
            rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
        }
    }
    Ok(rgb)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (i32::from(y) - 16) * 298;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 409 * e),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 516 * d),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_black_and_white() {
        // Two pixels: black (Y=16) and white (Y=235), neutral chroma
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1, 0).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn yuyv_rejects_short_buffer() {
        assert!(yuyv_to_rgb(&[0; 6], 2, 2, 0).is_err());
        // Padded rows need room for the full stride between lines
        assert!(yuyv_to_rgb(&[16; 10], 2, 2, 8).is_err());
    }

    #[test]
    fn yuyv_skips_row_padding() {
        // Row 0 black, row 1 white, four bytes of padding after each row
        let data = [
            16, 128, 16, 128, 0xAA, 0xAA, 0xAA, 0xAA, //
            235, 128, 235, 128, 0xAA, 0xAA, 0xAA, 0xAA,
        ];
        let rgb = yuyv_to_rgb(&data, 2, 2, 8).unwrap();
        assert_eq!(&rgb[..6], &[0; 6]);
        assert_eq!(&rgb[6..], &[255; 6]);
    }

    #[test]
    fn rgb_passthrough_keeps_driver_stride() {
        let image = decode_frame(&[7; 2 * 8], PixelFormat::Rgb24, 2, 2, 8).unwrap();
        assert_eq!(image.stride, 8);
        let packed = decode_frame(&[7; 12], PixelFormat::Rgb24, 2, 2, 0).unwrap();
        assert_eq!(packed.stride, 6);
    }

    #[test]
    fn nv12_is_unsupported() {
        let err = decode_frame(&[0; 12], PixelFormat::Nv12, 2, 2, 0).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::UnsupportedFormat(PixelFormat::Nv12)
        ));
    }
}
