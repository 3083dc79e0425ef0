use super::RgbFrame;
use crate::error::ThumbnailError;
use bytes::Bytes;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};

/// Serializes an RGB frame as PNG.
pub fn encode_png(frame: &RgbFrame) -> Result<Bytes, ThumbnailError> {
    let RgbFrame {
        width,
        height,
        data,
    } = frame;

    if *width == 0 || *height == 0 {
        return Err(ThumbnailError::encode(format!(
            "frame has a zero dimension: {width}x{height}"
        )));
    }

    let expected = *width as usize * *height as usize * 3;
    if data.len() != expected {
        return Err(ThumbnailError::encode(format!(
            "frame buffer holds {} bytes, {width}x{height} RGB needs {expected}",
            data.len()
        )));
    }

    let mut buf = Vec::with_capacity(expected / 4);
    PngEncoder::new(&mut buf)
        .write_image(data, *width, *height, ColorType::Rgb8)
        .map_err(ThumbnailError::encode)?;

    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_png_keeps_dimensions_and_pixels() {
        let frame = RgbFrame::filled(16, 9, [200, 10, 10]);

        let png = encode_png(&frame).unwrap();

        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = image::load_from_memory(&png).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (16, 9));
        assert_eq!(decoded.get_pixel(15, 8).0, [200, 10, 10]);
    }

    #[test]
    fn test_zero_dimension_is_encode_error() {
        let error = encode_png(&RgbFrame::filled(0, 180, [0, 0, 0])).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Encode);
        assert!(error.to_string().contains("0x180"));
    }

    #[test]
    fn test_short_buffer_is_encode_error() {
        let frame = RgbFrame {
            width: 4,
            height: 4,
            data: vec![0; 10],
        };
        let error = encode_png(&frame).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Encode);
    }
}
