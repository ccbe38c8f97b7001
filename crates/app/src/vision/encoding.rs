//! JPEG encoding and multipart framing for the MJPEG stream.

use std::time::Instant;

use actix_web::web::Bytes;
use anyhow::{Result, anyhow};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use video_ingest::Frame;

use crate::vision::{annotation, data::DetectionSet};

pub(crate) const MJPEG_BOUNDARY: &str = "frame";

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity((image.width() * image.height() / 8) as usize);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// Annotate `frame` with `detections` and encode it. Runs on the blocking pool.
pub(crate) fn render_frame(
    frame: &Frame,
    detections: &DetectionSet,
    fps: f32,
    quality: u8,
) -> Result<Vec<u8>> {
    let _span = tracing::info_span!("encoding.frame", frame = frame.sequence, quality).entered();
    let started = Instant::now();
    let image = annotation::annotate(frame, detections, fps)?;
    let jpeg = encode_jpeg(&image, quality)?;
    metrics::histogram!("mjpeg_encode_seconds").record(started.elapsed().as_secs_f64());
    Ok(jpeg)
}

pub(crate) fn render_placeholder(width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    encode_jpeg(&annotation::placeholder(width, height), quality)
}

/// One part of a `multipart/x-mixed-replace` body.
pub(crate) fn multipart_chunk(jpeg: &[u8], sequence: u64) -> Bytes {
    let header = format!(
        "--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Sequence: {sequence}\r\n\r\n",
        jpeg.len()
    );
    let mut payload = Vec::with_capacity(header.len() + jpeg.len() + 2);
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_decodable_jpeg() {
        let jpeg = render_placeholder(64, 48, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn lower_quality_produces_smaller_output() {
        let frame = Frame::new(
            (0..64 * 64 * 3).map(|i| (i * 7 % 251) as u8).collect(),
            64,
            64,
            0,
        );
        let high = render_frame(&frame, &DetectionSet::default(), 30.0, 95).unwrap();
        let low = render_frame(&frame, &DetectionSet::default(), 30.0, 10).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn chunk_carries_headers_and_payload() {
        let chunk = multipart_chunk(b"JPEGDATA", 42);
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert_eq!(
            text,
            "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 8\r\nX-Sequence: 42\r\n\r\nJPEGDATA\r\n"
        );
    }
}
