//! CPU drawing primitives: detection boxes, labels, the FPS overlay and the
//! "camera unavailable" placeholder. Text uses a built-in 5x7 bitmap font.

use anyhow::{Result, anyhow};
use image::{Rgb, RgbImage};
use video_ingest::Frame;

use crate::vision::data::{DetectionSet, DetectionSummary};

const HIGH_CONFIDENCE: f32 = 0.7;
const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const PLACEHOLDER_BG: Rgb<u8> = Rgb([32, 32, 32]);
const PLACEHOLDER_TEXT: Rgb<u8> = Rgb([220, 60, 60]);

const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;

/// Convert a BGR frame into an RGB image and draw detections plus the FPS counter.
pub(crate) fn annotate(frame: &Frame, detections: &DetectionSet, fps: f32) -> Result<RgbImage> {
    let width = frame.width as u32;
    let height = frame.height as u32;
    let mut image = RgbImage::from_vec(width, height, bgr_to_rgb(&frame.data))
        .ok_or_else(|| anyhow!("frame buffer does not match {width}x{height}"))?;
    let scale = text_scale(height);

    for detection in &detections.detections {
        draw_detection(&mut image, detection, scale);
    }

    let info = format!("FPS: {fps:.1}");
    draw_text(&mut image, 10, 10, &info, WHITE, scale);
    Ok(image)
}

/// Dark frame with a centred "CAMERA UNAVAILABLE" banner.
pub(crate) fn placeholder(width: u32, height: u32) -> RgbImage {
    let mut image = RgbImage::from_pixel(width.max(1), height.max(1), PLACEHOLDER_BG);
    let scale = text_scale(image.height());
    let message = "CAMERA UNAVAILABLE";
    let text_w = text_width(message, scale);
    let x = (image.width() as i32 - text_w) / 2;
    let y = (image.height() as i32 - GLYPH_H * scale) / 2;
    draw_text(&mut image, x.max(0), y.max(0), message, PLACEHOLDER_TEXT, scale);
    image
}

pub(crate) fn confidence_color(confidence: f32) -> Rgb<u8> {
    if confidence > HIGH_CONFIDENCE {
        GREEN
    } else {
        YELLOW
    }
}

/// Label shown above a box, e.g. `speed limit 92%`.
pub(crate) fn label_text(detection: &DetectionSummary) -> String {
    format!(
        "{} {:.0}%",
        detection.label.replace('_', " "),
        detection.confidence * 100.0
    )
}

fn text_scale(height: u32) -> i32 {
    (height / 240).max(1) as i32
}

fn draw_detection(image: &mut RgbImage, detection: &DetectionSummary, scale: i32) {
    let color = confidence_color(detection.confidence);
    let [x1, y1, x2, y2] = detection.bbox.map(|v| v.round() as i32);
    draw_rectangle(image, x1, y1, x2, y2, color, 2);

    let text = label_text(detection);
    let pad = 2 * scale;
    let text_h = GLYPH_H * scale;
    let label_y1 = (y1 - text_h - 2 * pad).max(0);
    let label_x2 = x1 + text_width(&text, scale) + 2 * pad;
    fill_rect(image, x1, label_y1, label_x2, label_y1 + text_h + 2 * pad, color);
    draw_text(image, x1 + pad, label_y1 + pad, &text, BLACK, scale);
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}

fn put_pixel(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
    thickness: i32,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for t in 0..thickness {
        for x in left..=right {
            put_pixel(image, x, top + t, color);
            put_pixel(image, x, bottom - t, color);
        }
        for y in top..=bottom {
            put_pixel(image, left + t, y, color);
            put_pixel(image, right - t, y, color);
        }
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for y in top.max(0)..bottom.min(height) {
        for x in left.max(0)..right.min(width) {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn text_width(text: &str, scale: i32) -> i32 {
    let chars = text.chars().count() as i32;
    if chars == 0 {
        0
    } else {
        (chars * GLYPH_ADVANCE - (GLYPH_ADVANCE - GLYPH_W)) * scale
    }
}

fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>, scale: i32) {
    let mut cursor = x;
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_W {
                    if (pattern >> (GLYPH_W - 1 - col)) & 1 == 1 {
                        for dy in 0..scale {
                            for dx in 0..scale {
                                put_pixel(
                                    image,
                                    cursor + col * scale + dx,
                                    y + row as i32 * scale + dy,
                                    color,
                                );
                            }
                        }
                    }
                }
            }
        }
        cursor += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b11001, 0b11010, 0b00010, 0b00100, 0b01000, 0b01011, 0b10011],
        '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(width: i32, height: i32) -> Frame {
        Frame::new(vec![128; (width * height * 3) as usize], width, height, 0)
    }

    fn summary(confidence: f32, bbox: [f32; 4]) -> DetectionSummary {
        DetectionSummary {
            label: "speed_limit".to_string(),
            confidence,
            bbox,
        }
    }

    #[test]
    fn color_depends_on_confidence() {
        assert_eq!(confidence_color(0.92), GREEN);
        assert_eq!(confidence_color(0.7), YELLOW);
        assert_eq!(confidence_color(0.4), YELLOW);
    }

    #[test]
    fn label_uses_spaces_and_percent() {
        assert_eq!(label_text(&summary(0.92, [0.0; 4])), "speed limit 92%");
    }

    #[test]
    fn converts_bgr_to_rgb() {
        let frame = Frame::new(vec![10, 20, 30], 1, 1, 0);
        let image = annotate(&frame, &DetectionSet::default(), 0.0).unwrap();
        assert_eq!(image.get_pixel(0, 0), &Rgb([30, 20, 10]));
    }

    #[test]
    fn draws_box_outline_in_confidence_color() {
        let frame = gray_frame(160, 120);
        let set = DetectionSet {
            timestamp_ms: 0,
            sequence: 1,
            detections: vec![summary(0.95, [40.0, 60.0, 120.0, 110.0])],
        };
        let image = annotate(&frame, &set, 0.0).unwrap();
        assert_eq!(image.get_pixel(80, 110), &GREEN);
        assert_eq!(image.get_pixel(40, 90), &GREEN);
        assert_eq!(image.get_pixel(80, 90), &Rgb([128, 128, 128]));
    }

    #[test]
    fn boxes_outside_the_frame_are_clamped() {
        let frame = gray_frame(32, 32);
        let set = DetectionSet {
            timestamp_ms: 0,
            sequence: 1,
            detections: vec![summary(0.5, [-50.0, -50.0, 500.0, 500.0])],
        };
        let image = annotate(&frame, &set, 0.0).unwrap();
        assert_eq!(image.get_pixel(31, 31), &YELLOW);
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let frame = Frame::new(vec![0; 5], 4, 4, 0);
        assert!(annotate(&frame, &DetectionSet::default(), 0.0).is_err());
    }

    #[test]
    fn placeholder_has_requested_size_and_text() {
        let image = placeholder(320, 240);
        assert_eq!(image.dimensions(), (320, 240));
        assert!(image.pixels().any(|p| *p == PLACEHOLDER_TEXT));
    }

    #[test]
    fn every_overlay_character_has_a_glyph() {
        for ch in "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789%.:- ".chars() {
            assert!(glyph_bits(ch).is_some(), "missing glyph for {ch:?}");
        }
    }
}
