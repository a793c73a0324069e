//! Box and label drawing directly on BGR frames.
//!
//! Pixels are stored B, G, R; the `Rgb` wrapper from `image` is only used as a
//! three-channel container, so colour constants below are written in BGR order.

use image::{ImageBuffer, Rgb};
use video_ingest::Frame;

use crate::transform::{Detection, TransformError};

const BOX_BGR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_TEXT_BGR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_BG_BGR: Rgb<u8> = Rgb([0, 0, 0]);
const GLYPH_ADVANCE: i32 = 6;
const LABEL_HEIGHT: i32 = 8;

type BgrView<'a> = ImageBuffer<Rgb<u8>, &'a mut [u8]>;

/// Draw a rectangle and a `CLASS NN%` label for every detection.
pub fn annotate(frame: &mut Frame, detections: &[Detection]) -> Result<(), TransformError> {
    let expected = frame.byte_len();
    let actual = frame.data.len();
    let mut image: BgrView<'_> =
        ImageBuffer::from_raw(frame.width, frame.height, frame.data.as_mut_slice())
            .ok_or(TransformError::InvalidFrame { expected, actual })?;
    if image.width() == 0 || image.height() == 0 {
        return Ok(());
    }

    let max_x = (image.width() - 1) as f32;
    let max_y = (image.height() - 1) as f32;
    for det in detections {
        let left = det.bbox[0].clamp(0.0, max_x).round() as i32;
        let top = det.bbox[1].clamp(0.0, max_y).round() as i32;
        let right = det.bbox[2].clamp(0.0, max_x).round() as i32;
        let bottom = det.bbox[3].clamp(0.0, max_y).round() as i32;
        draw_rectangle(&mut image, left, top, right, bottom, BOX_BGR);

        let text = label_text(det);
        let label_y = (top - LABEL_HEIGHT - 4).max(0);
        let text_width = text.chars().count() as i32 * GLYPH_ADVANCE;
        fill_rect(
            &mut image,
            left,
            label_y,
            left + text_width,
            label_y + LABEL_HEIGHT,
            LABEL_BG_BGR,
        );
        draw_label(&mut image, left + 1, label_y + 1, &text, LABEL_TEXT_BGR);
    }
    Ok(())
}

pub fn class_label(class_id: i64) -> &'static str {
    match class_id {
        0 => "FACE",
        1 => "PERSON",
        _ => "OBJECT",
    }
}

fn label_text(det: &Detection) -> String {
    format!("{} {:.0}%", class_label(det.class_id), det.score * 100.0)
}

fn draw_rectangle(
    image: &mut BgrView<'_>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(
    image: &mut BgrView<'_>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut BgrView<'_>, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    let px = x + col;
                    if (pattern >> (4 - col)) & 1 == 1 && px >= 0 && px < width {
                        image.put_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

/// 5x7 bitmaps for the characters labels can contain.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
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
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_box_outline_only() {
        let mut frame = Frame::solid(40, 40, [0, 0, 0]);
        let det = Detection {
            bbox: [10.0, 20.0, 30.0, 35.0],
            score: 0.9,
            class_id: 0,
        };
        annotate(&mut frame, &[det]).unwrap();

        assert_eq!(frame.pixel(10, 25), Some([0, 255, 0]));
        assert_eq!(frame.pixel(30, 25), Some([0, 255, 0]));
        assert_eq!(frame.pixel(20, 35), Some([0, 255, 0]));
        // Interior untouched.
        assert_eq!(frame.pixel(20, 28), Some([0, 0, 0]));
    }

    #[test]
    fn out_of_bounds_boxes_are_clamped() {
        let mut frame = Frame::solid(16, 16, [1, 2, 3]);
        let det = Detection {
            bbox: [-50.0, -50.0, 500.0, 500.0],
            score: 0.5,
            class_id: 7,
        };
        annotate(&mut frame, &[det]).unwrap();
        assert_eq!(frame.pixel(15, 15), Some([0, 255, 0]));
        assert_eq!(frame.byte_len(), frame.data.len());
    }

    #[test]
    fn rejects_mismatched_buffers() {
        let mut frame = Frame::solid(4, 4, [0, 0, 0]);
        frame.data.truncate(10);
        assert!(matches!(
            annotate(&mut frame, &[]),
            Err(TransformError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn every_label_character_has_a_glyph() {
        for class_id in 0..3 {
            let text = label_text(&Detection {
                bbox: [0.0; 4],
                score: 0.875,
                class_id,
            });
            assert!(text.chars().all(|c| glyph_bits(c).is_some()), "{text}");
        }
    }
}
