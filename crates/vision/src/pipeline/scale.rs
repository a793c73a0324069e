//! Working-resolution resizing around the transform.

use image::{ImageBuffer, Rgb, imageops};
use ml_core::TransformError;
use video_ingest::Frame;

/// Source dimensions divided by `scale`, never below one pixel.
pub fn working_size(width: u32, height: u32, scale: u32) -> (u32, u32) {
    let scale = scale.max(1);
    ((width / scale).max(1), (height / scale).max(1))
}

/// Resize `frame` to `width`×`height`, keeping its sequence and timestamp.
pub fn resize_frame(frame: &Frame, width: u32, height: u32) -> Result<Frame, TransformError> {
    if frame.width == width && frame.height == height {
        return Ok(frame.clone());
    }
    // Channel order does not matter to the filter, so BGR bytes go through `Rgb` untouched.
    let view: ImageBuffer<Rgb<u8>, &[u8]> =
        ImageBuffer::from_raw(frame.width, frame.height, frame.data.as_slice()).ok_or(
            TransformError::InvalidFrame {
                expected: frame.byte_len(),
                actual: frame.data.len(),
            },
        )?;
    let resized = imageops::resize(&view, width, height, imageops::FilterType::Triangle);
    Ok(Frame {
        data: resized.into_raw(),
        width,
        height,
        timestamp_ms: frame.timestamp_ms,
        sequence: frame.sequence,
        format: frame.format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_size_divides_and_clamps() {
        assert_eq!(working_size(640, 360, 2), (320, 180));
        assert_eq!(working_size(641, 361, 2), (320, 180));
        assert_eq!(working_size(640, 360, 1), (640, 360));
        assert_eq!(working_size(3, 3, 8), (1, 1));
        assert_eq!(working_size(64, 48, 0), (64, 48));
    }

    #[test]
    fn half_size_round_trip_keeps_solid_colour() {
        let frame = Frame::solid(64, 48, [10, 200, 30]).with_sequence(7);
        let small = resize_frame(&frame, 32, 24).unwrap();
        assert_eq!((small.width, small.height), (32, 24));
        assert_eq!(small.data.len(), small.byte_len());

        let restored = resize_frame(&small, 64, 48).unwrap();
        assert_eq!(restored.data.len(), 64 * 48 * 3);
        assert_eq!(restored.sequence, 7);
        assert_eq!(restored.timestamp_ms, frame.timestamp_ms);
        assert!(restored.data.chunks(3).all(|px| px == [10, 200, 30]));
    }

    #[test]
    fn same_size_is_a_copy() {
        let frame = Frame::solid(8, 8, [1, 2, 3]);
        assert_eq!(resize_frame(&frame, 8, 8).unwrap(), frame);
    }

    #[test]
    fn short_buffers_are_rejected() {
        let mut frame = Frame::solid(8, 8, [1, 2, 3]);
        frame.data.pop();
        assert!(matches!(
            resize_frame(&frame, 4, 4),
            Err(TransformError::InvalidFrame { expected: 192, actual: 191 })
        ));
    }
}
