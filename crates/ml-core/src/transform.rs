use thiserror::Error;
use video_ingest::Frame;

/// Single detection in pixel coordinates of the frame it was found in.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Detection {
    /// `[left, top, right, bottom]`.
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

impl Detection {
    pub fn area(&self) -> f32 {
        (self.bbox[2] - self.bbox[0]).max(0.0) * (self.bbox[3] - self.bbox[1]).max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let left = self.bbox[0].max(other.bbox[0]);
        let top = self.bbox[1].max(other.bbox[1]);
        let right = self.bbox[2].min(other.bbox[2]);
        let bottom = self.bbox[3].min(other.bbox[3]);
        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }

    /// Map the box into a frame scaled by `(sx, sy)`.
    pub fn scaled(&self, sx: f32, sy: f32) -> Detection {
        Detection {
            bbox: [
                self.bbox[0] * sx,
                self.bbox[1] * sy,
                self.bbox[2] * sx,
                self.bbox[3] * sy,
            ],
            ..*self
        }
    }
}

/// Frame with detections drawn into its pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

impl AnnotatedFrame {
    /// Wrap a frame that needs no drawing.
    pub fn passthrough(frame: Frame) -> Self {
        Self {
            frame,
            detections: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-frame transform run by the relay's transform stage.
///
/// Calls are synchronous and may be slow; the pipeline never runs two at once
/// on the same instance.
pub trait FrameTransform: Send {
    fn name(&self) -> &str;

    /// Annotate `frame`, reporting only detections scoring at least `confidence`.
    fn infer(&mut self, frame: &Frame, confidence: f32) -> Result<AnnotatedFrame, TransformError>;
}

impl<T: FrameTransform + ?Sized> FrameTransform for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn infer(&mut self, frame: &Frame, confidence: f32) -> Result<AnnotatedFrame, TransformError> {
        (**self).infer(frame, confidence)
    }
}

/// Returns every frame unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

impl FrameTransform for IdentityTransform {
    fn name(&self) -> &str {
        "identity"
    }

    fn infer(&mut self, frame: &Frame, _confidence: f32) -> Result<AnnotatedFrame, TransformError> {
        Ok(AnnotatedFrame::passthrough(frame.clone()))
    }
}

/// Greedy non-maximum suppression, highest score first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.iou(&det) > iou_threshold);
        if !overlaps {
            kept.push(det);
        }
    }
    kept
}
