//! TorchScript YOLO detector (YOLOv8/YOLOv11 export layout).
//!
//! The exported module takes `[1, 3, H, W]` RGB in `0..1` and returns
//! `[1, 4 + classes, predictions]` with centre-format boxes followed by one
//! score per class.

use std::{convert::TryFrom, path::Path, sync::Once};

use anyhow::Context;
use image::{ImageBuffer, Rgb, imageops};
use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
use tch::{self, Device, Kind, Tensor};
use tracing::{debug, info, warn};
use video_ingest::Frame;

use crate::{
    annotation,
    transform::{AnnotatedFrame, Detection, FrameTransform, TransformError, non_max_suppression},
};

const NMS_IOU_THRESHOLD: f32 = 0.45;
const MAX_DETECTIONS: usize = 300;

pub struct Detector {
    module: tch::CModule,
    device: Device,
    /// Model input `(width, height)`.
    input_size: (u32, u32),
}

impl Detector {
    /// Load a TorchScript export, preferring CUDA when it is usable.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        input_size: (u32, u32),
        use_cpu: bool,
    ) -> anyhow::Result<Self> {
        let device = if use_cpu {
            Device::Cpu
        } else {
            load_torch_cuda_runtime();
            Device::cuda_if_available()
        };
        info!("CUDA: {}", matches!(device, Device::Cuda(_)));

        let module = tch::CModule::load_on_device(model_path.as_ref(), device)
            .with_context(|| format!("failed to load {}", model_path.as_ref().display()))?;
        Ok(Self {
            module,
            device,
            input_size,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn to_input(&self, frame: &Frame) -> Result<Tensor, TransformError> {
        let (in_w, in_h) = self.input_size;
        let view: ImageBuffer<Rgb<u8>, &[u8]> =
            ImageBuffer::from_raw(frame.width, frame.height, frame.data.as_slice()).ok_or(
                TransformError::InvalidFrame {
                    expected: frame.byte_len(),
                    actual: frame.data.len(),
                },
            )?;
        let resized = imageops::resize(&view, in_w, in_h, imageops::FilterType::Triangle);

        let tensor = Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h as i64, in_w as i64, 3])
            .flip([3])
            .permute([0, 3, 1, 2])
            / 255.0;
        Ok(tensor)
    }

    fn decode(&self, output: &Tensor, confidence: f32) -> Result<Vec<Detection>, TransformError> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(TransformError::Inference(format!(
                "unexpected detector output shape: {shape:?}"
            )));
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows = Vec::<Vec<f32>>::try_from(&preds)
            .map_err(|err| TransformError::Inference(err.to_string()))?;

        let mut detections = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < confidence {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            detections.push(Detection {
                bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                score,
                class_id: class_id as i64,
            });
        }

        let mut kept = non_max_suppression(detections, NMS_IOU_THRESHOLD);
        kept.truncate(MAX_DETECTIONS);
        Ok(kept)
    }
}

impl FrameTransform for Detector {
    fn name(&self) -> &str {
        "torchscript-yolo"
    }

    fn infer(&mut self, frame: &Frame, confidence: f32) -> Result<AnnotatedFrame, TransformError> {
        let input = tch::no_grad(|| self.to_input(frame))?;
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|err| TransformError::Inference(err.to_string()))?;
        let detections = self.decode(&output, confidence)?;

        let (in_w, in_h) = self.input_size;
        let sx = frame.width as f32 / in_w as f32;
        let sy = frame.height as f32 / in_h as f32;
        let detections: Vec<Detection> = detections.iter().map(|d| d.scaled(sx, sy)).collect();
        debug!("frame #{}: {} detection(s)", frame.sequence, detections.len());

        let mut annotated = frame.clone();
        annotation::annotate(&mut annotated, &detections)?;
        Ok(AnnotatedFrame {
            frame: annotated,
            detections,
        })
    }
}

/// libtorch only registers its CUDA backend when these libraries are loaded globally.
fn load_torch_cuda_runtime() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let mut handles = Vec::new();
        for lib in [
            "libtorch_cuda.so",
            "libtorch_cuda_cu.so",
            "libtorch_cuda_cpp.so",
        ] {
            match unsafe { Library::open(Some(lib), RTLD_NOW | RTLD_GLOBAL) } {
                Ok(handle) => {
                    debug!("loaded {lib}");
                    handles.push(handle);
                }
                Err(err) => debug!("{lib} not loaded: {err}"),
            }
        }
        if handles.is_empty() {
            warn!("no libtorch CUDA libraries found; inference will run on CPU");
        }
        // Unloading would unregister the backend.
        std::mem::forget(handles);
    });
}
