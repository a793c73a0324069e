//! Frame transforms applied by the relay's transform stage.
//!
//! [`FrameTransform`] is the seam: the pipeline hands it a downscaled frame
//! and a confidence threshold and gets back an [`AnnotatedFrame`].
//! [`IdentityTransform`] passes frames through; the TorchScript
//! [`detector::Detector`] (feature `with-tch`) finds faces and draws them with
//! [`annotation`].

pub mod annotation;
mod transform;

#[cfg(feature = "with-tch")]
pub mod detector;

pub use transform::{
    AnnotatedFrame, Detection, FrameTransform, IdentityTransform, TransformError,
    non_max_suppression,
};
