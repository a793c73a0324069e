//! Video sources feeding the relay pipeline.
//!
//! Every source yields packed BGR24 [`Frame`]s through the pull-based
//! [`VideoSource`] trait. [`FfmpegSource`] covers files, V4L devices and
//! network feeds; [`SyntheticSource`] produces solid colours for tests and
//! smoke runs. [`open_source`] picks one from a source identifier.

mod ffmpeg;
mod synthetic;
mod types;

pub use ffmpeg::{DEFAULT_FPS, FfmpegOptions, FfmpegSource, MIN_FPS, SourceKind};
pub use synthetic::SyntheticSource;
pub use types::{CaptureError, Frame, FrameFormat, SourceInfo, VideoSource};

/// Open the source named by `uri`.
pub fn open_source(
    uri: &str,
    options: FfmpegOptions,
) -> Result<Box<dyn VideoSource>, CaptureError> {
    match SourceKind::from_uri(uri) {
        SourceKind::Synthetic => {
            let mut source = SyntheticSource::from_uri(uri)?;
            if let Some(fps) = options.fps_override {
                source = source.with_fps(fps);
            }
            Ok(Box::new(source))
        }
        _ => Ok(Box::new(FfmpegSource::open(uri, options)?)),
    }
}
