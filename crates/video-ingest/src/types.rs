use std::{io, process::ExitStatus};

use anyhow::Error;
use chrono::Utc;
use thiserror::Error;

/// Raw BGR frame captured from a video source.
///
/// Frames are immutable once published into the pipeline; stages share them
/// behind an `Arc` and build new buffers instead of editing in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    /// Position in ingest order. Diagnostics only.
    pub sequence: u64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }

    /// Name understood by ffmpeg's `-pix_fmt`.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            FrameFormat::Bgr8 => "bgr24",
        }
    }
}

impl Frame {
    /// Wrap a BGR24 buffer, checking that it matches the declared dimensions.
    pub fn from_bgr(width: u32, height: u32, data: Vec<u8>) -> Result<Self, CaptureError> {
        let expected = Self::byte_len_for(width, height, FrameFormat::Bgr8);
        if data.len() != expected {
            return Err(CaptureError::FrameSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence: 0,
            format: FrameFormat::Bgr8,
        })
    }

    /// Frame filled with a single BGR colour.
    pub fn solid(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&bgr);
        }
        Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence: 0,
            format: FrameFormat::Bgr8,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Size in bytes of one packed frame.
    pub fn byte_len_for(width: u32, height: u32, format: FrameFormat) -> usize {
        (width as usize) * (height as usize) * format.bytes_per_pixel()
    }

    pub fn byte_len(&self) -> usize {
        Self::byte_len_for(self.width, self.height, self.format)
    }

    /// Pixel at `(x, y)` in storage order (B, G, R).
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 3;
        let px = self.data.get(offset..offset + 3)?;
        Some([px[0], px[1], px[2]])
    }
}

/// Stream properties reported when a source is opened.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate. Drives the emit cadence, not ingest.
    pub fps: f64,
}

impl SourceInfo {
    pub fn frame_bytes(&self) -> usize {
        Frame::byte_len_for(self.width, self.height, FrameFormat::Bgr8)
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}: {reason}")]
    Open { uri: String, reason: String },
    #[error("failed to probe video source {uri:?}: {reason}")]
    Probe { uri: String, reason: String },
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error("decoder exited with {status}")]
    DecoderExit { status: ExitStatus },
    #[error("video source is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] Error),
}

/// Pull-based video source driven by the ingest stage.
///
/// Opening is the implementor's constructor; it must report [`SourceInfo`]
/// before the first read.
pub trait VideoSource: Send {
    fn info(&self) -> SourceInfo;

    /// Next decoded frame, `Ok(None)` at end of stream.
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Rewind to the first frame so reading can continue.
    fn seek_to_start(&mut self) -> Result<(), CaptureError>;

    /// Release decoder resources. Reads after `close` fail with [`CaptureError::Closed`].
    fn close(&mut self);
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
    fn info(&self) -> SourceInfo {
        (**self).info()
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).read_frame()
    }

    fn seek_to_start(&mut self) -> Result<(), CaptureError> {
        (**self).seek_to_start()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
