//! Generated solid-colour test pattern.
//!
//! Used for smoke runs (`synthetic://640x360@30?frames=300`) and by the
//! pipeline tests as a deterministic stand-in for a decoder.

use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;

use crate::{
    ffmpeg::MIN_FPS,
    types::{CaptureError, Frame, SourceInfo, VideoSource},
};

/// Colours cycled through by default, in BGR order.
const DEFAULT_PALETTE: [[u8; 3]; 4] = [[255, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 255]];

pub struct SyntheticSource {
    info: SourceInfo,
    palette: Vec<[u8; 3]>,
    /// Frames per pass; `None` never ends.
    frames: Option<u64>,
    position: u64,
    /// Pace reads at the nominal rate instead of returning immediately.
    paced: bool,
    next_due: Option<Instant>,
    seeks: u64,
    closed: bool,
}

impl SyntheticSource {
    /// Rates below [`MIN_FPS`] are raised to it.
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            info: SourceInfo {
                width,
                height,
                fps: fps.max(MIN_FPS),
            },
            palette: DEFAULT_PALETTE.to_vec(),
            frames: None,
            position: 0,
            paced: true,
            next_due: None,
            seeks: 0,
            closed: false,
        }
    }

    /// Parse `synthetic://WxH@FPS[?frames=N]`.
    pub fn from_uri(uri: &str) -> Result<Self, CaptureError> {
        let invalid = |reason: &str| CaptureError::Open {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let rest = uri
            .strip_prefix("synthetic://")
            .ok_or_else(|| invalid("expected synthetic://WxH@FPS"))?;
        let (geometry, query) = match rest.split_once('?') {
            Some((geometry, query)) => (geometry, Some(query)),
            None => (rest, None),
        };
        let (size, fps) = geometry
            .split_once('@')
            .ok_or_else(|| invalid("missing @FPS"))?;
        let (width, height) = size
            .split_once('x')
            .ok_or_else(|| invalid("size must look like 640x360"))?;
        let width: u32 = width.parse().map_err(|_| invalid("bad width"))?;
        let height: u32 = height.parse().map_err(|_| invalid("bad height"))?;
        let fps: f64 = fps.parse().map_err(|_| invalid("bad frame rate"))?;
        if width == 0 || height == 0 || !fps.is_finite() || fps < MIN_FPS {
            return Err(invalid("size must be positive and frame rate at least 0.1"));
        }

        let mut source = Self::new(width, height, fps);
        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("frames", value)) => {
                    let frames = value.parse().map_err(|_| invalid("bad frames count"))?;
                    source = source.with_frame_count(frames);
                }
                _ => return Err(invalid("unknown query parameter")),
            }
        }
        Ok(source)
    }

    /// End the stream after `frames` reads per pass.
    pub fn with_frame_count(mut self, frames: u64) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Replace the nominal rate; rates below [`MIN_FPS`] are ignored.
    pub fn with_fps(mut self, fps: f64) -> Self {
        if fps.is_finite() && fps >= MIN_FPS {
            self.info.fps = fps;
        }
        self
    }

    pub fn with_palette(mut self, palette: Vec<[u8; 3]>) -> Self {
        if !palette.is_empty() {
            self.palette = palette;
        }
        self
    }

    /// Return frames as fast as they are asked for.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Colour of the `index`-th frame of a pass.
    pub fn colour_at(&self, index: u64) -> [u8; 3] {
        self.palette[(index % self.palette.len() as u64) as usize]
    }

    pub fn seek_count(&self) -> u64 {
        self.seeks
    }

    fn wait_for_slot(&mut self) {
        if !self.paced {
            return;
        }
        let period = Duration::from_secs_f64(1.0 / self.info.fps);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + period);
    }
}

impl VideoSource for SyntheticSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.closed {
            return Err(CaptureError::Closed);
        }
        if self.frames.is_some_and(|frames| self.position >= frames) {
            return Ok(None);
        }
        self.wait_for_slot();
        let colour = self.colour_at(self.position);
        self.position += 1;
        Ok(Some(Frame::solid(self.info.width, self.info.height, colour)))
    }

    fn seek_to_start(&mut self) -> Result<(), CaptureError> {
        if self.closed {
            return Err(CaptureError::Other(anyhow!("cannot rewind a closed source")));
        }
        self.position = 0;
        self.seeks += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uri_with_frame_count() {
        let source = SyntheticSource::from_uri("synthetic://64x48@25?frames=10").unwrap();
        assert_eq!(
            source.info(),
            SourceInfo {
                width: 64,
                height: 48,
                fps: 25.0
            }
        );
        assert_eq!(source.frames, Some(10));
    }

    #[test]
    fn rejects_malformed_uris() {
        for uri in [
            "synthetic://64x48",
            "synthetic://64@30",
            "synthetic://0x48@30",
            "synthetic://64x48@0",
            "synthetic://64x48@1e-300",
            "synthetic://64x48@30?loops=2",
        ] {
            assert!(SyntheticSource::from_uri(uri).is_err(), "{uri} accepted");
        }
    }

    #[test]
    fn ends_after_frame_count_and_rewinds() {
        let mut source = SyntheticSource::new(4, 4, 30.0)
            .unpaced()
            .with_frame_count(2)
            .with_palette(vec![[1, 1, 1], [2, 2, 2]]);
        assert_eq!(source.read_frame().unwrap().unwrap().data[0], 1);
        assert_eq!(source.read_frame().unwrap().unwrap().data[0], 2);
        assert!(source.read_frame().unwrap().is_none());

        source.seek_to_start().unwrap();
        assert_eq!(source.seek_count(), 1);
        assert_eq!(source.read_frame().unwrap().unwrap().data[0], 1);
    }

    #[test]
    fn closed_source_refuses_reads() {
        let mut source = SyntheticSource::new(2, 2, 30.0).unpaced();
        source.close();
        assert!(matches!(source.read_frame(), Err(CaptureError::Closed)));
    }

    #[test]
    fn paced_reads_follow_the_frame_rate() {
        let mut source = SyntheticSource::new(2, 2, 100.0).with_frame_count(6);
        let start = Instant::now();
        while source.read_frame().unwrap().is_some() {}
        // First frame is immediate, five more at 10ms spacing.
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
