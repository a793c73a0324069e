//! ffmpeg-backed decoding.
//!
//! `ffprobe` reports the stream geometry and rate, then an `ffmpeg` child
//! decodes to packed bgr24 on stdout. Rewinding restarts the child.

use std::{
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, Stdio},
};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::types::{CaptureError, Frame, FrameFormat, SourceInfo, VideoSource};

/// Rate assumed when neither the caller nor the container reports one.
pub const DEFAULT_FPS: f64 = 30.0;
/// Slowest frame rate any source or output is run at.
pub const MIN_FPS: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport, inferred from the source identifier.
pub enum SourceKind {
    /// Local file or V4L device.
    Device,
    /// Real-time streaming protocol feeds.
    Rtsp,
    /// Raw UDP / RTP input.
    Udp,
    /// Plain TCP, HTTP(S) or SRT pulls.
    Network,
    /// Generated test pattern (`synthetic://WxH@FPS`).
    Synthetic,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("synthetic://") {
            SourceKind::Synthetic
        } else if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("udp://") || uri.starts_with("rtp://") {
            SourceKind::Udp
        } else if ["tcp://", "http://", "https://", "srt://"]
            .iter()
            .any(|scheme| uri.starts_with(scheme))
        {
            SourceKind::Network
        } else {
            SourceKind::Device
        }
    }
}

#[derive(Clone, Debug)]
pub struct FfmpegOptions {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Replaces the probed frame rate when set.
    pub fps_override: Option<f64>,
}

impl Default for FfmpegOptions {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            fps_override: None,
        }
    }
}

/// Video source decoding through an `ffmpeg` child process.
pub struct FfmpegSource {
    uri: String,
    kind: SourceKind,
    info: SourceInfo,
    options: FfmpegOptions,
    decoder: Option<Decoder>,
}

struct Decoder {
    child: Child,
    stdout: ChildStdout,
}

impl FfmpegSource {
    /// Probe `uri` and start decoding it.
    pub fn open(uri: &str, options: FfmpegOptions) -> Result<Self, CaptureError> {
        let kind = SourceKind::from_uri(uri);
        let probed = probe(uri, &options)?;
        let fps = match (options.fps_override, probed.fps) {
            (Some(fps), _) => fps,
            (None, Some(fps)) => fps,
            (None, None) => {
                warn!("{uri} reports no frame rate; assuming {DEFAULT_FPS} fps");
                DEFAULT_FPS
            }
        };
        let info = SourceInfo {
            width: probed.width,
            height: probed.height,
            fps,
        };

        let mut source = Self {
            uri: uri.to_string(),
            kind,
            info,
            options,
            decoder: None,
        };
        source.spawn_decoder()?;
        debug!(
            "opened {} ({:?}) {}x{} @ {:.2} fps",
            source.uri, source.kind, info.width, info.height, info.fps
        );
        Ok(source)
    }

    fn spawn_decoder(&mut self) -> Result<(), CaptureError> {
        let mut cmd = decoder_command(&self.options.ffmpeg, &self.uri, self.kind);
        let mut child = cmd.spawn().map_err(|err| CaptureError::Open {
            uri: self.uri.clone(),
            reason: format!("failed to spawn {}: {err}", self.options.ffmpeg.display()),
        })?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Open {
                    uri: self.uri.clone(),
                    reason: "failed to capture ffmpeg stdout".to_string(),
                });
            }
        };
        self.decoder = Some(Decoder { child, stdout });
        Ok(())
    }

    fn stop_decoder(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            let _ = decoder.child.kill();
            let _ = decoder.child.wait();
        }
    }
}

impl VideoSource for FfmpegSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let decoder = self.decoder.as_mut().ok_or(CaptureError::Closed)?;
        let mut buffer = vec![0u8; self.info.frame_bytes()];
        let filled = fill_buffer(&mut decoder.stdout, &mut buffer)?;

        if filled == buffer.len() {
            return Frame::from_bgr(self.info.width, self.info.height, buffer).map(Some);
        }
        if filled > 0 {
            debug!(
                "discarding truncated trailing frame ({filled} of {} bytes)",
                buffer.len()
            );
        }

        let status = decoder.child.wait()?;
        self.decoder = None;
        if status.success() {
            Ok(None)
        } else {
            Err(CaptureError::DecoderExit { status })
        }
    }

    fn seek_to_start(&mut self) -> Result<(), CaptureError> {
        self.stop_decoder();
        self.spawn_decoder()
    }

    fn close(&mut self) {
        self.stop_decoder();
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.stop_decoder();
    }
}

/// Build the decoder invocation for `uri`.
pub(crate) fn decoder_command(ffmpeg: &Path, uri: &str, kind: SourceKind) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    match kind {
        SourceKind::Rtsp => {
            cmd.arg("-rtsp_transport")
                .arg("tcp")
                .arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay");
        }
        SourceKind::Udp | SourceKind::Network => {
            cmd.arg("-fflags")
                .arg("+genpts+discardcorrupt+nobuffer")
                .arg("-flags")
                .arg("low_delay");
        }
        SourceKind::Device | SourceKind::Synthetic => {
            if parse_device_index(uri).is_some() {
                cmd.arg("-f").arg("video4linux2");
            }
        }
    }

    let input = match parse_device_index(uri) {
        Some(index) => format!("/dev/video{index}"),
        None => uri.to_string(),
    };

    cmd.arg("-i")
        .arg(input)
        .arg("-an")
        .arg("-f")
        .arg("rawvideo")
        .arg("-pix_fmt")
        .arg(FrameFormat::Bgr8.ffmpeg_name())
        .arg("-")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    cmd
}

/// Parse a `/dev/videoX` style URI (or a bare index) into the device number.
pub(crate) fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse().ok();
    }
    None
}

/// Read until `buffer` is full or the stream ends; returns bytes read.
fn fill_buffer(reader: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[derive(Debug)]
struct ProbedStream {
    width: u32,
    height: u32,
    fps: Option<f64>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

fn probe(uri: &str, options: &FfmpegOptions) -> Result<ProbedStream, CaptureError> {
    let input = match parse_device_index(uri) {
        Some(index) => format!("/dev/video{index}"),
        None => uri.to_string(),
    };
    let output = Command::new(&options.ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height,avg_frame_rate,r_frame_rate")
        .arg("-of")
        .arg("json")
        .arg(&input)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| CaptureError::Open {
            uri: uri.to_string(),
            reason: format!("failed to run {}: {err}", options.ffprobe.display()),
        })?;

    if !output.status.success() {
        return Err(CaptureError::Open {
            uri: uri.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_probe(uri, &output.stdout)
}

fn parse_probe(uri: &str, json: &[u8]) -> Result<ProbedStream, CaptureError> {
    let probe_err = |reason: String| CaptureError::Probe {
        uri: uri.to_string(),
        reason,
    };
    let parsed: ProbeOutput =
        serde_json::from_slice(json).map_err(|err| probe_err(err.to_string()))?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| probe_err("no video stream".to_string()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(probe_err("video stream has no dimensions".to_string())),
    };

    // avg_frame_rate is 0/0 for many live feeds; r_frame_rate is the fallback.
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .filter(|fps| fps.is_finite() && *fps >= MIN_FPS);

    Ok(ProbedStream { width, height, fps })
}

/// Parse ffprobe rates such as `30000/1001` or `25`.
pub(crate) fn parse_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}
