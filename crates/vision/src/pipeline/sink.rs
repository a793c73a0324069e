//! Downstream consumer of emitted frames.
//!
//! [`FfmpegSink`] pipes raw bgr24 into an `ffmpeg` child that serves MPEG-TS
//! on a listening TCP socket. The child is owned by [`SinkProcess`], which
//! closes its stdin, waits a bounded grace period and kills it on every exit
//! path, including unwinding. A [`SinkAbort`] kills the same child from another
//! thread, which frees a writer blocked on a consumer that stopped reading.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};
use video_ingest::FrameFormat;

use crate::pipeline::config::{DEFAULT_PORT, DEFAULT_SINK_GRACE_MS};

const EXIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to start sink {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("sink stopped accepting frames")]
    Closed,
    #[error("payload holds {actual} bytes, sink expects {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error("failed to write to sink: {0}")]
    Write(#[source] io::Error),
}

/// Receives one encoded payload per emit tick.
pub trait FrameSink: Send {
    fn write_frame(&mut self, payload: &[u8]) -> Result<(), SinkError>;

    /// Flush and release the consumer. Called once after every stage has stopped.
    fn close(&mut self) {}

    /// Handle that can tear the consumer down while a write is blocked.
    fn abort_handle(&self) -> Option<SinkAbort> {
        None
    }
}

impl<K: FrameSink + ?Sized> FrameSink for Box<K> {
    fn write_frame(&mut self, payload: &[u8]) -> Result<(), SinkError> {
        (**self).write_frame(payload)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn abort_handle(&self) -> Option<SinkAbort> {
        (**self).abort_handle()
    }
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kills a sink child from outside the thread that writes to it.
#[derive(Clone)]
pub struct SinkAbort {
    program: String,
    child: Arc<Mutex<Child>>,
    grace: Duration,
}

impl SinkAbort {
    /// How long a stopping writer gets before [`SinkAbort::kill`] is due.
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Kill the child unless it has already exited. Returns whether a kill was sent.
    pub fn kill(&self) -> bool {
        let mut child = lock_child(&self.child);
        if let Ok(Some(_)) = child.try_wait() {
            return false;
        }
        warn!(
            "sink {} stopped reading; killing it after {:?}",
            self.program, self.grace
        );
        if let Err(err) = child.kill() {
            warn!("failed to kill sink {}: {err}", self.program);
        }
        true
    }
}

/// Child process fed through its stdin.
pub struct SinkProcess {
    program: String,
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    grace: Duration,
    status: Option<ExitStatus>,
}

impl SinkProcess {
    pub fn spawn(mut command: Command, grace: Duration) -> Result<Self, SinkError> {
        let program = command.get_program().to_string_lossy().into_owned();
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| SinkError::Spawn {
                program: program.clone(),
                source,
            })?;
        let stdin = child.stdin.take();
        debug!("started sink {program} (pid {})", child.id());
        Ok(Self {
            program,
            child: Arc::new(Mutex::new(child)),
            stdin,
            grace,
            status: None,
        })
    }

    pub fn abort_handle(&self) -> SinkAbort {
        SinkAbort {
            program: self.program.clone(),
            child: self.child.clone(),
            grace: self.grace,
        }
    }

    pub fn write(&mut self, payload: &[u8]) -> Result<(), SinkError> {
        let stdin = self.stdin.as_mut().ok_or(SinkError::Closed)?;
        stdin.write_all(payload).map_err(|err| match err.kind() {
            io::ErrorKind::BrokenPipe => SinkError::Closed,
            _ => SinkError::Write(err),
        })
    }

    /// Close stdin and wait up to the grace period before killing the child.
    ///
    /// Safe to call repeatedly; later calls return the first result.
    pub fn shutdown(&mut self) -> Option<ExitStatus> {
        if self.status.is_some() {
            return self.status;
        }
        drop(self.stdin.take());

        let deadline = Instant::now() + self.grace;
        loop {
            let polled = lock_child(&self.child).try_wait();
            match polled {
                Ok(Some(status)) => {
                    debug!("sink {} exited with {status}", self.program);
                    self.status = Some(status);
                    return self.status;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                Ok(None) => break,
                Err(err) => {
                    warn!("failed to poll sink {}: {err}", self.program);
                    break;
                }
            }
        }

        warn!(
            "sink {} did not exit within {:?}; killing it",
            self.program, self.grace
        );
        let mut child = lock_child(&self.child);
        if let Err(err) = child.kill() {
            warn!("failed to kill sink {}: {err}", self.program);
        }
        self.status = child.wait().ok();
        self.status
    }
}

impl Drop for SinkProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SinkSettings {
    pub ffmpeg: PathBuf,
    pub port: u16,
    pub grace: Duration,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            port: DEFAULT_PORT,
            grace: Duration::from_millis(DEFAULT_SINK_GRACE_MS),
        }
    }
}

/// MPEG-TS over TCP through an `ffmpeg` child.
///
/// ffmpeg blocks on its listening socket until a client connects, so writes
/// stall until then.
pub struct FfmpegSink {
    process: SinkProcess,
    frame_bytes: usize,
}

impl FfmpegSink {
    pub fn spawn(
        settings: &SinkSettings,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Self, SinkError> {
        let command = sink_command(&settings.ffmpeg, width, height, fps, settings.port);
        let process = SinkProcess::spawn(command, settings.grace)?;
        info!("ffmpeg listening on tcp://0.0.0.0:{}", settings.port);
        Ok(Self {
            process,
            frame_bytes: width as usize * height as usize * FrameFormat::Bgr8.bytes_per_pixel(),
        })
    }
}

impl FrameSink for FfmpegSink {
    fn write_frame(&mut self, payload: &[u8]) -> Result<(), SinkError> {
        if payload.len() != self.frame_bytes {
            return Err(SinkError::FrameSize {
                expected: self.frame_bytes,
                actual: payload.len(),
            });
        }
        self.process.write(payload)
    }

    fn close(&mut self) {
        self.process.shutdown();
    }

    fn abort_handle(&self) -> Option<SinkAbort> {
        Some(self.process.abort_handle())
    }
}

pub(crate) fn sink_command(
    ffmpeg: &Path,
    width: u32,
    height: u32,
    fps: f64,
    port: u16,
) -> Command {
    let mut command = Command::new(ffmpeg);
    command
        .args(["-f", "rawvideo", "-pix_fmt"])
        .arg(FrameFormat::Bgr8.ffmpeg_name())
        .arg("-s")
        .arg(format!("{width}x{height}"))
        .arg("-r")
        .arg(format!("{fps}"))
        .args(["-i", "-", "-f", "mpegts"])
        .arg(format!("tcp://0.0.0.0:{port}?listen=1"));
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn ffmpeg_command_streams_raw_bgr_to_tcp_listener() {
        let command = sink_command(Path::new("ffmpeg"), 640, 360, 30.0, 1377);
        assert_eq!(command.get_program(), "ffmpeg");
        assert_eq!(
            args(&command),
            [
                "-f",
                "rawvideo",
                "-pix_fmt",
                "bgr24",
                "-s",
                "640x360",
                "-r",
                "30",
                "-i",
                "-",
                "-f",
                "mpegts",
                "tcp://0.0.0.0:1377?listen=1",
            ]
        );
    }

    #[test]
    fn fractional_rates_are_passed_through() {
        let command = sink_command(Path::new("ffmpeg"), 2, 2, 29.97, 9000);
        assert!(args(&command).contains(&"29.97".to_string()));
    }

    #[test]
    fn spawn_failure_names_the_program() {
        let err = SinkProcess::spawn(
            Command::new("/nonexistent/relay-sink"),
            Duration::from_millis(10),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SinkError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/relay-sink"));
    }

    #[cfg(unix)]
    #[test]
    fn closing_stdin_lets_the_child_exit_within_grace() {
        let mut process = SinkProcess::spawn(Command::new("cat"), Duration::from_secs(5)).unwrap();
        process.write(&[0u8; 4096]).unwrap();
        let start = Instant::now();
        let status = process.shutdown().unwrap();
        assert!(status.success());
        assert!(start.elapsed() < Duration::from_secs(5));
        // Repeated shutdowns report the same outcome.
        assert_eq!(process.shutdown(), Some(status));
        assert!(matches!(process.write(&[1]), Err(SinkError::Closed)));
    }

    #[cfg(unix)]
    #[test]
    fn stubborn_child_is_killed_after_grace() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let mut process = SinkProcess::spawn(command, Duration::from_millis(100)).unwrap();
        let start = Instant::now();
        let status = process.shutdown().unwrap();
        assert!(!status.success());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn exited_child_reports_closed() {
        let mut process = SinkProcess::spawn(Command::new("true"), Duration::from_secs(1)).unwrap();
        // Wait for the child to exit so the pipe has no reader.
        let start = Instant::now();
        while lock_child(&process.child).try_wait().unwrap().is_none()
            && start.elapsed() < Duration::from_secs(5)
        {
            thread::sleep(Duration::from_millis(5));
        }
        let result = (0..64).try_for_each(|_| process.write(&[0u8; 65_536]));
        assert!(matches!(result, Err(SinkError::Closed)));
    }

    #[cfg(unix)]
    #[test]
    fn dropping_the_process_reaps_the_child() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let process = SinkProcess::spawn(command, Duration::from_millis(50)).unwrap();
        let pid = lock_child(&process.child).id();
        drop(process);
        // The pid no longer names a live child of ours.
        let alive = Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(!alive.success());
    }

    #[cfg(unix)]
    #[test]
    fn abort_frees_a_writer_blocked_on_a_stalled_child() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let mut process = SinkProcess::spawn(command, Duration::from_millis(100)).unwrap();
        let abort = process.abort_handle();
        assert_eq!(abort.grace(), Duration::from_millis(100));

        let start = Instant::now();
        let result = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(abort.grace());
                assert!(abort.kill());
            });
            // Far more than a pipe buffer; blocks until the child dies.
            process.write(&vec![0u8; 4 << 20])
        });

        assert!(matches!(result, Err(SinkError::Closed)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!abort.kill(), "child was already gone");
        assert!(!process.shutdown().unwrap().success());
    }
}
