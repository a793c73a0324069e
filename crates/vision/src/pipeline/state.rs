//! Pipeline lifecycle shared by every stage.
//!
//! `Running → Stopping → Stopped`, never backwards. The first stop request
//! wins and records why the pipeline is going down; later requests are no-ops.

use std::{
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
    time::Instant,
};

use tracing::info;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Running = 0,
    Stopping = 1,
    Stopped = 2,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Running,
            1 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// End of a non-looping source.
    SourceExhausted,
    /// The source could not be read or rewound.
    SourceFailed,
    /// The downstream consumer stopped accepting frames.
    SinkClosed,
    /// Ctrl+C or an embedding caller asked to stop.
    Interrupted,
    /// A stage thread ended without a stop request (panic).
    StageFailed,
}

impl StopReason {
    pub fn label(self) -> &'static str {
        match self {
            StopReason::SourceExhausted => "source exhausted",
            StopReason::SourceFailed => "source failed",
            StopReason::SinkClosed => "sink closed",
            StopReason::Interrupted => "interrupted",
            StopReason::StageFailed => "stage failed",
        }
    }
}

pub struct PipelineState {
    phase: AtomicU8,
    /// Winning stop request and when it was made.
    reason: Mutex<Option<(StopReason, Instant)>>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Lifecycle::Running as u8),
            reason: Mutex::new(None),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// Move from running to stopping. Returns `true` for the request that won.
    pub fn request_stop(&self, reason: StopReason) -> bool {
        // Reason is stored under the lock before the phase flips so anyone
        // observing `Stopping` also sees why.
        let mut guard = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        let won = self
            .phase
            .compare_exchange(
                Lifecycle::Running as u8,
                Lifecycle::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            *guard = Some((reason, Instant::now()));
            drop(guard);
            info!("pipeline stopping: {}", reason.label());
        }
        won
    }

    /// Mark every stage as finished. Implies a stop request if none was made.
    pub fn mark_stopped(&self) {
        self.request_stop(StopReason::Interrupted);
        self.phase.store(Lifecycle::Stopped as u8, Ordering::Release);
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_request().map(|(reason, _)| reason)
    }

    pub fn stop_requested_at(&self) -> Option<Instant> {
        self.stop_request().map(|(_, at)| at)
    }

    fn stop_request(&self) -> Option<(StopReason, Instant)> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Requests a stop when dropped, so a stage that unwinds still takes the
/// pipeline down with it. Normal stage exits happen after a stop request and
/// make this a no-op.
pub(crate) struct StopOnExit<'a> {
    state: &'a PipelineState,
    reason: StopReason,
}

impl<'a> StopOnExit<'a> {
    pub(crate) fn new(state: &'a PipelineState, reason: StopReason) -> Self {
        Self { state, reason }
    }
}

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        self.state.request_stop(self.reason);
    }
}
