//! Latest-value relay: ingest → transform → fixed-rate emit.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `slot`: single-value mailboxes joining the stages.
//! - `state`: shared lifecycle and stop reasons.
//! - `ingest`, `transform`, `emit`: the three stage loops.
//! - `scale`: working-resolution resizing around the transform.
//! - `sink`: downstream consumer and the ffmpeg output process.
//! - `supervisor`: wires the stages together and owns shutdown.
//! - `telemetry`: tracing subscribers, metrics export and stage threads.
//! - `watchdog`: advisory stall detection.

/// Re-export pipeline settings so callers can configure runs without reaching
/// into submodules.
pub use config::{RelayCliArgs, RelayConfig, TelemetryOptions};
/// Launch the relay with a ready-made configuration.
pub use supervisor::{Pipeline, PipelineReport, PipelineSettings, StageExitLag, run};

pub mod config;
pub mod emit;
pub mod ingest;
pub mod scale;
pub mod sink;
pub mod slot;
pub mod state;
mod supervisor;
pub mod telemetry;
pub mod transform;
pub mod watchdog;
