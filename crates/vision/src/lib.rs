//! Real-time relay that annotates a video source and re-streams it at a fixed
//! rate. See [`pipeline`] for the stage layout.

pub mod pipeline;

pub use pipeline::{
    Pipeline, PipelineReport, PipelineSettings, RelayCliArgs, RelayConfig, StageExitLag, run,
};
