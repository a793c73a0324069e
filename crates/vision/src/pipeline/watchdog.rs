//! Advisory stall detection for the relay stages.
//!
//! Each stage beats its heartbeat once per loop iteration. The watchdog thread
//! logs a warning the first time a stage goes quiet and an info line when it
//! recovers. It never stops or restarts anything: a slow transform is normal
//! operation for a latest-value pipeline.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};

use crate::pipeline::telemetry;

/// Sleep interval between watchdog health checks.
pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Time without a heartbeat before a component is considered stalled.
pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 1_500;
/// Grace period at startup allowing components to warm up before monitoring.
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HealthComponent {
    Ingest,
    Transform,
    Emit,
}

impl HealthComponent {
    pub const ALL: [HealthComponent; 3] = [
        HealthComponent::Ingest,
        HealthComponent::Transform,
        HealthComponent::Emit,
    ];

    /// Human readable label used in log messages and metrics.
    pub fn label(self) -> &'static str {
        match self {
            HealthComponent::Ingest => "ingest",
            HealthComponent::Transform => "transform",
            HealthComponent::Emit => "emit",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Last heartbeat per stage in milliseconds since the epoch.
pub struct PipelineHealth {
    beats: [AtomicU64; 3],
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHealth {
    /// Start every component at the end of the startup grace period.
    pub fn new() -> Self {
        let grace_deadline = current_millis().saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            beats: [
                AtomicU64::new(grace_deadline),
                AtomicU64::new(grace_deadline),
                AtomicU64::new(grace_deadline),
            ],
        }
    }

    pub fn beat(&self, component: HealthComponent) {
        self.beat_at(component, current_millis());
    }

    pub(crate) fn beat_at(&self, component: HealthComponent, now: u64) {
        self.beats[component.index()].store(now, Ordering::Relaxed);
    }

    /// Components without a heartbeat within the stale threshold as of `now`.
    pub fn stale_components(&self, now: u64) -> Vec<HealthComponent> {
        HealthComponent::ALL
            .into_iter()
            .filter(|c| {
                now.saturating_sub(self.beats[c.index()].load(Ordering::Relaxed))
                    > WATCHDOG_STALE_THRESHOLD_MS
            })
            .collect()
    }
}

/// Tracks which components are currently reported as stalled so each stall is
/// logged once.
#[derive(Default)]
pub(crate) struct StallLog {
    stalled: [bool; 3],
}

impl StallLog {
    /// Returns the components that just stalled and those that just recovered.
    pub(crate) fn update(
        &mut self,
        stale: &[HealthComponent],
    ) -> (Vec<HealthComponent>, Vec<HealthComponent>) {
        let mut stalled = Vec::new();
        let mut recovered = Vec::new();
        for component in HealthComponent::ALL {
            let is_stale = stale.contains(&component);
            let was_stale = &mut self.stalled[component.index()];
            match (*was_stale, is_stale) {
                (false, true) => stalled.push(component),
                (true, false) => recovered.push(component),
                _ => {}
            }
            *was_stale = is_stale;
        }
        (stalled, recovered)
    }
}

/// Running watchdog thread. Dropping the handle without [`Watchdog::stop`]
/// leaves the thread to exit on its next poll.
pub struct Watchdog {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    pub fn spawn(health: Arc<PipelineHealth>) -> io::Result<Self> {
        Self::spawn_with_interval(health, Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS))
    }

    pub(crate) fn spawn_with_interval(
        health: Arc<PipelineHealth>,
        interval: Duration,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let handle =
            telemetry::spawn_thread("relay-watchdog", move || watch(&health, &stop_rx, interval))?;
        Ok(Self { stop_tx, handle })
    }

    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.join();
    }
}

fn watch(health: &PipelineHealth, stop_rx: &Receiver<()>, interval: Duration) {
    let mut log = StallLog::default();
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let stale = health.stale_components(current_millis());
        let (stalled, recovered) = log.update(&stale);
        for component in stalled {
            metrics::counter!("relay_stage_stalls_total", "stage" => component.label())
                .increment(1);
            warn!(
                "no heartbeat from {} stage for over {} ms",
                component.label(),
                WATCHDOG_STALE_THRESHOLD_MS
            );
        }
        for component in recovered {
            info!("{} stage is beating again", component.label());
        }
    }
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
