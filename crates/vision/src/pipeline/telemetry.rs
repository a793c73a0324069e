//! Telemetry helpers for tracing spans, Prometheus metrics and stage threads.

use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::pipeline::config::TelemetryOptions;

static PROM_EXPORTER: OnceLock<SocketAddr> = OnceLock::new();

/// Guard returned when a telemetry subscriber has been installed for the current thread.
pub struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    chrome_guard: Option<tracing_chrome::FlushGuard>,
    chrome_trace_path: Option<PathBuf>,
}

/// Install tracing subscribers for the current thread based on telemetry options.
///
/// `RUST_LOG` wins over the default level; `verbose` lowers the default to `debug`.
pub fn enter_runtime(opts: &TelemetryOptions, verbose: bool) -> TelemetryGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(fmt::time::uptime())
                    .with_filter(env_filter),
            )
            .with(tracing_error::ErrorLayer::default()),
    );

    TelemetryGuard {
        _default_guard: default_guard,
        chrome_trace_path: chrome_guard.as_ref().and(opts.chrome_trace_path.clone()),
        chrome_guard,
    }
}

/// Serve Prometheus metrics on `addr`. Later calls keep the first exporter.
pub fn install_metrics_exporter(addr: SocketAddr) -> Result<SocketAddr> {
    if let Some(existing) = PROM_EXPORTER.get() {
        return Ok(*existing);
    }
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("failed to start metrics exporter on {addr}"))?;
    Ok(*PROM_EXPORTER.get_or_init(|| addr))
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

/// Scoped variant of [`spawn_thread`] for stages borrowing pipeline state.
pub(crate) fn spawn_scoped<'scope, 'env, F, T>(
    scope: &'scope thread::Scope<'scope, 'env>,
    name: impl Into<String>,
    f: F,
) -> io::Result<thread::ScopedJoinHandle<'scope, T>>
where
    F: FnOnce() -> T + Send + 'scope,
    T: Send + 'scope,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn_scoped(scope, move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = std::fs::File::create(path)?;
    // Stage spans open and close on the same thread, so plain B/E slices render correctly.
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.chrome_guard.take() {
            guard.flush();
        }
        if let Some(path) = self.chrome_trace_path.as_ref() {
            tracing::info!("chrome trace written to {}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[test]
    fn spawned_threads_inherit_the_dispatcher() {
        let _guard = enter_runtime(&TelemetryOptions::default(), false);
        let enabled = Arc::new(AtomicBool::new(false));
        let flag = enabled.clone();
        spawn_thread("telemetry-test", move || {
            // Without an inherited subscriber every span would be disabled.
            let span = tracing::info_span!("telemetry.test");
            flag.store(!span.is_disabled(), Ordering::SeqCst);
        })
        .unwrap()
        .join()
        .unwrap();
        assert!(enabled.load(Ordering::SeqCst));
    }

    #[test]
    fn chrome_trace_file_is_created() {
        let path = std::env::temp_dir().join(format!("relay-trace-{}.json", std::process::id()));
        {
            let opts = TelemetryOptions {
                chrome_trace_path: Some(path.clone()),
                metrics_addr: None,
            };
            let _guard = enter_runtime(&opts, true);
            tracing::info_span!("test.span").in_scope(|| {});
        }
        assert!(path.is_file());
        let _ = std::fs::remove_file(path);
    }
}
