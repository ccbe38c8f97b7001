//! Telemetry helpers: tracing subscriber, Prometheus recorder and
//! dispatcher-aware thread spawning.

use std::{fs::File, io, path::Path, sync::OnceLock, thread, time::Duration};

use anyhow::{Context, Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

use crate::vision::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Keeps the Chrome trace writer alive; the file is flushed on drop.
pub(crate) struct TelemetryGuard {
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `--verbose`. A second call is a no-op.
pub(crate) fn init_tracing(opts: &TelemetryOptions) -> TelemetryGuard {
    let default_level = if opts.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let mut chrome_error = None;
    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                chrome_error = Some((path.clone(), err));
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let installed = tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .is_ok();

    if let Some((path, err)) = chrome_error {
        tracing::warn!(
            "failed to initialise chrome trace writer at {}: {err}",
            path.display()
        );
    }
    if !installed {
        tracing::debug!("tracing subscriber already installed");
    }

    TelemetryGuard {
        _chrome_guard: chrome_guard,
    }
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub(crate) fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow!("a metrics recorder is already installed"))?;

    let upkeep_handle = handle.clone();
    spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }
    })
    .context("failed to spawn prometheus upkeep thread")?;

    Ok(PROM_HANDLE.get_or_init(|| handle))
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

fn build_chrome_layer(
    path: &Path,
) -> Result<
    (
        tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
        tracing_chrome::FlushGuard,
    ),
    io::Error,
> {
    let file = File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}
