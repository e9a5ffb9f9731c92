use std::time::Duration;

use anyhow::{anyhow, Result};
use http::Method;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = fmt::fmt().with_env_filter(filter);

    let initialized = match format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .try_init(),
        LogFormat::Text => builder.with_target(false).compact().try_init(),
    };
    initialized.map_err(|err| anyhow!("failed to initialize logger: {err}"))
}

/// One line per proxied request, emitted by the router once the response is
/// committed. `origin` says which side produced the bytes the client got.
pub struct AccessEvent<'a> {
    pub origin: &'static str,
    pub status: u16,
    pub method: &'a Method,
    pub host: &'a str,
    pub path: &'a str,
    pub elapsed: Duration,
}

pub fn log_access(event: AccessEvent<'_>) {
    tracing::info!(
        target: "access_log",
        origin = event.origin,
        status = event.status,
        method = %event.method,
        host = event.host,
        path = event.path,
        elapsed_ms = event.elapsed.as_millis() as u64,
        "request served"
    );
}
