use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::cache::{CacheKey, ItemType, MemoryIndex};

pub const CACHE_READ_ERROR: &str = "CacheReadError";
pub const UPSTREAM_ERROR: &str = "UpstreamError";
pub const STREAMING_ERROR: &str = "StreamingError";

const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

// Connection counts live in atomics and are sampled into gauges so the hot
// paths never touch prometheus internals.
static UPSTREAM_CONN: AtomicI64 = AtomicI64::new(0);
static CLIENTS_CONN: AtomicI64 = AtomicI64::new(0);

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static TOTAL_GC_RUNS: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("rc_total_gc_run", "total gc runs counter").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register rc_total_gc_run");
    counter
});

static CACHE_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("rc_cache_size_bytes", "size of cache folder in bytes")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register rc_cache_size_bytes");
    gauge
});

static ESTIMATED_INDEX_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "rc_estimated_index_size_bytes",
        "estimation of index size in bytes",
    )
    .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register rc_estimated_index_size_bytes");
    gauge
});

static TOTAL_CACHED_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("rc_total_cached_requests", "total cached requests counter");
    let vec = IntCounterVec::new(opts, &["type", "sha256"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register rc_total_cached_requests");
    vec
});

static TOTAL_CACHE_MISS: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("rc_cache_miss", "counter on cache miss");
    let vec = IntCounterVec::new(opts, &["type", "sha256"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register rc_cache_miss");
    vec
});

static FAILED_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("rc_failed_requests", "failed requests");
    let vec = IntCounterVec::new(opts, &["reason", "path"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register rc_failed_requests");
    vec
});

static ACTIVE_UPSTREAM_CONN: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "rc_active_upstream_conn",
        "Number of upstream active connections",
    )
    .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register rc_active_upstream_conn");
    gauge
});

static ACTIVE_CLIENTS_CONN: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "rc_active_clients_conn",
        "Number of active clients connections",
    )
    .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register rc_active_clients_conn");
    gauge
});

static BYTES_FROM_CACHE: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("rc_bytes_from_cache", "total bytes served from cache")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register rc_bytes_from_cache");
    counter
});

static UPSTREAM_PULL_SPEED: Lazy<GaugeVec> = Lazy::new(|| {
    let opts = Opts::new("rc_upstream_pull_speed_mbps", "Pull speed in Mb/s");
    let vec = GaugeVec::new(opts, &["sha256", "type"]).expect("create gauge vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register rc_upstream_pull_speed_mbps");
    vec
});

pub fn record_gc_run() {
    TOTAL_GC_RUNS.inc();
}

pub fn set_cache_size(bytes: u64) {
    CACHE_SIZE.set(bytes as i64);
}

pub fn record_cache_hit(item: ItemType, key: &CacheKey) {
    TOTAL_CACHED_REQUESTS
        .with_label_values(&[item.as_str(), key.as_str()])
        .inc();
}

pub fn record_cache_miss(item: ItemType, digest: &str) {
    TOTAL_CACHE_MISS
        .with_label_values(&[item.as_str(), digest])
        .inc();
}

pub fn record_failed_request(reason: &str, path: &str) {
    FAILED_REQUESTS.with_label_values(&[reason, path]).inc();
}

pub fn record_pull_speed(key: &CacheKey, item: ItemType, mbps: f64) {
    UPSTREAM_PULL_SPEED
        .with_label_values(&[key.as_str(), item.as_str()])
        .set(mbps);
}

pub fn add_bytes_from_cache(bytes: u64) {
    BYTES_FROM_CACHE.inc_by(bytes);
}

pub fn upstream_conn_add(delta: i64) {
    UPSTREAM_CONN.fetch_add(delta, Ordering::Relaxed);
}

pub fn clients_conn_add(delta: i64) {
    CLIENTS_CONN.fetch_add(delta, Ordering::Relaxed);
}

/// Periodically sample the atomic counters and the index size estimate into
/// their gauges.
pub fn spawn_samplers(index: Arc<MemoryIndex>) {
    tokio::spawn(async move {
        loop {
            ACTIVE_UPSTREAM_CONN.set(UPSTREAM_CONN.load(Ordering::Relaxed));
            ACTIVE_CLIENTS_CONN.set(CLIENTS_CONN.load(Ordering::Relaxed));
            // rough per-entry footprint: three map rows keyed by a 64-char digest
            let estimation = index.len() * 64 * 4;
            ESTIMATED_INDEX_SIZE.set(estimation as i64);
            tokio::time::sleep(GAUGE_REFRESH_INTERVAL).await;
        }
    });
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

/// Minimal text-exposition endpoint. One request per connection, GET only.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "metrics endpoint listening");
    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_connection(stream: tokio::net::TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    let read = timeout(READ_TIMEOUT, reader.read_line(&mut request_line))
        .await
        .map_err(|_| anyhow::anyhow!("timed out reading metrics request"))??;
    if read == 0 {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default();

    // drain headers until the empty line
    loop {
        let mut line = String::new();
        let n = timeout(READ_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow::anyhow!("timed out reading metrics request headers"))??;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let response = if method == "GET" && uri == "/metrics" {
        let body = gather();
        build_response(200, TextEncoder::new().format_type(), body)
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}
