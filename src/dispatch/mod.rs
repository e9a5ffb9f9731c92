pub mod request;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures_util::TryStreamExt;
use http::{Method, StatusCode};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::io::StreamReader;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheKey, EntryStatus, LocalStore, MemoryIndex};
use crate::gc::GarbageCollector;
use crate::metrics;
use crate::settings::Settings;

pub use request::{
    CacheRequest, CacheResponse, CacheTarget, Origin, ResponsePayload, BAD_GATEWAY_BODY,
};

const QUEUE_DEPTH: usize = 100;
const STATUS_WAIT_ATTEMPTS: u32 = 300;
const STATUS_WAIT_INTERVAL: Duration = Duration::from_millis(20);

/// The two outbound HTTP clients, sharing one trust store. `fetch` follows
/// redirects and is used for the authorization probe and fetch-for-cache;
/// `passthrough` performs no redirect handling so clients see the upstream's
/// own 3xx responses verbatim.
#[derive(Clone)]
pub struct UpstreamClients {
    pub fetch: reqwest::Client,
    pub passthrough: reqwest::Client,
}

pub fn build_clients(settings: &Settings) -> Result<UpstreamClients> {
    let timeout = settings.upstream_timeout();
    let mut roots = Vec::new();
    if let Some(ca_path) = &settings.tls.upstream_ca {
        let pem = std::fs::read(ca_path)
            .with_context(|| format!("failed to read CA bundle {}", ca_path.display()))?;
        roots = reqwest::Certificate::from_pem_bundle(&pem)
            .with_context(|| format!("failed to parse CA bundle {}", ca_path.display()))?;
    }

    let builder = |redirects: bool| {
        let mut builder = reqwest::Client::builder().use_rustls_tls().timeout(timeout);
        if !redirects {
            builder = builder.redirect(reqwest::redirect::Policy::none());
        }
        for cert in &roots {
            builder = builder.add_root_certificate(cert.clone());
        }
        builder
    };

    Ok(UpstreamClients {
        fetch: builder(true).build().context("failed to build fetch client")?,
        passthrough: builder(false)
            .build()
            .context("failed to build pass-through client")?,
    })
}

/// Fixed-size worker pool draining a single bounded request queue. Each worker
/// runs the per-digest state machine: probe, claim, fetch, store, or fall back
/// to the upstream. Contended requests are pushed back onto the queue tail.
pub struct Dispatcher {
    tx: mpsc::Sender<CacheRequest>,
    rx: Mutex<mpsc::Receiver<CacheRequest>>,
    index: Arc<MemoryIndex>,
    store: Arc<LocalStore>,
    gc: Arc<GarbageCollector>,
    clients: UpstreamClients,
}

impl Dispatcher {
    pub fn new(
        index: Arc<MemoryIndex>,
        store: Arc<LocalStore>,
        gc: Arc<GarbageCollector>,
        clients: UpstreamClients,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            index,
            store,
            gc,
            clients,
        })
    }

    pub fn start(self: &Arc<Self>, workers: usize) {
        for id in 0..workers {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                info!(worker = id, "worker started");
                dispatcher.run(id).await;
            });
        }
    }

    /// Enqueue a request; blocks when the queue is full (backpressure onto the
    /// router). Workers reuse this to push contended requests back.
    pub async fn push(&self, cr: CacheRequest) {
        if self.tx.send(cr).await.is_err() {
            // receiver lives as long as the dispatcher, so this cannot happen
            // outside teardown
            warn!("request queue closed");
        }
    }

    async fn pop(&self) -> Option<CacheRequest> {
        self.rx.lock().await.recv().await
    }

    async fn run(self: Arc<Self>, id: usize) {
        while let Some(mut cr) = self.pop().await {
            let Some(target) = cr.target.clone() else {
                self.reply_from_upstream(cr).await;
                continue;
            };

            let mut status = self.index.get_status(&target.key);
            if status == EntryStatus::NotFound {
                if !self.authorized(&cr).await {
                    self.reply_from_upstream(cr).await;
                    continue;
                }

                // the entry must exist before the claim can be taken
                if let Err(err) = self.index.put(&target.key, &target.datafile) {
                    warn!(key = %target.key, error = %err, "failed to create index entry");
                    self.reply_from_upstream(cr).await;
                    continue;
                }

                if let Err(err) = self.store_file(id, &target, &cr).await {
                    warn!(key = %target.key, error = %err, "failed to store file locally");
                    self.reply_from_upstream(cr).await;
                    continue;
                }

                let (observed, timed_out) = self.wait_for_status(&target.key).await;
                if timed_out {
                    trace!(key = %target.key, "status unchanged, requeueing request");
                    self.push(cr).await;
                    continue;
                }
                status = observed;
            }

            // another worker is downloading this digest
            if status == EntryStatus::InProgress {
                trace!(key = %target.key, "requeueing request behind in-progress fetch");
                self.push(cr).await;
                continue;
            }

            if status == EntryStatus::Available {
                if !self.authorized(&cr).await {
                    self.reply_from_upstream(cr).await;
                    continue;
                }

                match self.store.read(&target.key, &target.datafile).await {
                    Ok((body, meta)) => {
                        metrics::record_cache_hit(target.item, &target.key);
                        reply(
                            &mut cr,
                            CacheResponse {
                                origin: Origin::Cache,
                                payload: ResponsePayload::CacheHit { meta, body },
                            },
                        );
                        continue;
                    }
                    Err(err) => {
                        warn!(key = %target.key, error = %err, "failed to fetch data from cache");
                        metrics::record_failed_request(
                            metrics::CACHE_READ_ERROR,
                            cr.url.path(),
                        );
                        // try to clean up the bad entry; skips if GC is busy
                        let gc = self.gc.clone();
                        tokio::spawn(async move { gc.try_collect().await });
                        self.reply_from_upstream(cr).await;
                        continue;
                    }
                }
            }

            self.reply_from_upstream(cr).await;
        }
    }

    /// Authorization probe: a HEAD clone of the client request sent upstream.
    /// Anything but 200 means the upstream wants to answer this client itself.
    async fn authorized(&self, cr: &CacheRequest) -> bool {
        let probe = self
            .clients
            .fetch
            .request(Method::HEAD, cr.url.clone())
            .headers(cr.headers.clone());
        match probe.send().await {
            Ok(resp) => {
                trace!(
                    status = resp.status().as_u16(),
                    path = cr.url.path(),
                    "authorization probe"
                );
                resp.status() == StatusCode::OK
            }
            Err(err) => {
                warn!(path = cr.url.path(), error = %err, "authorization probe failed");
                false
            }
        }
    }

    /// Fetch the object from upstream and persist it, under the writer claim.
    /// Returning `Ok` without storing means another worker holds the claim.
    async fn store_file(&self, id: usize, target: &CacheTarget, cr: &CacheRequest) -> Result<()> {
        let started = Instant::now();

        self.index.set_worker(&target.key, Some(id), false)?;
        if self.index.get_worker(&target.key) != Some(id) {
            return Ok(());
        }

        metrics::upstream_conn_add(1);
        let fetch = self
            .clients
            .fetch
            .request(cr.method.clone(), cr.url.clone())
            .headers(cr.headers.clone())
            .send()
            .await;
        let resp = match fetch {
            Ok(resp) => resp,
            Err(err) => {
                metrics::record_failed_request(metrics::UPSTREAM_ERROR, cr.url.path());
                metrics::upstream_conn_add(-1);
                return Err(err).context("error while requesting upstream");
            }
        };
        if resp.status() != StatusCode::OK {
            metrics::upstream_conn_add(-1);
            return Err(anyhow!(
                "upstream returned a non-200 response: {}",
                resp.status()
            ));
        }

        self.index.set_status(&target.key, EntryStatus::InProgress)?;

        let content_length = resp.content_length().map(|v| v as i64).unwrap_or(-1);
        let respfile = crate::cache::ResponseFile::new(
            content_length,
            resp.status(),
            resp.headers(),
            &target.key,
        );

        let body = StreamReader::new(resp.bytes_stream().map_err(std::io::Error::other));
        let written = match self
            .store
            .create(&target.key, &target.datafile, &respfile, body)
            .await
        {
            Ok(written) => written,
            Err(err) => {
                let _ = self.index.set_status(&target.key, EntryStatus::NotFound);
                metrics::upstream_conn_add(-1);
                return Err(err).context("error while writing file to disk");
            }
        };

        self.index.set_status(&target.key, EntryStatus::Available)?;
        self.index.set_worker(&target.key, None, true)?;
        metrics::upstream_conn_add(-1);

        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let mbps = written as f64 / elapsed / 1024.0 / 1024.0 * 8.0;
            metrics::record_pull_speed(&target.key, target.item, mbps);
        }

        info!(file = %target.datafile.display(), bytes = written, "file stored locally");
        Ok(())
    }

    /// Poll the entry status until it leaves `NotFound` or the polling window
    /// closes. Returns the last observed status and whether the wait timed out.
    async fn wait_for_status(&self, key: &CacheKey) -> (EntryStatus, bool) {
        let mut status = self.index.get_status(key);
        for _ in 0..=STATUS_WAIT_ATTEMPTS {
            status = self.index.get_status(key);
            if status != EntryStatus::NotFound {
                return (status, false);
            }
            tokio::time::sleep(STATUS_WAIT_INTERVAL).await;
        }
        (status, true)
    }

    /// Serve the request as a plain reverse proxy. On upstream failure the
    /// client gets a synthesized 502.
    async fn reply_from_upstream(&self, mut cr: CacheRequest) {
        metrics::upstream_conn_add(1);
        let mut req = self
            .clients
            .passthrough
            .request(cr.method.clone(), cr.url.clone())
            .headers(cr.headers.clone());
        if let Some(body) = cr.body.take() {
            req = req.body(body);
        }

        let payload = match req.send().await {
            Ok(resp) => ResponsePayload::Upstream(resp),
            Err(err) => {
                debug!(path = cr.url.path(), error = %err, "pass-through request failed");
                metrics::record_failed_request(metrics::UPSTREAM_ERROR, cr.url.path());
                metrics::upstream_conn_add(-1);
                ResponsePayload::BadGateway
            }
        };
        reply(
            &mut cr,
            CacheResponse {
                origin: Origin::Upstream,
                payload,
            },
        );
    }
}

fn reply(cr: &mut CacheRequest, response: CacheResponse) {
    if let Some(tx) = cr.reply.take() {
        let _ = tx.send(response);
    }
}

/// Wait for a worker reply; a dropped reply channel is reported as an error
/// so the router can fail the request instead of hanging.
pub async fn await_reply(rx: oneshot::Receiver<CacheResponse>) -> Result<CacheResponse> {
    rx.await.map_err(|_| anyhow!("worker dropped the request"))
}
