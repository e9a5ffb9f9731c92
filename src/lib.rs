pub mod cache;
pub mod cli;
pub mod dispatch;
pub mod gc;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod tls;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task;
use tracing::{error, info, warn};

use crate::cache::{LocalStore, MemoryIndex};
use crate::dispatch::Dispatcher;
use crate::gc::GarbageCollector;
use crate::proxy::Router;
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    info!(config = ?settings, "configuration loaded");

    std::fs::create_dir_all(&settings.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            settings.data_dir.display()
        )
    })?;

    let index = Arc::new(MemoryIndex::new());
    let store = Arc::new(LocalStore::new(index.clone(), settings.data_dir.clone()));

    info!("restoring cache index from disk");
    let restore_store = store.clone();
    match task::spawn_blocking(move || restore_store.restore()).await {
        Ok(Ok(())) => info!(entries = index.len(), "cache index restored"),
        Ok(Err(err)) => warn!(error = %err, "failed to restore index"),
        Err(err) => warn!(error = %err, "restore task failed"),
    }

    let gc = Arc::new(GarbageCollector::new(
        index.clone(),
        store.clone(),
        settings.gc_options(),
    ));
    let clients = dispatch::build_clients(&settings)?;
    let dispatcher = Dispatcher::new(index.clone(), store.clone(), gc.clone(), clients);
    dispatcher.start(settings.workers);
    gc.start();

    if let Some(metrics_settings) = &settings.metrics {
        metrics::spawn_samplers(index.clone());
        let addr = metrics_settings.listen;
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(addr).await {
                error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let router = Arc::new(Router::new(dispatcher, &settings)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_task(shutdown_tx);

    proxy::serve(router, &settings, shutdown_rx).await
}

fn spawn_signal_task(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, stopping proxy");
        let _ = tx.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
