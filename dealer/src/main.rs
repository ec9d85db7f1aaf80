use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dealer::cluster::{self, ClusterSnapshot};
use dealer::handlers::{self, AppState};
use dealer::jobs::{FileJobStore, JobManager, JobStore, MemoryJobStore};
use dealer::monitor;
use dealer::push::HttpTransport;
use dealer::DealerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = DealerConfig::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store: Box<dyn JobStore> = match &config.store_dir {
        Some(dir) => Box::new(
            FileJobStore::new(dir)
                .with_context(|| format!("no se pudo abrir el store en {}", dir.display()))?,
        ),
        None => {
            info!("sin directorio de store, los jobs se guardan en memoria");
            Box::new(MemoryJobStore::new())
        }
    };
    let manager_config = config.manager_config();
    let remote = Arc::new(HttpTransport::new(manager_config.push_timeout));
    let mut manager = JobManager::new(manager_config, store, remote);

    // estado inicial: deployments del cluster, jobs guardados y pods existentes
    let snapshot = ClusterSnapshot::load_or_default(config.cluster_file.as_deref())
        .for_namespace(&config.namespace);
    let new_deps: Vec<String> = snapshot
        .deployments
        .iter()
        .map(|spec| manager.update_deployment(spec))
        .collect();
    manager.init_jobs(&config.namespace);
    manager.init_processes(&snapshot.pods);
    manager.rebalance_new_deps(&new_deps);

    let (ctx, manager_handle) = manager.start();

    tokio::spawn(monitor::monitor_processes(ctx.clone(), config.health_interval()));
    if let Some(path) = config.cluster_file.clone() {
        tokio::spawn(cluster::watch_snapshot(
            ctx.clone(),
            path,
            config.namespace.clone(),
            config.health_interval(),
            snapshot,
        ));
    }

    let app = handlers::build_router(AppState { manager: ctx });
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", config.listen))?;
    info!("dealer escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // el monitor y el watcher todavía tienen handles del manager
    manager_handle.abort();
    info!("dealer detenido");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("señal de apagado recibida");
    }
}
