mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

use worker::WorkerState;

/// Proceso de referencia: recibe pushes del dealer y hace pull periódico
#[derive(Debug, Parser)]
#[command(name = "worker", version)]
struct WorkerArgs {
    /// URL base del dealer
    #[arg(long, env = "DEALER_URL", default_value = "http://localhost:3000")]
    dealer_url: String,

    /// Nombre del proceso; por defecto hostname más un sufijo aleatorio
    #[arg(long, env = "WORKER_NAME")]
    name: Option<String>,

    #[arg(long, env = "WORKER_NAMESPACE", default_value = "default")]
    namespace: String,

    #[arg(long, env = "WORKER_FUNCTION", default_value = "")]
    function: String,

    /// Puerto donde se escuchan los pushes
    #[arg(long, env = "WORKER_PORT", default_value_t = common::DEFAULT_PROCESS_PORT)]
    port: u16,

    /// IP que se anuncia al dealer; vacía = el dealer no hace push
    #[arg(long, env = "WORKER_IP", default_value = "")]
    ip: String,

    #[arg(long, env = "WORKER_HEARTBEAT_SECS", default_value_t = 5)]
    heartbeat_secs: u64,

    #[arg(long, env = "WORKER_MAX_TASKS")]
    max_tasks: Option<usize>,

    /// Avance por latido de cada tarea en curso (0..1)
    #[arg(long, env = "WORKER_STEP", default_value_t = 0.1)]
    step: f64,
}

fn default_name() -> String {
    let host = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("worker=debug,reqwest=info")
        .init();

    let args = WorkerArgs::parse();
    let name = args.name.clone().unwrap_or_else(default_name);
    let identity = worker::identity(
        name,
        args.namespace.clone(),
        args.function.clone(),
        args.ip.clone(),
        args.port,
        args.max_tasks,
    );
    info!(
        name = %identity.name,
        namespace = %identity.namespace,
        dealer = %args.dealer_url,
        "arrancando worker"
    );

    let state = WorkerState::new(identity);
    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("no se pudo escuchar en el puerto {}", args.port))?;

    tokio::spawn(worker::pull_loop(
        state.clone(),
        args.dealer_url.clone(),
        Duration::from_secs(args.heartbeat_secs),
        args.step,
    ));

    worker::serve(listener, state).await
}
