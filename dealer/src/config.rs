use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Configuración del binario `dealer`. Todo se puede pasar por flag o por
/// variable de entorno.
#[derive(Parser, Debug, Clone)]
#[command(name = "dealer", version, about = "Reparte las tareas de cada job entre los procesos de su deployment")]
pub struct DealerConfig {
    /// Dirección donde escucha la API REST
    #[arg(long, env = "DEALER_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: String,

    /// Namespace observado; vacío = todos
    #[arg(long, env = "DEALER_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// No hace push por HTTP: los procesos se emulan localmente
    #[arg(long = "no-push", env = "DEALER_NO_PUSH")]
    pub no_push: bool,

    /// Directorio de los registros de jobs; sin directorio se usa memoria
    #[arg(long, env = "DEALER_STORE_DIR")]
    pub store_dir: Option<PathBuf>,

    /// Snapshot JSON del cluster (deployments y pods) para arrancar
    #[arg(long, env = "DEALER_CLUSTER_FILE")]
    pub cluster_file: Option<PathBuf>,

    #[arg(short, long, env = "DEALER_VERBOSE")]
    pub verbose: bool,

    /// Capacidad de la cola de pedidos del manager
    #[arg(long, default_value_t = 100)]
    pub queue_capacity: usize,

    /// Segundos sin reportes tras los cuales un proceso se desaloja
    #[arg(long, default_value_t = 60)]
    pub process_timeout_secs: u64,

    /// Cada cuántos segundos corre el barrido de salud
    #[arg(long, default_value_t = 10)]
    pub health_interval_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub push_timeout_secs: u64,

    /// Demora de las respuestas emuladas, en milisegundos
    #[arg(long, default_value_t = 50)]
    pub loopback_delay_ms: u64,
}

impl DealerConfig {
    pub fn manager_config(&self) -> ManagerContextConfig {
        ManagerContextConfig {
            request_queue: self.queue_capacity,
            response_queue: self.queue_capacity,
            disable_push: self.no_push,
            process_timeout: Duration::from_secs(self.process_timeout_secs),
            push_timeout: Duration::from_secs(self.push_timeout_secs),
            loopback_delay: Duration::from_millis(self.loopback_delay_ms),
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Filtro de logs por defecto; `RUST_LOG` lo reemplaza
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "dealer=debug,tower_http=debug,axum=info"
        } else {
            "dealer=info,tower_http=info"
        }
    }
}

/// Parámetros del manager
#[derive(Debug, Clone)]
pub struct ManagerContextConfig {
    pub request_queue: usize,
    pub response_queue: usize,
    pub disable_push: bool,
    pub process_timeout: Duration,
    pub push_timeout: Duration,
    pub loopback_delay: Duration,
}

impl Default for ManagerContextConfig {
    fn default() -> Self {
        Self {
            request_queue: 100,
            response_queue: 100,
            disable_push: false,
            process_timeout: Duration::from_secs(60),
            push_timeout: Duration::from_secs(5),
            loopback_delay: Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valores_por_defecto() {
        let cfg = DealerConfig::parse_from(["dealer"]);
        assert_eq!(cfg.listen, "0.0.0.0:3000");
        assert!(!cfg.no_push);
        assert!(cfg.store_dir.is_none());
        assert_eq!(cfg.manager_config().request_queue, 100);
        assert_eq!(cfg.log_filter(), "dealer=info,tower_http=info");
    }

    #[test]
    fn flags_pisan_los_defaults() {
        let cfg = DealerConfig::parse_from([
            "dealer",
            "--no-push",
            "--listen",
            "127.0.0.1:9000",
            "--store-dir",
            "/tmp/jobs",
            "-v",
            "--loopback-delay-ms",
            "0",
        ]);
        assert!(cfg.no_push);
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.store_dir, Some(PathBuf::from("/tmp/jobs")));
        assert!(cfg.manager_config().disable_push);
        assert!(cfg.manager_config().loopback_delay.is_zero());
        assert_eq!(cfg.log_filter(), "dealer=debug,tower_http=debug,axum=info");
    }
}
