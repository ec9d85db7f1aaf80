use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::DealerError;
use crate::jobs::{ManagerContext, Request};

/// Pide al manager, cada `interval`, que desaloje los procesos que dejaron
/// de reportar. Termina cuando el manager se detiene.
pub async fn monitor_processes(ctx: ManagerContext, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "monitor de procesos iniciado");
    loop {
        tokio::time::sleep(interval).await;

        match ctx.submit_req(Request::ProcHealth).await {
            Ok(_) => debug!("barrido de salud terminado"),
            Err(DealerError::ManagerStopped) => {
                info!("manager detenido, el monitor termina");
                return;
            }
            Err(e) => warn!(error = %e, "barrido de salud fallido"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerContextConfig;
    use crate::jobs::{JobManager, MemoryJobStore};
    use crate::push::LoopbackTransport;
    use std::sync::Arc;

    #[tokio::test]
    async fn monitor_termina_cuando_el_manager_se_detiene() {
        let manager = JobManager::new(
            ManagerContextConfig::default(),
            Box::new(MemoryJobStore::new()),
            Arc::new(LoopbackTransport::default()),
        );
        let (ctx, handle) = manager.start();
        let monitor = tokio::spawn(monitor_processes(ctx.clone(), Duration::from_millis(5)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(ctx);
        handle.abort();

        tokio::time::timeout(Duration::from_secs(2), monitor)
            .await
            .expect("el monitor no terminó")
            .unwrap();
    }
}
