//! Vista del cluster: deployments y pods leídos de un snapshot JSON.
//!
//! Cada recarga del archivo se compara con la anterior y las diferencias
//! se convierten en eventos que el manager atiende como cualquier pedido.

use common::{namespace_or_default, DeploymentSpec, ProcessMessage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::DealerResult;
use crate::jobs::{ManagerContext, Request, Response};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub deployments: Vec<DeploymentSpec>,
    #[serde(default)]
    pub pods: Vec<ProcessMessage>,
}

impl ClusterSnapshot {
    pub fn load(path: &Path) -> DealerResult<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Un snapshot que falta o no se puede leer equivale a un cluster vacío
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::load(path) {
            Ok(snapshot) => {
                info!(
                    path = %path.display(),
                    deployments = snapshot.deployments.len(),
                    pods = snapshot.pods.len(),
                    "snapshot del cluster cargado"
                );
                snapshot
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "no se pudo leer el snapshot del cluster");
                Self::default()
            }
        }
    }

    /// Se queda con un namespace; vacío = todos
    pub fn for_namespace(mut self, namespace: &str) -> Self {
        if namespace.is_empty() {
            return self;
        }
        self.deployments
            .retain(|d| namespace_or_default(&d.namespace) == namespace);
        self.pods.retain(|p| p.namespace() == namespace);
        self
    }

    fn deployments_by_key(&self) -> BTreeMap<String, &DeploymentSpec> {
        self.deployments.iter().map(|d| (d.key(), d)).collect()
    }

    fn pods_by_key(&self) -> BTreeMap<String, &ProcessMessage> {
        self.pods.iter().map(|p| (p.key(), p)).collect()
    }

    /// Eventos que llevan de `self` a `newer`
    pub fn diff(&self, newer: &ClusterSnapshot) -> Vec<ClusterEvent> {
        let mut events = Vec::new();

        let old_deps = self.deployments_by_key();
        let new_deps = newer.deployments_by_key();
        for (key, spec) in &new_deps {
            if old_deps.get(key) != Some(spec) {
                events.push(ClusterEvent::DeploymentUpdated((*spec).clone()));
            }
        }
        for (key, spec) in &old_deps {
            if !new_deps.contains_key(key) {
                events.push(ClusterEvent::DeploymentDeleted {
                    namespace: spec.namespace.clone(),
                    function: spec.function.clone(),
                    version: spec.version.clone(),
                });
            }
        }

        let old_pods = self.pods_by_key();
        let new_pods = newer.pods_by_key();
        for (key, pod) in &new_pods {
            let changed = match old_pods.get(key) {
                Some(old) => old.state != pod.state || old.ip != pod.ip || old.port != pod.port,
                None => true,
            };
            if changed {
                events.push(ClusterEvent::PodUpdated((*pod).clone()));
            }
        }
        for (key, pod) in &old_pods {
            if !new_pods.contains_key(key) {
                events.push(ClusterEvent::PodDeleted {
                    namespace: pod.namespace().to_string(),
                    name: pod.name.clone(),
                });
            }
        }
        events
    }
}

/// Cambio observado en el cluster
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    DeploymentUpdated(DeploymentSpec),
    DeploymentDeleted {
        namespace: String,
        function: String,
        version: String,
    },
    PodUpdated(ProcessMessage),
    PodDeleted { namespace: String, name: String },
}

impl ClusterEvent {
    pub fn into_request(self) -> Request {
        match self {
            ClusterEvent::DeploymentUpdated(spec) => Request::DeployUpdate(spec),
            ClusterEvent::DeploymentDeleted {
                namespace,
                function,
                version,
            } => Request::DeployRemove {
                namespace,
                function,
                version,
            },
            ClusterEvent::PodUpdated(pod) => Request::PodUpdate(pod),
            ClusterEvent::PodDeleted { namespace, name } => Request::PodRemove { namespace, name },
        }
    }

    pub async fn dispatch(self, ctx: &ManagerContext) -> DealerResult<Response> {
        ctx.submit_req(self.into_request()).await
    }
}

/// Relee el snapshot cada `interval` y envía al manager lo que cambió
pub async fn watch_snapshot(
    ctx: ManagerContext,
    path: PathBuf,
    namespace: String,
    interval: Duration,
    mut current: ClusterSnapshot,
) {
    loop {
        tokio::time::sleep(interval).await;

        let newer = match ClusterSnapshot::load(&path) {
            Ok(snapshot) => snapshot.for_namespace(&namespace),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "snapshot ilegible, se mantiene el anterior");
                continue;
            }
        };
        let events = current.diff(&newer);
        if events.is_empty() {
            continue;
        }
        info!(events = events.len(), "cambios en el cluster");
        for event in events {
            let kind = event.clone().into_request().kind();
            if let Err(e) = event.dispatch(&ctx).await {
                warn!(event = kind, error = %e, "evento del cluster rechazado");
                if matches!(e, crate::error::DealerError::ManagerStopped) {
                    return;
                }
            }
        }
        current = newer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DeploymentJob, ProcessState};
    use serde_json::json;

    fn snapshot() -> ClusterSnapshot {
        serde_json::from_value(json!({
            "deployments": [
                {"namespace": "prod", "function": "fn", "replicas": 2,
                 "jobs": {"j": {"totalTasks": 4}}},
                {"namespace": "dev", "function": "other"}
            ],
            "pods": [
                {"name": "p1", "namespace": "prod", "function": "fn", "ip": "10.0.0.1", "state": "ready"},
                {"name": "p2", "namespace": "dev", "function": "other", "state": "notready"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn snapshot_inexistente_es_cluster_vacio() {
        let snapshot = ClusterSnapshot::load_or_default(Some(Path::new("/no/existe/cluster.json")));
        assert_eq!(snapshot, ClusterSnapshot::default());
        assert_eq!(ClusterSnapshot::load_or_default(None), ClusterSnapshot::default());
    }

    #[test]
    fn filtra_por_namespace() {
        let prod = snapshot().for_namespace("prod");
        assert_eq!(prod.deployments.len(), 1);
        assert_eq!(prod.deployments[0].jobs["j"].total_tasks, 4);
        assert_eq!(prod.pods.len(), 1);
        assert_eq!(prod.pods[0].state, ProcessState::Ready);

        assert_eq!(snapshot().for_namespace("").pods.len(), 2);
    }

    #[test]
    fn diff_genera_los_eventos_del_cambio() {
        let old = snapshot();
        let mut newer = snapshot();
        newer.deployments.remove(1);
        newer.deployments[0].jobs.insert(
            "k".into(),
            DeploymentJob {
                total_tasks: 1,
                ..Default::default()
            },
        );
        newer.pods[0].state = ProcessState::NotReady;
        newer.pods.remove(1);

        let events = old.diff(&newer);

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], ClusterEvent::DeploymentUpdated(d) if d.jobs.len() == 2));
        assert_eq!(
            events[1],
            ClusterEvent::DeploymentDeleted {
                namespace: "dev".into(),
                function: "other".into(),
                version: String::new(),
            }
        );
        assert!(matches!(&events[2], ClusterEvent::PodUpdated(p) if p.name == "p1"));
        assert!(matches!(
            events[3].clone().into_request(),
            Request::PodRemove { ref name, .. } if name == "p2"
        ));

        assert!(old.diff(&snapshot()).is_empty());
    }
}
