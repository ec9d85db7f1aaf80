use anyhow::Result;
use axum::{extract::State, routing::post, Json, Router};
use common::{JobShort, ProcessMessage, ProcessState, TaskId, TaskMessage, TaskState};
use reqwest::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Tarea tal como la ve este proceso
#[derive(Debug, Clone)]
struct LocalTask {
    state: TaskState,
    progress: f64,
    checkpoint: Option<serde_json::Value>,
}

/// Tareas locales agrupadas por job
#[derive(Debug, Default)]
pub struct TaskTable {
    jobs: BTreeMap<String, BTreeMap<TaskId, LocalTask>>,
    totals: BTreeMap<String, usize>,
}

impl TaskTable {
    /// Aplica el estado deseado que manda el dealer (push o respuesta del pull).
    /// Lo que el dealer ya no lista se descarta.
    pub fn apply_desired(&mut self, desired: &ProcessMessage) {
        let mut next: BTreeMap<String, BTreeMap<TaskId, LocalTask>> = BTreeMap::new();

        for (job_name, job) in &desired.jobs {
            let current = self.jobs.remove(job_name).unwrap_or_default();
            let mut tasks = BTreeMap::new();
            for wanted in &job.tasks {
                let local = current.get(&wanted.id).cloned();
                let task = match (wanted.state, local) {
                    (TaskState::Stopping, Some(mut t)) => {
                        if t.state != TaskState::Completed {
                            info!(job = %job_name, task = wanted.id, "deteniendo tarea");
                            t.state = TaskState::Deleted;
                        }
                        t
                    }
                    (TaskState::Stopping, None) => LocalTask {
                        state: TaskState::Deleted,
                        progress: wanted.progress.unwrap_or_default(),
                        checkpoint: wanted.checkpoint.clone(),
                    },
                    (TaskState::Alloc | TaskState::Running, Some(t)) => t,
                    (TaskState::Alloc | TaskState::Running, None) => {
                        info!(job = %job_name, task = wanted.id, "arrancando tarea");
                        LocalTask {
                            state: TaskState::Running,
                            progress: wanted.progress.unwrap_or_default(),
                            checkpoint: wanted.checkpoint.clone(),
                        }
                    }
                    (state, _) => {
                        debug!(job = %job_name, task = wanted.id, %state, "estado deseado ignorado");
                        continue;
                    }
                };
                tasks.insert(wanted.id, task);
            }
            if !tasks.is_empty() {
                next.insert(job_name.clone(), tasks);
                self.totals.insert(job_name.clone(), job.total_tasks);
            }
        }

        for (job_name, dropped) in &self.jobs {
            if !dropped.is_empty() {
                debug!(job = %job_name, tasks = dropped.len(), "tareas que el dealer ya no lista");
            }
        }
        self.totals.retain(|name, _| next.contains_key(name));
        self.jobs = next;
    }

    /// Avanza las tareas en curso; las que llegan a 1.0 quedan completadas
    pub fn tick(&mut self, step: f64) {
        for (job_name, tasks) in &mut self.jobs {
            for (id, task) in tasks.iter_mut() {
                if task.state != TaskState::Running {
                    continue;
                }
                task.progress = (task.progress + step).min(1.0);
                task.checkpoint = Some(json!({ "progress": task.progress }));
                if task.progress >= 1.0 {
                    info!(job = %job_name, task = id, "tarea completada");
                    task.state = TaskState::Completed;
                }
            }
        }
    }

    pub fn task_count(&self) -> usize {
        self.jobs.values().map(BTreeMap::len).sum()
    }

    /// Reporte para el dealer con la identidad del proceso
    pub fn report(&self, identity: &ProcessMessage) -> ProcessMessage {
        let mut msg = identity.clone();
        msg.jobs = self
            .jobs
            .iter()
            .map(|(name, tasks)| {
                let short = JobShort {
                    total_tasks: self.totals.get(name).copied().unwrap_or_default(),
                    tasks: tasks
                        .iter()
                        .map(|(id, t)| TaskMessage {
                            id: *id,
                            state: t.state,
                            checkpoint: t.checkpoint.clone(),
                            progress: Some(t.progress),
                            delay: None,
                        })
                        .collect(),
                    metadata: None,
                };
                (name.clone(), short)
            })
            .collect();
        msg
    }
}

#[derive(Clone)]
pub struct WorkerState {
    pub identity: ProcessMessage,
    pub tasks: Arc<Mutex<TaskTable>>,
}

impl WorkerState {
    pub fn new(identity: ProcessMessage) -> Self {
        Self {
            identity,
            tasks: Arc::new(Mutex::new(TaskTable::default())),
        }
    }

    /// Aplica el estado deseado y devuelve el reporte actualizado
    fn apply(&self, desired: &ProcessMessage) -> ProcessMessage {
        match self.tasks.lock() {
            Ok(mut table) => {
                table.apply_desired(desired);
                debug!(tasks = table.task_count(), "estado deseado aplicado");
                table.report(&self.identity)
            }
            Err(_) => {
                warn!("tabla de tareas envenenada, se reporta vacío");
                self.identity.clone()
            }
        }
    }

    fn tick_and_report(&self, step: f64) -> ProcessMessage {
        match self.tasks.lock() {
            Ok(mut table) => {
                table.tick(step);
                table.report(&self.identity)
            }
            Err(_) => self.identity.clone(),
        }
    }
}

pub fn build_router(state: WorkerState) -> Router {
    Router::new()
        .route("/triggers", post(triggers))
        .with_state(state)
}

// Push del dealer: lista completa de tareas deseadas
async fn triggers(
    State(state): State<WorkerState>,
    Json(desired): Json<ProcessMessage>,
) -> Json<ProcessMessage> {
    debug!(tasks = desired.task_count(), "push recibido");
    Json(state.apply(&desired))
}

pub async fn serve(listener: TcpListener, state: WorkerState) -> Result<()> {
    info!("worker escuchando pushes en {}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Loop de pulls: reporta el avance y recibe el estado deseado
pub async fn pull_loop(state: WorkerState, dealer_url: String, interval: Duration, step: f64) {
    let client = Client::new();
    let url = format!(
        "{}/processes/{}/{}",
        dealer_url.trim_end_matches('/'),
        state.identity.namespace(),
        state.identity.name
    );

    loop {
        let report = state.tick_and_report(step);
        let result = async {
            let resp = client.put(&url).json(&report).send().await?;
            resp.error_for_status()?.json::<ProcessMessage>().await
        }
        .await;

        match result {
            Ok(desired) => {
                let report = state.apply(&desired);
                debug!(tasks = report.task_count(), "pull atendido");
            }
            Err(e) => warn!("error haciendo pull al dealer {}: {}", url, e),
        }
        sleep(interval).await;
    }
}

pub fn identity(
    name: String,
    namespace: String,
    function: String,
    ip: String,
    port: u16,
    max_tasks: Option<usize>,
) -> ProcessMessage {
    ProcessMessage {
        name,
        namespace,
        function,
        ip,
        port,
        state: ProcessState::Ready,
        max_tasks,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(tasks: &[(TaskId, TaskState)]) -> ProcessMessage {
        let mut msg = ProcessMessage {
            name: "w1".into(),
            ..Default::default()
        };
        msg.jobs.insert(
            "j".into(),
            JobShort {
                total_tasks: 4,
                tasks: tasks
                    .iter()
                    .map(|(id, state)| TaskMessage {
                        id: *id,
                        state: *state,
                        ..Default::default()
                    })
                    .collect(),
                metadata: None,
            },
        );
        msg
    }

    fn states(msg: &ProcessMessage) -> Vec<(TaskId, TaskState)> {
        msg.jobs
            .get("j")
            .map(|j| j.tasks.iter().map(|t| (t.id, t.state)).collect())
            .unwrap_or_default()
    }

    #[test]
    fn arranca_las_asignadas_y_borra_las_stopping() {
        let mut table = TaskTable::default();
        let me = identity("w1".into(), "default".into(), "fn".into(), String::new(), 0, None);

        table.apply_desired(&desired(&[(0, TaskState::Alloc), (1, TaskState::Alloc)]));
        assert_eq!(
            states(&table.report(&me)),
            vec![(0, TaskState::Running), (1, TaskState::Running)]
        );

        table.apply_desired(&desired(&[(0, TaskState::Running), (1, TaskState::Stopping)]));
        assert_eq!(
            states(&table.report(&me)),
            vec![(0, TaskState::Running), (1, TaskState::Deleted)]
        );

        // el dealer ya no lista la 1
        table.apply_desired(&desired(&[(0, TaskState::Running)]));
        assert_eq!(table.task_count(), 1);
    }

    #[test]
    fn tick_completa_y_guarda_checkpoint() {
        let mut table = TaskTable::default();
        let me = identity("w1".into(), "default".into(), "fn".into(), String::new(), 0, None);
        table.apply_desired(&desired(&[(2, TaskState::Alloc)]));

        table.tick(0.6);
        let report = table.report(&me);
        assert_eq!(report.jobs["j"].tasks[0].checkpoint, Some(json!({"progress": 0.6})));
        assert_eq!(report.jobs["j"].total_tasks, 4);

        table.tick(0.6);
        assert_eq!(states(&table.report(&me)), vec![(2, TaskState::Completed)]);

        // una completada que piden detener sigue completada
        table.apply_desired(&desired(&[(2, TaskState::Stopping)]));
        assert_eq!(states(&table.report(&me)), vec![(2, TaskState::Completed)]);
    }
}
