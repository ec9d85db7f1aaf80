use chrono::{DateTime, Utc};
use common::{
    process_key, JobState, ProcessMessage, ProcessState, TaskId, TaskState, DEFAULT_PROCESS_PORT,
};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobMap};
use super::task::Task;
use crate::error::DealerResult;
use crate::push::{PushClient, PushRequest};

/// Procesos indexados por clave (`nombre.namespace`)
pub type ProcessMap = BTreeMap<String, Process>;

/// Resultado de reconciliar un reporte de tareas de un proceso.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdates {
    /// Alguna tarea volvió al pool
    pub tasks_deleted: bool,
    /// Alguna tarea sigue deteniéndose
    pub tasks_stopping: bool,
    /// Un job en Stopping todavía tiene tareas asignadas
    pub more_to_delete: bool,
    /// Un job pasó a Suspended
    pub force_rebalance: bool,
    /// Tareas del reporte que se descartaron
    pub rejected: usize,
}

impl TaskUpdates {
    pub fn needs_rebalance(&self) -> bool {
        self.tasks_deleted && (self.force_rebalance || !self.more_to_delete)
    }
}

/// Instancia de runtime (pod) que ejecuta tareas.
///
/// Guarda sólo ids de tareas agrupados por job; las tareas viven en el job.
#[derive(Debug, Clone)]
pub struct Process {
    pub name: String,
    pub namespace: String,
    pub function: String,
    pub version: String,
    pub ip: String,
    pub port: u16,
    pub state: ProcessState,
    pub max_tasks: Option<usize>,
    pub last_update: DateTime<Utc>,

    deployment: Option<String>,
    removing_tasks: bool,
    push_pending: bool,
    jobs: BTreeMap<String, Vec<TaskId>>,
}

impl Process {
    pub fn new(msg: &ProcessMessage) -> Self {
        Self {
            name: msg.name.clone(),
            namespace: msg.namespace().to_string(),
            function: msg.function.clone(),
            version: msg.version.clone(),
            ip: msg.ip.clone(),
            port: msg.port,
            state: msg.state,
            max_tasks: msg.max_tasks,
            last_update: Utc::now(),
            deployment: None,
            removing_tasks: false,
            push_pending: false,
            jobs: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> String {
        process_key(&self.name, &self.namespace)
    }

    /// Actualiza los datos de red que trae un reporte del propio proceso.
    /// El estado del ciclo de vida no se toca: lo deciden el dealer y el pod.
    pub fn update_from_report(&mut self, msg: &ProcessMessage) {
        if !msg.ip.is_empty() {
            self.ip = msg.ip.clone();
        }
        if msg.port != 0 {
            self.port = msg.port;
        }
        if msg.max_tasks.is_some() {
            self.max_tasks = msg.max_tasks;
        }
        if !msg.version.is_empty() {
            self.version = msg.version.clone();
        }
        self.last_update = Utc::now();
    }

    /// Pod observado en el cluster: datos de red y estado. Una baja
    /// ordenada (`Deleted`) no se revierte.
    pub fn update_from_pod(&mut self, msg: &ProcessMessage) {
        self.update_from_report(msg);
        if msg.state != ProcessState::Unknown && self.state != ProcessState::Deleted {
            self.state = msg.state;
        }
    }

    pub fn deployment(&self) -> Option<&str> {
        self.deployment.as_deref()
    }

    pub(crate) fn set_deployment(&mut self, deployment: Option<String>) {
        self.deployment = deployment;
    }

    pub fn removing_tasks(&self) -> bool {
        self.removing_tasks
    }

    pub(crate) fn set_removing_tasks(&mut self, removing: bool) {
        self.removing_tasks = removing;
    }

    pub fn push_pending(&self) -> bool {
        self.push_pending
    }

    pub(crate) fn request_push(&mut self) {
        self.push_pending = true;
    }

    pub(crate) fn cancel_push(&mut self) {
        self.push_pending = false;
    }

    pub fn is_ready(&self) -> bool {
        self.state == ProcessState::Ready
    }

    /// Todas las tareas asignadas, incluidas las que se están deteniendo
    pub fn task_count(&self) -> usize {
        self.jobs.values().map(Vec::len).sum()
    }

    pub fn has_capacity(&self) -> bool {
        self.free_capacity() > 0
    }

    pub fn free_capacity(&self) -> usize {
        match self.max_tasks {
            Some(max) => max.saturating_sub(self.task_count()),
            None => usize::MAX,
        }
    }

    pub fn task_ids(&self, job: &str) -> &[TaskId] {
        self.jobs.get(job).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    pub fn as_string(&self, jobs: &JobMap) -> String {
        let mut tasks = String::new();
        for (job_name, ids) in &self.jobs {
            let active = jobs
                .get(job_name)
                .map(|job| self.job_tasks_len(job, true))
                .unwrap_or(ids.len());
            tasks.push_str(&format!("{}({}) ", job_name, active));
        }
        format!("{}-{}: {}", self.name, self.state, tasks.trim_end())
    }

    /// Asigna un lote de tareas libres de un job a este proceso (`Alloc`)
    pub fn add_tasks(&mut self, job: &mut Job, ids: &[TaskId]) {
        let key = self.key();
        for &id in ids {
            if !job.assign(id, &key) {
                warn!(process = %self.name, job = %job.name, task = id, "la tarea no estaba libre, no se asigna");
                continue;
            }
            self.jobs.entry(job.name.clone()).or_default().push(id);
        }
    }

    /// Saca una tarea de este proceso y limpia su dueño. Idempotente.
    pub fn remove_task(&mut self, job: &mut Job, id: TaskId) {
        let Some(ids) = self.jobs.get_mut(&job.name) else {
            return;
        };
        let Some(pos) = ids.iter().position(|t| *t == id) else {
            return;
        };
        ids.remove(pos);
        if ids.is_empty() {
            self.jobs.remove(&job.name);
        }
        if job.task(id).is_some_and(|t| t.is_owned_by(&self.key())) {
            job.detach(id);
        }
    }

    /// Pasa a Stopping hasta `n` tareas activas de un job, las más nuevas primero
    pub fn stop_job_tasks(&mut self, job: &mut Job, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut stopped = 0;
        for &id in self.task_ids(&job.name).iter().rev() {
            if stopped == n {
                break;
            }
            if job.task(id).is_some_and(Task::is_active) {
                job.set_task_state(id, TaskState::Stopping);
                stopped += 1;
            }
        }
        if stopped > 0 {
            self.request_push();
        }
        stopped
    }

    /// Pasa a Stopping hasta `n` tareas activas recorriendo los jobs en orden
    pub fn stop_n_tasks(&mut self, jobs: &mut JobMap, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut stopped = 0;
        let names: Vec<String> = self.jobs.keys().cloned().collect();
        for name in names {
            if stopped == n {
                break;
            }
            if let Some(job) = jobs.get_mut(&name) {
                stopped += self.stop_job_tasks(job, n - stopped);
            }
        }
        debug!(process = %self.name, delete = n, stopped, "stop_n_tasks");
        stopped
    }

    /// Baja forzada (el pod ya no existe): todas sus tareas vuelven al pool
    pub fn remove(&mut self, jobs: &mut JobMap) {
        for (job_name, ids) in std::mem::take(&mut self.jobs) {
            let Some(job) = jobs.get_mut(&job_name) else {
                continue;
            };
            for id in ids {
                if job.task(id).is_some_and(|t| t.state() == TaskState::Completed) {
                    job.detach(id);
                } else {
                    job.release(id, TaskState::Unassigned);
                }
            }
            if job.state() == JobState::Stopping && job.assigned_tasks() == 0 {
                job.update_state(JobState::Suspended);
            }
        }
        self.removing_tasks = true;
        self.push_pending = false;
        info!(process = %self.name, "proceso removido, tareas devueltas al pool");
    }

    /// Pide detener todas las tareas del proceso (baja ordenada)
    pub fn clear_tasks(&mut self, jobs: &mut JobMap) -> bool {
        self.state = ProcessState::Deleted;
        let mut had_tasks = false;
        for (job_name, ids) in &self.jobs {
            let Some(job) = jobs.get_mut(job_name) else {
                continue;
            };
            for &id in ids {
                job.set_task_state(id, TaskState::Stopping);
                had_tasks = true;
            }
        }
        if had_tasks {
            self.removing_tasks = true;
            self.request_push();
        }
        had_tasks
    }

    /// Pide detener las tareas de un job en este proceso
    pub fn clear_job_tasks(&mut self, job: &mut Job) -> bool {
        let ids = self.task_ids(&job.name).to_vec();
        for &id in &ids {
            job.set_task_state(id, TaskState::Stopping);
        }
        if ids.is_empty() {
            return false;
        }
        self.removing_tasks = true;
        self.request_push();
        true
    }

    /// Olvida deployment y tareas (el deployment se borró y el proceso sigue)
    pub fn clear_all(&mut self) {
        self.deployment = None;
        self.jobs.clear();
    }

    pub fn get_task<'a>(&self, jobs: &'a JobMap, job: &str, id: TaskId) -> Option<&'a Task> {
        if !self.task_ids(job).contains(&id) {
            return None;
        }
        jobs.get(job).and_then(|j| j.task(id))
    }

    /// Tareas asignadas; con `active_only` se excluyen las que están en Stopping
    pub fn get_tasks<'a>(&self, jobs: &'a JobMap, active_only: bool) -> Vec<&'a Task> {
        let mut list = Vec::new();
        for (job_name, ids) in &self.jobs {
            let Some(job) = jobs.get(job_name) else {
                continue;
            };
            for &id in ids {
                if let Some(task) = job.task(id) {
                    if !active_only || task.state() != TaskState::Stopping {
                        list.push(task);
                    }
                }
            }
        }
        list
    }

    pub fn get_job_tasks_len(&self, jobs: &JobMap, job: &str, active_only: bool) -> usize {
        match jobs.get(job) {
            Some(job) => self.job_tasks_len(job, active_only),
            None => 0,
        }
    }

    pub fn job_tasks_len(&self, job: &Job, active_only: bool) -> usize {
        let ids = self.task_ids(&job.name);
        if !active_only {
            return ids.len();
        }
        ids.iter()
            .filter(|id| job.task(**id).is_some_and(|t| t.state() != TaskState::Stopping))
            .count()
    }

    /// Aplica un reporte del proceso (respuesta a un push, heartbeat o pull)
    /// sobre los jobs de su deployment, tarea por tarea.
    ///
    /// Un error en una tarea se loguea y no corta el resto del reporte.
    pub fn handle_task_updates(
        &mut self,
        jobs: &mut JobMap,
        msg: &ProcessMessage,
        is_init: bool,
    ) -> TaskUpdates {
        let key = self.key();
        let mut out = TaskUpdates::default();
        self.last_update = Utc::now();

        for (job_name, msg_job) in &msg.jobs {
            for msg_task in &msg_job.tasks {
                let task_id = msg_task.id;
                let Some(job) = jobs.get_mut(job_name) else {
                    error!(process = %self.name, task = task_id, job = %job_name, "el job de la tarea no existe en el deployment");
                    out.rejected += 1;
                    continue;
                };
                let Some(task) = job.task(task_id) else {
                    error!(process = %self.name, task = task_id, job = %job_name, total = job.total_tasks, "id de tarea fuera de rango");
                    out.rejected += 1;
                    continue;
                };

                // el dueño puede haber cambiado en un rebalanceo
                let owner = task.process().map(str::to_string);
                let current = task.state();
                match owner.as_deref() {
                    Some(owner) if owner != key => {
                        error!(process = %self.name, task = task_id, job = %job_name, task_proc = %owner, "la tarea está asignada a otro proceso");
                        out.rejected += 1;
                        continue;
                    }
                    None if !is_init => match msg_task.state {
                        TaskState::Completed => {}
                        TaskState::Deleted => continue,
                        state => {
                            warn!(process = %self.name, task = task_id, job = %job_name, %state, "reporte de una tarea sin dueño, se ignora");
                            out.rejected += 1;
                            continue;
                        }
                    },
                    _ => {}
                }

                if msg_task.checkpoint.is_some() {
                    job.mark_dirty();
                }
                if let Some(task) = job.task_mut(task_id) {
                    task.apply_report(msg_task);
                }

                if is_init
                    && owner.is_none()
                    && matches!(
                        msg_task.state,
                        TaskState::Running | TaskState::Stopping | TaskState::Completed
                    )
                {
                    job.attach(task_id, &key);
                    self.jobs.entry(job_name.clone()).or_default().push(task_id);
                }

                match msg_task.state {
                    TaskState::Deleted => {
                        if is_init {
                            continue;
                        }
                        self.remove_task(job, task_id);
                        job.set_task_state(task_id, TaskState::Unassigned);
                        out.tasks_deleted = true;
                        if job.state() == JobState::Stopping {
                            if job.assigned_tasks() != 0 {
                                // esperamos a que el job termine de drenar para rebalancear
                                out.more_to_delete = true;
                            } else {
                                info!(job = %job.name, "job drenado, pasa a suspended");
                                job.update_state(JobState::Suspended);
                                out.force_rebalance = true;
                            }
                        }
                    }
                    TaskState::Stopping => {
                        job.set_task_state(task_id, TaskState::Stopping);
                        out.tasks_stopping = true;
                    }
                    TaskState::Completed => {
                        if current != TaskState::Completed {
                            job.complete_task(task_id);
                        }
                        job.set_task_state(task_id, TaskState::Completed);
                        self.remove_task(job, task_id);
                        if job.state() == JobState::Stopping && job.assigned_tasks() == 0 {
                            job.update_state(JobState::Suspended);
                            out.tasks_deleted = true;
                            out.force_rebalance = true;
                        }
                    }
                    TaskState::Running => {
                        // un running viejo no puede pisar un Stopping que ya pedimos
                        if is_init || matches!(current, TaskState::Running | TaskState::Alloc) {
                            job.set_task_state(task_id, TaskState::Running);
                        } else {
                            debug!(process = %self.name, task = task_id, job = %job_name, %current, "reporte running obsoleto");
                        }
                    }
                    state => {
                        error!(process = %self.name, task = task_id, job = %job_name, %state, "estado ilegal reportado para la tarea");
                        out.rejected += 1;
                    }
                }
            }
        }

        out
    }

    /// Estado del proceso tal como lo ve el dealer (API y push)
    pub fn get_process_state(&self, jobs: &JobMap) -> ProcessMessage {
        let mut msg = ProcessMessage {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            function: self.function.clone(),
            version: self.version.clone(),
            ip: self.ip.clone(),
            port: self.port,
            state: self.state,
            max_tasks: self.max_tasks,
            last_update: Some(self.last_update),
            dealer_url: None,
            jobs: BTreeMap::new(),
        };
        for (job_name, ids) in &self.jobs {
            if let Some(job) = jobs.get(job_name) {
                msg.jobs.insert(job_name.clone(), job.short(ids));
            }
        }
        msg
    }

    fn endpoint(&self) -> String {
        let port = if self.port == 0 {
            DEFAULT_PROCESS_PORT
        } else {
            self.port
        };
        format!("{}:{}", self.ip, port)
    }

    /// Envía al proceso la lista deseada de tareas. Sin IP o con push
    /// deshabilitado se emula el proceso localmente por el mismo canal de respuestas.
    pub fn push_updates(&mut self, jobs: &JobMap, push: &PushClient) -> DealerResult<()> {
        self.push_pending = false;
        debug!(process = %self.name, state = %self.as_string(jobs), "push de actualizaciones al proceso");

        let message = self.get_process_state(jobs);
        let body = serde_json::to_vec(&message)?;
        let request = PushRequest::post(
            self.key(),
            format!("http://{}/triggers", self.endpoint()),
            body,
        );

        if self.ip.is_empty() || push.push_disabled() {
            push.submit_local(request);
        } else {
            push.submit(request);
        }
        Ok(())
    }
}
