use chrono::{DateTime, Utc};
use common::{JobInfo, JobRequest, JobShort, JobState, JobTaskInfo, TaskId, TaskState};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::store::{JobRecord, TaskCheckpoint};
use super::task::Task;

/// Jobs de un deployment, ordenados por nombre para que el recorrido sea estable.
pub type JobMap = BTreeMap<String, Job>;

/// Cambio que se aplica cuando el job termina de drenar sus tareas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingChange {
    Delete,
    Redefine(usize),
}

/// Conjunto de tareas de una función con su estado de ciclo de vida.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub namespace: String,
    pub function: String,
    pub version: String,
    pub total_tasks: usize,
    pub max_task_allocation: Option<usize>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,

    state: JobState,
    completed_tasks: BTreeSet<TaskId>,
    assigned_tasks: usize,
    tasks: Vec<Task>,
    need_save: bool,
    pending: Option<PendingChange>,
}

impl Job {
    pub fn new(name: &str, namespace: &str, function: &str, total_tasks: usize) -> Self {
        Self {
            name: name.to_string(),
            namespace: common::namespace_or_default(namespace).to_string(),
            function: function.to_string(),
            version: String::new(),
            total_tasks,
            max_task_allocation: None,
            metadata: None,
            created_at: Utc::now(),
            state: JobState::Created,
            completed_tasks: BTreeSet::new(),
            assigned_tasks: 0,
            tasks: (0..total_tasks).map(Task::new).collect(),
            need_save: false,
            pending: None,
        }
    }

    pub fn from_request(req: &JobRequest) -> Self {
        let mut job = Job::new(&req.name, &req.namespace, &req.function, req.total_tasks);
        job.version = req.version.clone();
        job.max_task_allocation = req.max_task_allocation;
        job.metadata = req.metadata.clone();
        job
    }

    /// Reconstruye un job persistido. Tras un reinicio ninguna tarea está
    /// asignada, así que un job que estaba drenando queda suspendido.
    pub fn from_record(record: JobRecord) -> Self {
        let mut job = Job::new(
            &record.name,
            &record.namespace,
            &record.function,
            record.total_tasks,
        );
        job.version = record.version;
        job.max_task_allocation = record.max_task_allocation;
        job.metadata = record.metadata;
        job.state = match record.state {
            JobState::Stopping => JobState::Suspended,
            JobState::Unknown => JobState::Created,
            other => other,
        };

        for id in record.completed_tasks {
            if let Some(task) = job.tasks.get_mut(id) {
                task.set_state(TaskState::Completed);
                job.completed_tasks.insert(id);
            }
        }
        for cp in record.checkpoints {
            if let Some(task) = job.tasks.get_mut(cp.id) {
                task.checkpoint = Some(cp.checkpoint);
                task.progress = cp.progress;
            }
        }
        job
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            function: self.function.clone(),
            version: self.version.clone(),
            total_tasks: self.total_tasks,
            max_task_allocation: self.max_task_allocation,
            state: self.state,
            completed_tasks: self.completed_tasks.iter().copied().collect(),
            metadata: self.metadata.clone(),
            checkpoints: self
                .tasks
                .iter()
                .filter_map(|t| {
                    t.checkpoint.as_ref().map(|cp| TaskCheckpoint {
                        id: t.id,
                        checkpoint: cp.clone(),
                        progress: t.progress,
                    })
                })
                .collect(),
            saved_at: Utc::now(),
        }
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            function: self.function.clone(),
            version: self.version.clone(),
            state: self.state,
            total_tasks: self.total_tasks,
            assigned_tasks: self.assigned_tasks,
            completed_tasks: self.completed_tasks.iter().copied().collect(),
            max_task_allocation: self.max_task_allocation,
            metadata: self.metadata.clone(),
            tasks: self
                .tasks
                .iter()
                .map(|t| JobTaskInfo {
                    id: t.id,
                    state: t.state(),
                    process: t.process().unwrap_or_default().to_string(),
                    progress: t.progress,
                })
                .collect(),
        }
    }

    /// Versión reducida del job con las tareas indicadas, para el mensaje al proceso
    pub fn short(&self, ids: &[TaskId]) -> JobShort {
        JobShort {
            total_tasks: self.total_tasks,
            tasks: ids
                .iter()
                .filter_map(|id| self.tasks.get(*id))
                .map(Task::to_message)
                .collect(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn update_state(&mut self, state: JobState) {
        if self.state != state {
            debug!(job = %self.name, from = %self.state, to = %state, "cambio de estado de job");
            self.state = state;
        }
    }

    /// Sólo los jobs creados o corriendo reciben tareas nuevas
    pub fn is_schedulable(&self) -> bool {
        matches!(self.state, JobState::Created | JobState::Running)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn assigned_tasks(&self) -> usize {
        self.assigned_tasks
    }

    pub fn completed_tasks(&self) -> &BTreeSet<TaskId> {
        &self.completed_tasks
    }

    /// Tareas que todavía tienen trabajo (total menos completadas)
    pub fn live_tasks(&self) -> usize {
        self.total_tasks - self.completed_tasks.len()
    }

    /// Ids libres para asignar, en orden ascendente
    pub fn unassigned_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks
            .iter()
            .filter(|t| t.state() == TaskState::Unassigned && !t.is_assigned())
            .map(|t| t.id)
    }

    /// Asigna una tarea libre al proceso: `Unassigned -> Alloc`.
    /// Devuelve false si la tarea no existe o ya tiene dueño.
    pub(crate) fn assign(&mut self, id: TaskId, process: &str) -> bool {
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        if task.is_assigned() || task.state() != TaskState::Unassigned {
            return false;
        }
        task.set_process(Some(process.to_string()));
        task.set_state(TaskState::Alloc);
        task.touch();
        self.assigned_tasks += 1;
        if self.state == JobState::Created {
            self.update_state(JobState::Running);
        }
        true
    }

    /// Asocia una tarea a un proceso sin pasar por la asignación (reconciliación inicial)
    pub(crate) fn attach(&mut self, id: TaskId, process: &str) {
        if let Some(task) = self.tasks.get_mut(id) {
            if !task.is_assigned() {
                self.assigned_tasks += 1;
            }
            task.set_process(Some(process.to_string()));
            task.touch();
        }
    }

    /// Quita el dueño de la tarea sin tocar su estado
    pub(crate) fn detach(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(id) {
            if task.is_assigned() {
                self.assigned_tasks -= 1;
            }
            task.set_process(None);
            task.touch();
        }
    }

    /// Quita el dueño de la tarea y la deja en `state`
    pub(crate) fn release(&mut self, id: TaskId, state: TaskState) {
        self.detach(id);
        self.set_task_state(id, state);
    }

    pub(crate) fn set_task_state(&mut self, id: TaskId, state: TaskState) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.set_state(state);
        }
    }

    /// Registra la finalización de una tarea. Devuelve true sólo la primera vez.
    pub(crate) fn complete_task(&mut self, id: TaskId) -> bool {
        if !self.completed_tasks.insert(id) {
            return false;
        }
        self.need_save = true;
        if self.completed_tasks.len() == self.total_tasks {
            info!(job = %self.name, "todas las tareas completadas");
            self.update_state(JobState::Completed);
        }
        true
    }

    pub fn need_to_save(&self) -> bool {
        self.need_save
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.need_save = true;
    }

    pub(crate) fn mark_saved(&mut self) {
        self.need_save = false;
    }

    pub fn pending(&self) -> Option<PendingChange> {
        self.pending
    }

    pub(crate) fn set_pending(&mut self, change: PendingChange) {
        self.pending = Some(change);
    }

    /// Recrea las tareas con una nueva cantidad total (job redefinido y ya drenado)
    pub(crate) fn rebuild(&mut self, total_tasks: usize) {
        debug_assert_eq!(self.assigned_tasks, 0);
        info!(job = %self.name, old = self.total_tasks, new = total_tasks, "redefiniendo tareas del job");
        self.total_tasks = total_tasks;
        self.tasks = (0..total_tasks).map(Task::new).collect();
        self.completed_tasks.clear();
        self.assigned_tasks = 0;
        self.pending = None;
        self.need_save = true;
        self.update_state(JobState::Running);
    }

    #[cfg(test)]
    pub(crate) fn owned_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_assigned()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_nuevo_tiene_todas_las_tareas_libres() {
        let job = Job::new("j1", "", "fn", 4);
        assert_eq!(job.namespace, "default");
        assert_eq!(job.state(), JobState::Created);
        assert_eq!(job.unassigned_ids().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(job.assigned_tasks(), 0);
    }

    #[test]
    fn asignar_y_liberar_mantiene_el_contador() {
        let mut job = Job::new("j1", "default", "fn", 3);

        assert!(job.assign(0, "p1.default"));
        assert!(job.assign(2, "p1.default"));
        assert!(!job.assign(2, "p2.default"));
        assert_eq!(job.assigned_tasks(), 2);
        assert_eq!(job.owned_count(), 2);
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.task(0).unwrap().state(), TaskState::Alloc);

        job.release(0, TaskState::Unassigned);
        job.release(0, TaskState::Unassigned);
        assert_eq!(job.assigned_tasks(), 1);
        assert_eq!(job.owned_count(), 1);
        assert_eq!(job.unassigned_ids().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn completar_dos_veces_registra_una_sola_vez() {
        let mut job = Job::new("j1", "default", "fn", 2);

        assert!(job.complete_task(1));
        job.mark_saved();
        assert!(!job.complete_task(1));
        assert!(!job.need_to_save());
        assert_eq!(job.completed_tasks().len(), 1);

        assert!(job.complete_task(0));
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn record_restaura_completadas_y_checkpoints() {
        let mut job = Job::new("j1", "prod", "fn", 3);
        job.update_state(JobState::Stopping);
        job.complete_task(2);
        job.task_mut(0).unwrap().checkpoint = Some(json!("offset-7"));

        let restored = Job::from_record(job.to_record());

        assert_eq!(restored.state(), JobState::Suspended);
        assert_eq!(restored.task(2).unwrap().state(), TaskState::Completed);
        assert_eq!(restored.task(0).unwrap().checkpoint, Some(json!("offset-7")));
        assert_eq!(restored.unassigned_ids().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(restored.live_tasks(), 2);
    }

    #[test]
    fn rebuild_recrea_las_tareas() {
        let mut job = Job::new("j1", "default", "fn", 2);
        job.complete_task(0);
        job.update_state(JobState::Suspended);
        job.set_pending(PendingChange::Redefine(5));

        job.rebuild(5);

        assert_eq!(job.total_tasks, 5);
        assert_eq!(job.live_tasks(), 5);
        assert_eq!(job.state(), JobState::Running);
        assert!(job.pending().is_none());
        assert!(job.need_to_save());
    }
}
