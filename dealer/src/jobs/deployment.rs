use common::{
    deployment_key, namespace_or_default, DeploymentInfo, DeploymentSpec, JobState,
    ProcessMessage,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::job::{Job, JobMap, PendingChange};
pub use super::process::ProcessMap;
use super::process::TaskUpdates;
use crate::error::{DealerError, DealerResult};

/// Qué pasó con un job al pedir su baja
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRemoval {
    /// No tenía tareas asignadas y se quitó en el acto
    Removed,
    /// Se pidió detener sus tareas; se quita cuando termine de drenar
    Draining,
}

/// Resultado de aplicar el reporte de un proceso sobre el deployment
#[derive(Debug, Clone, Default)]
pub struct ReportOutcome {
    pub updates: TaskUpdates,
    pub allocated: usize,
    pub rebalanced: bool,
    /// Jobs que el rebalanceo terminó de borrar
    pub deleted_jobs: Vec<String>,
}

/// Conjunto de jobs de una versión de función. Es la unidad de escalado:
/// asigna y rebalancea tareas entre sus procesos listos.
///
/// Los procesos viven en el mapa del manager; un proceso pertenece al
/// deployment cuya clave tiene en `Process::deployment`.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub namespace: String,
    pub function: String,
    pub version: String,
    pub desired_replicas: usize,
    jobs: JobMap,
    active: bool,
}

impl Deployment {
    pub fn new(spec: &DeploymentSpec) -> Self {
        Self {
            namespace: namespace_or_default(&spec.namespace).to_string(),
            function: spec.function.clone(),
            version: spec.version.clone(),
            desired_replicas: spec.replicas,
            jobs: JobMap::new(),
            active: true,
        }
    }

    /// Deployment inactivo que guarda jobs persistidos hasta que el cluster
    /// lo vuelva a mostrar
    pub fn detached(namespace: &str, function: &str, version: &str) -> Self {
        Self {
            namespace: namespace_or_default(namespace).to_string(),
            function: function.to_string(),
            version: version.to_string(),
            desired_replicas: 0,
            jobs: JobMap::new(),
            active: false,
        }
    }

    pub fn key(&self) -> String {
        deployment_key(&self.namespace, &self.function, &self.version)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn jobs(&self) -> &JobMap {
        &self.jobs
    }

    pub(crate) fn jobs_mut(&mut self) -> &mut JobMap {
        &mut self.jobs
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.get(name)
    }

    /// Claves de los procesos que pertenecen a este deployment
    pub fn process_keys(&self, procs: &ProcessMap) -> Vec<String> {
        let key = self.key();
        procs
            .iter()
            .filter(|(_, p)| p.deployment() == Some(key.as_str()))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn ready_keys(&self, procs: &ProcessMap) -> Vec<String> {
        let key = self.key();
        procs
            .iter()
            .filter(|(_, p)| p.deployment() == Some(key.as_str()) && p.is_ready())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Mezcla el descriptor observado: réplicas y jobs. Crea los jobs que
    /// faltan, redefine los que cambiaron de tamaño y reanuda los suspendidos.
    pub fn update(&mut self, spec: &DeploymentSpec, procs: &mut ProcessMap) {
        if !self.active {
            info!(deployment = %self.key(), "deployment reactivado");
        }
        self.active = true;
        self.desired_replicas = spec.replicas;

        for (name, desc) in &spec.jobs {
            match self.jobs.get_mut(name) {
                None => {
                    let mut job = Job::new(name, &self.namespace, &self.function, desc.total_tasks);
                    job.version = self.version.clone();
                    job.max_task_allocation = desc.max_task_allocation;
                    job.metadata = desc.metadata.clone();
                    job.mark_dirty();
                    info!(deployment = %self.key(), job = %name, tasks = desc.total_tasks, "job nuevo");
                    self.jobs.insert(name.clone(), job);
                }
                Some(job) => {
                    job.max_task_allocation = desc.max_task_allocation;
                    if desc.metadata.is_some() {
                        job.metadata = desc.metadata.clone();
                    }
                    if job.total_tasks != desc.total_tasks {
                        self.redefine_job(name, desc.total_tasks, procs);
                    } else if job.state() == JobState::Suspended && job.pending().is_none() {
                        job.update_state(JobState::Running);
                    }
                }
            }
        }
    }

    pub fn add_job(&mut self, mut job: Job) -> DealerResult<()> {
        if self.jobs.contains_key(&job.name) {
            return Err(DealerError::InvalidRequest(format!(
                "job {} ya existe en {}",
                job.name,
                self.key()
            )));
        }
        job.namespace = self.namespace.clone();
        job.function = self.function.clone();
        if job.version.is_empty() {
            job.version = self.version.clone();
        }
        job.mark_dirty();
        info!(deployment = %self.key(), job = %job.name, tasks = job.total_tasks, "job agregado");
        self.jobs.insert(job.name.clone(), job);
        Ok(())
    }

    /// Reanuda un job suspendido que no tiene cambios pendientes
    pub fn resume_job(&mut self, name: &str) -> DealerResult<()> {
        let job = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| DealerError::NotFound(format!("job {}", name)))?;
        if job.state() == JobState::Suspended && job.pending().is_none() {
            job.update_state(JobState::Running);
        }
        Ok(())
    }

    /// Cambia la cantidad de tareas de un job. Si tiene tareas asignadas
    /// primero las detiene y el cambio se aplica cuando quede suspendido.
    pub fn redefine_job(&mut self, name: &str, total_tasks: usize, procs: &mut ProcessMap) {
        let Some(job) = self.jobs.get_mut(name) else {
            return;
        };
        if job.assigned_tasks() == 0 {
            job.rebuild(total_tasks);
            return;
        }
        info!(job = %name, total_tasks, "job redefinido, drenando tareas");
        job.update_state(JobState::Stopping);
        job.set_pending(PendingChange::Redefine(total_tasks));
        drain_job(job, procs);
    }

    pub fn delete_job(&mut self, name: &str, procs: &mut ProcessMap) -> DealerResult<JobRemoval> {
        let job = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| DealerError::NotFound(format!("job {}", name)))?;
        if job.assigned_tasks() == 0 {
            self.jobs.remove(name);
            info!(deployment = %self.key(), job = %name, "job borrado");
            return Ok(JobRemoval::Removed);
        }
        job.update_state(JobState::Stopping);
        job.set_pending(PendingChange::Delete);
        drain_job(job, procs);
        info!(deployment = %self.key(), job = %name, "job en stopping, esperando que drenen las tareas");
        Ok(JobRemoval::Draining)
    }

    /// Aplica borrados y redefiniciones de los jobs que ya drenaron.
    /// Devuelve los jobs borrados.
    pub fn apply_pending_changes(&mut self) -> Vec<String> {
        let ready: Vec<(String, PendingChange)> = self
            .jobs
            .values()
            .filter(|j| j.state() == JobState::Suspended && j.assigned_tasks() == 0)
            .filter_map(|j| j.pending().map(|change| (j.name.clone(), change)))
            .collect();

        let mut deleted = Vec::new();
        for (name, change) in ready {
            match change {
                PendingChange::Delete => {
                    self.jobs.remove(&name);
                    info!(deployment = %self.key(), job = %name, "job drenado y borrado");
                    deleted.push(name);
                }
                PendingChange::Redefine(total) => {
                    if let Some(job) = self.jobs.get_mut(&name) {
                        job.rebuild(total);
                    }
                }
            }
        }
        deleted
    }

    /// Asigna tareas libres a un proceso listo que pidió trabajo. Los jobs
    /// se recorren por nombre y cada uno aporta hasta su objetivo por proceso.
    pub fn allocate_tasks(&mut self, key: &str, procs: &mut ProcessMap) -> usize {
        let ready = self.ready_keys(procs).len().max(1);
        let Some(process) = procs.get_mut(key) else {
            return 0;
        };
        if !process.is_ready() || process.removing_tasks() {
            return 0;
        }

        let mut allocated = 0;
        for job in self.jobs.values_mut() {
            if !job.is_schedulable() {
                continue;
            }
            let mut target = job.live_tasks().div_ceil(ready);
            if let Some(max) = job.max_task_allocation {
                target = target.min(max);
            }
            let want = target
                .saturating_sub(process.job_tasks_len(job, true))
                .min(process.free_capacity());
            if want == 0 {
                continue;
            }
            let ids: Vec<_> = job.unassigned_ids().take(want).collect();
            if ids.is_empty() {
                continue;
            }
            debug!(process = %key, job = %job.name, target, ids = ?ids, "asignando tareas");
            process.add_tasks(job, &ids);
            allocated += ids.len();
        }

        if allocated > 0 {
            process.request_push();
            info!(process = %key, allocated, "tareas asignadas al proceso");
        }
        allocated
    }

    /// Reparte las tareas vivas de cada job entre los procesos listos.
    ///
    /// Con `live` tareas y `R` procesos cada uno apunta a `live / R` y los
    /// `live % R` más cargados a uno más. Los que se pasan detienen el
    /// excedente y las tareas libres van al menos cargado que esté por
    /// debajo de su objetivo. No espera a nadie: lo que se detiene vuelve
    /// al pool cuando el proceso lo confirma y dispara otro rebalanceo.
    pub fn rebalance(&mut self, procs: &mut ProcessMap) -> Vec<String> {
        let deleted = self.apply_pending_changes();
        let ready = self.ready_keys(procs);
        if ready.is_empty() {
            debug!(deployment = %self.key(), "rebalanceo sin procesos listos");
            return deleted;
        }
        let r = ready.len();
        let mut receivers = BTreeSet::new();

        for job in self.jobs.values_mut() {
            if !job.is_schedulable() {
                continue;
            }
            let live = job.live_tasks();
            let (base, extra) = (live / r, live % r);

            let mut order: Vec<(String, usize)> = ready
                .iter()
                .map(|k| (k.clone(), procs[k].job_tasks_len(job, true)))
                .collect();
            order.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

            let mut targets = BTreeMap::new();
            for (i, (k, _)) in order.iter().enumerate() {
                let mut target = base + usize::from(i < extra);
                if let Some(max) = job.max_task_allocation {
                    target = target.min(max);
                }
                targets.insert(k.clone(), target);
            }

            for (k, have) in &order {
                let target = targets[k];
                if *have > target {
                    if let Some(p) = procs.get_mut(k) {
                        let stopped = p.stop_job_tasks(job, have - target);
                        debug!(process = %k, job = %job.name, have, target, stopped, "deteniendo excedente");
                    }
                }
            }

            loop {
                let next = job.unassigned_ids().next();
                let Some(id) = next else {
                    break;
                };
                let candidate = ready
                    .iter()
                    .filter(|k| {
                        let p = &procs[*k];
                        !p.removing_tasks() && p.has_capacity() && p.job_tasks_len(job, true) < targets[*k]
                    })
                    .min_by_key(|k| {
                        let p = &procs[*k];
                        (p.job_tasks_len(job, true), p.task_count(), (*k).clone())
                    })
                    .cloned();
                let Some(k) = candidate else {
                    break;
                };
                if let Some(p) = procs.get_mut(&k) {
                    p.add_tasks(job, &[id]);
                }
                receivers.insert(k);
            }
        }

        for k in receivers {
            if let Some(p) = procs.get_mut(&k) {
                p.request_push();
            }
        }
        info!(deployment = %self.key(), processes = r, "rebalanceo terminado");
        deleted
    }

    /// Aplica un reporte del proceso y sus consecuencias: asignación si es
    /// un pull, y rebalanceo si volvieron tareas al pool.
    pub fn apply_process_report(
        &mut self,
        key: &str,
        procs: &mut ProcessMap,
        msg: &ProcessMessage,
        is_request: bool,
        is_init: bool,
    ) -> ReportOutcome {
        let Some(process) = procs.get_mut(key) else {
            warn!(process = %key, "reporte de un proceso desconocido");
            return ReportOutcome::default();
        };
        let updates = process.handle_task_updates(&mut self.jobs, msg, is_init);
        let was_removing = process.removing_tasks();
        // sigue soltando tareas mientras reporte alguna en stopping
        process.set_removing_tasks(updates.tasks_stopping);
        if updates.rejected > 0 {
            warn!(process = %key, rejected = updates.rejected, "tareas del reporte descartadas");
        }

        let mut out = ReportOutcome {
            updates: updates.clone(),
            ..Default::default()
        };
        if is_request && !was_removing && !updates.tasks_stopping {
            out.allocated = self.allocate_tasks(key, procs);
        }
        if updates.needs_rebalance() {
            out.deleted_jobs = self.rebalance(procs);
            out.rebalanced = true;
        }
        out
    }

    /// Baja forzada de un proceso: sus tareas vuelven al pool, se saca del
    /// mapa y se rebalancea. Devuelve los jobs borrados por el rebalanceo.
    pub fn evict_process(&mut self, key: &str, procs: &mut ProcessMap) -> Vec<String> {
        let Some(mut process) = procs.remove(key) else {
            return Vec::new();
        };
        process.remove(&mut self.jobs);
        info!(deployment = %self.key(), process = %key, "proceso desalojado");
        self.rebalance(procs)
    }

    /// El deployment desapareció del cluster: se sueltan los procesos y se
    /// conservan los jobs para cuando vuelva.
    pub fn remove(&mut self, procs: &mut ProcessMap) {
        for key in self.process_keys(procs) {
            if let Some(p) = procs.get_mut(&key) {
                p.remove(&mut self.jobs);
                p.clear_all();
            }
        }
        self.active = false;
        info!(deployment = %self.key(), "deployment removido, jobs conservados");
    }

    pub fn info(&self, procs: &ProcessMap) -> DeploymentInfo {
        DeploymentInfo {
            namespace: self.namespace.clone(),
            function: self.function.clone(),
            version: self.version.clone(),
            replicas: self.desired_replicas,
            active: self.active,
            jobs: self.jobs.keys().cloned().collect(),
            processes: self.process_keys(procs),
        }
    }
}

/// Pide detener las tareas del job en todos los procesos que las tienen
fn drain_job(job: &mut Job, procs: &mut ProcessMap) {
    let owners: BTreeSet<String> = job
        .tasks()
        .iter()
        .filter_map(|t| t.process().map(str::to_string))
        .collect();
    for owner in owners {
        match procs.get_mut(&owner) {
            Some(p) => {
                p.clear_job_tasks(job);
            }
            None => warn!(job = %job.name, process = %owner, "dueño de tareas inexistente"),
        }
    }
}
