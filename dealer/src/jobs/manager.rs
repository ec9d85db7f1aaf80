use chrono::Utc;
use common::{
    deployment_key, namespace_or_default, process_key, DeploymentSpec, JobRequest,
    ProcessMessage, ProcessState,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::deployment::{Deployment, JobRemoval, ProcessMap, ReportOutcome};
use super::job::{Job, JobMap};
use super::process::Process;
use super::request::{Request, RequestMessage, Response};
use super::store::JobStore;
use crate::config::ManagerContextConfig;
use crate::error::{DealerError, DealerResult};
use crate::push::{LoopbackTransport, PushClient, PushResponse, Transport};

/// Handle para hablar con el manager. Se clona libremente; cada pedido
/// espera su respuesta por un oneshot.
#[derive(Clone)]
pub struct ManagerContext {
    requests: mpsc::Sender<RequestMessage>,
}

impl ManagerContext {
    pub async fn submit_req(&self, request: Request) -> DealerResult<Response> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(RequestMessage { request, reply })
            .await
            .map_err(|_| DealerError::ManagerStopped)?;
        rx.await.map_err(|_| DealerError::ManagerStopped)?
    }
}

/// Dueño único del estado del scheduler: deployments, procesos y store.
/// Atiende pedidos y respuestas de push de a uno desde una sola tarea.
pub struct JobManager {
    deployments: BTreeMap<String, Deployment>,
    processes: ProcessMap,
    store: Box<dyn JobStore>,
    push: PushClient,
    responses: Option<mpsc::Receiver<PushResponse>>,
    config: ManagerContextConfig,
}

impl JobManager {
    pub fn new(
        config: ManagerContextConfig,
        store: Box<dyn JobStore>,
        remote: Arc<dyn Transport>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.response_queue.max(1));
        let loopback: Arc<dyn Transport> = Arc::new(LoopbackTransport::new(config.loopback_delay));
        let push = PushClient::new(remote, loopback, tx, config.disable_push);
        Self {
            deployments: BTreeMap::new(),
            processes: ProcessMap::new(),
            store,
            push,
            responses: Some(rx),
            config,
        }
    }

    /// Lanza la tarea del manager. Termina cuando se sueltan todos los `ManagerContext`.
    pub fn start(self) -> (ManagerContext, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.request_queue.max(1));
        let handle = tokio::spawn(self.run(rx));
        (ManagerContext { requests: tx }, handle)
    }

    async fn run(mut self, mut requests: mpsc::Receiver<RequestMessage>) {
        let Some(mut responses) = self.responses.take() else {
            error!("el manager ya fue iniciado");
            return;
        };
        // lo que quedó pendiente del arranque
        self.after_message();
        info!("manager iniciado");

        loop {
            tokio::select! {
                msg = requests.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },
                Some(resp) = responses.recv() => self.handle_push_response(resp),
            }
            self.after_message();
        }
        info!("manager detenido");
    }

    fn after_message(&mut self) {
        self.save_jobs();
        self.flush_pushes();
        if cfg!(debug_assertions) {
            self.check_invariants();
        }
    }

    fn handle_message(&mut self, msg: RequestMessage) {
        let kind = msg.request.kind();
        let result = self.handle_request(msg.request);
        match &result {
            Ok(_) => debug!(request = kind, "pedido atendido"),
            Err(e) => debug!(request = kind, error = %e, "pedido con error"),
        }
        if msg.reply.send(result).is_err() {
            debug!(request = kind, "el que pidió ya no espera la respuesta");
        }
    }

    pub fn handle_request(&mut self, request: Request) -> DealerResult<Response> {
        match request {
            Request::JobGet { namespace, name } => {
                let (_, job) = self.find_job(&namespace, &name)?;
                Ok(Response::Job(job.info()))
            }
            Request::JobList { namespace } => Ok(Response::Jobs(
                self.deployments
                    .values()
                    .filter(|d| namespace.is_empty() || d.namespace == namespace)
                    .flat_map(|d| d.jobs().values().map(Job::info))
                    .collect(),
            )),
            Request::JobCreate(req) => self.create_job(req),
            Request::JobUpdate(req) => self.update_job(req),
            Request::JobDel { namespace, name } => self.delete_job(&namespace, &name),

            Request::ProcGet { namespace, name } => {
                let key = process_key(&name, &namespace);
                let process = self
                    .processes
                    .get(&key)
                    .ok_or_else(|| DealerError::NotFound(format!("proceso {}", key)))?;
                Ok(Response::Process(self.process_state(process)))
            }
            Request::ProcList { namespace } => Ok(Response::Processes(
                self.processes
                    .values()
                    .filter(|p| namespace.is_empty() || p.namespace == namespace)
                    .map(|p| self.process_state(p))
                    .collect(),
            )),
            Request::ProcCreate(msg) => {
                if msg.name.is_empty() {
                    return Err(DealerError::InvalidRequest("el proceso no tiene nombre".into()));
                }
                if self.processes.contains_key(&msg.key()) {
                    return Err(DealerError::InvalidRequest(format!(
                        "proceso {} ya existe",
                        msg.key()
                    )));
                }
                let key = self.attach_process(&msg);
                self.report(&key, &msg, false, true);
                self.rebalance_process_deployment(&key);
                self.process_response(&key)
            }
            Request::ProcUpdate(msg) => self.process_pull(msg),
            Request::ProcUpdateState {
                namespace,
                name,
                state,
            } => self.update_process_state(&process_key(&name, &namespace), state),
            Request::ProcDel { namespace, name } => {
                let key = process_key(&name, &namespace);
                if !self.processes.contains_key(&key) {
                    return Err(DealerError::NotFound(format!("proceso {}", key)));
                }
                self.evict_process(&key);
                Ok(Response::Done)
            }
            Request::ProcHealth => {
                self.health_sweep();
                Ok(Response::Done)
            }

            Request::DeployUpdate(spec) => {
                if spec.function.is_empty() {
                    return Err(DealerError::InvalidRequest(
                        "el deployment no tiene función".into(),
                    ));
                }
                let key = self.update_deployment(&spec);
                self.rebalance_new_deps(&[key.clone()]);
                self.deployment_response(&key)
            }
            Request::DeployRemove {
                namespace,
                function,
                version,
            } => {
                let key = deployment_key(&namespace, &function, &version);
                let dep = self
                    .deployments
                    .get_mut(&key)
                    .ok_or_else(|| DealerError::NotFound(format!("deployment {}", key)))?;
                dep.remove(&mut self.processes);
                Ok(Response::Done)
            }
            Request::DeployList { namespace } => Ok(Response::Deployments(
                self.deployments
                    .values()
                    .filter(|d| namespace.is_empty() || d.namespace == namespace)
                    .map(|d| d.info(&self.processes))
                    .collect(),
            )),

            Request::PodUpdate(msg) => self.update_pod(msg),
            Request::PodRemove { namespace, name } => {
                self.evict_process(&process_key(&name, &namespace));
                Ok(Response::Done)
            }
        }
    }

    /// Respuesta de un push: el proceso informa el estado de sus tareas
    pub fn handle_push_response(&mut self, resp: PushResponse) {
        debug!(process = %resp.process, emulated = resp.emulated, ok = resp.result.is_ok(), "respuesta de push");
        let body = match resp.result {
            Ok(body) => body,
            Err(e) => {
                warn!(process = %resp.process, error = %e, "push sin respuesta, el barrido de salud decidirá");
                return;
            }
        };
        if body.is_empty() {
            return;
        }
        let msg: ProcessMessage = match serde_json::from_slice(&body) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(process = %resp.process, error = %e, "respuesta de push ilegible");
                return;
            }
        };
        let Some(process) = self.processes.get_mut(&resp.process) else {
            debug!(process = %resp.process, "respuesta de un proceso que ya no existe");
            return;
        };
        process.update_from_report(&msg);
        let key = resp.process;
        self.report(&key, &msg, false, false);
        self.finish_draining(&key);
    }

    // ---- jobs ----

    fn find_job(&self, namespace: &str, name: &str) -> DealerResult<(&Deployment, &Job)> {
        let namespace = namespace_or_default(namespace);
        self.deployments
            .values()
            .filter(|d| d.namespace == namespace)
            .find_map(|d| d.job(name).map(|j| (d, j)))
            .ok_or_else(|| DealerError::NotFound(format!("job {}/{}", namespace, name)))
    }

    fn find_job_deployment(&self, namespace: &str, name: &str) -> DealerResult<String> {
        self.find_job(namespace, name).map(|(d, _)| d.key())
    }

    fn create_job(&mut self, mut req: JobRequest) -> DealerResult<Response> {
        if req.name.is_empty() || req.function.is_empty() {
            return Err(DealerError::InvalidRequest(
                "el job necesita nombre y función".into(),
            ));
        }
        if req.total_tasks == 0 {
            return Err(DealerError::InvalidRequest(
                "el job necesita al menos una tarea".into(),
            ));
        }
        req.namespace = namespace_or_default(&req.namespace).to_string();
        if self.find_job(&req.namespace, &req.name).is_ok() {
            return Err(DealerError::InvalidRequest(format!(
                "job {}/{} ya existe",
                req.namespace, req.name
            )));
        }

        let dep_key = match self.find_deployment_for(&req.namespace, &req.function, &req.version) {
            Some(key) => key,
            None => self.update_deployment(&DeploymentSpec {
                namespace: req.namespace.clone(),
                function: req.function.clone(),
                version: req.version.clone(),
                ..Default::default()
            }),
        };
        let dep = self
            .deployments
            .get_mut(&dep_key)
            .ok_or_else(|| DealerError::NotFound(format!("deployment {}", dep_key)))?;
        dep.add_job(Job::from_request(&req))?;
        self.rebalance_new_deps(&[dep_key]);

        let (_, job) = self.find_job(&req.namespace, &req.name)?;
        Ok(Response::Job(job.info()))
    }

    fn update_job(&mut self, req: JobRequest) -> DealerResult<Response> {
        let dep_key = self.find_job_deployment(&req.namespace, &req.name)?;
        let Some(dep) = self.deployments.get_mut(&dep_key) else {
            return Err(DealerError::NotFound(format!("deployment {}", dep_key)));
        };
        let Some(job) = dep.jobs_mut().get_mut(&req.name) else {
            return Err(DealerError::NotFound(format!("job {}", req.name)));
        };
        if req.max_task_allocation.is_some() {
            job.max_task_allocation = req.max_task_allocation;
        }
        if req.metadata.is_some() {
            job.metadata = req.metadata.clone();
            job.mark_dirty();
        }
        let redefine = req.total_tasks > 0 && req.total_tasks != job.total_tasks;

        if redefine {
            dep.redefine_job(&req.name, req.total_tasks, &mut self.processes);
        } else {
            dep.resume_job(&req.name)?;
        }
        self.rebalance_new_deps(&[dep_key]);

        let (_, job) = self.find_job(&req.namespace, &req.name)?;
        Ok(Response::Job(job.info()))
    }

    fn delete_job(&mut self, namespace: &str, name: &str) -> DealerResult<Response> {
        let dep_key = self.find_job_deployment(namespace, name)?;
        let Some(dep) = self.deployments.get_mut(&dep_key) else {
            return Err(DealerError::NotFound(format!("deployment {}", dep_key)));
        };
        let ns = dep.namespace.clone();
        if dep.delete_job(name, &mut self.processes)? == JobRemoval::Removed {
            self.delete_job_records(&ns, &[name.to_string()]);
        }
        Ok(Response::Done)
    }

    // ---- procesos ----

    fn process_state(&self, process: &Process) -> ProcessMessage {
        let empty = JobMap::new();
        let jobs = process
            .deployment()
            .and_then(|k| self.deployments.get(k))
            .map(Deployment::jobs)
            .unwrap_or(&empty);
        process.get_process_state(jobs)
    }

    fn process_response(&self, key: &str) -> DealerResult<Response> {
        self.processes
            .get(key)
            .map(|p| Response::Process(self.process_state(p)))
            .ok_or_else(|| DealerError::NotFound(format!("proceso {}", key)))
    }

    fn deployment_response(&self, key: &str) -> DealerResult<Response> {
        self.deployments
            .get(key)
            .map(|d| Response::Deployment(d.info(&self.processes)))
            .ok_or_else(|| DealerError::NotFound(format!("deployment {}", key)))
    }

    /// Deployment de una función: la versión exacta si existe, si no
    /// cualquiera de la misma función (primero los activos).
    fn find_deployment_for(&self, namespace: &str, function: &str, version: &str) -> Option<String> {
        let exact = deployment_key(namespace, function, version);
        if self.deployments.contains_key(&exact) {
            return Some(exact);
        }
        let namespace = namespace_or_default(namespace);
        let mut candidates: Vec<&Deployment> = self
            .deployments
            .values()
            .filter(|d| d.namespace == namespace && d.function == function)
            .collect();
        candidates.sort_by_key(|d| !d.is_active());
        candidates.first().map(|d| d.key())
    }

    /// Registra un proceso nuevo y lo asocia a su deployment si lo hay
    fn attach_process(&mut self, msg: &ProcessMessage) -> String {
        let key = msg.key();
        let dep_key = self.find_deployment_for(msg.namespace(), &msg.function, &msg.version);
        if dep_key.is_none() {
            warn!(process = %key, function = %msg.function, "proceso sin deployment, queda sin tareas");
        }
        let mut process = Process::new(msg);
        process.set_deployment(dep_key);
        info!(process = %key, state = %process.state, "proceso registrado");
        self.processes.insert(key.clone(), process);
        key
    }

    /// Aplica el reporte de un proceso sobre su deployment y borra los
    /// registros de los jobs que terminaron de drenar
    fn report(&mut self, key: &str, msg: &ProcessMessage, is_request: bool, is_init: bool) -> ReportOutcome {
        let Some(dep_key) = self
            .processes
            .get(key)
            .and_then(|p| p.deployment().map(str::to_string))
        else {
            return ReportOutcome::default();
        };
        let Some(dep) = self.deployments.get_mut(&dep_key) else {
            warn!(process = %key, deployment = %dep_key, "deployment del proceso inexistente");
            return ReportOutcome::default();
        };
        let ns = dep.namespace.clone();
        let out = dep.apply_process_report(key, &mut self.processes, msg, is_request, is_init);
        self.delete_job_records(&ns, &out.deleted_jobs);
        out
    }

    /// Pull del proceso: reporta, recibe trabajo y se lleva su estado en la respuesta
    fn process_pull(&mut self, msg: ProcessMessage) -> DealerResult<Response> {
        if msg.name.is_empty() {
            return Err(DealerError::InvalidRequest("el proceso no tiene nombre".into()));
        }
        let key = msg.key();
        let is_init = match self.processes.get_mut(&key) {
            Some(process) => {
                process.update_from_report(&msg);
                false
            }
            None => {
                self.attach_process(&msg);
                true
            }
        };
        let out = self.report(&key, &msg, true, is_init);
        debug!(process = %key, allocated = out.allocated, rebalanced = out.rebalanced, "pull atendido");
        self.finish_draining(&key);

        let response = self.process_response(&key);
        // la respuesta REST ya lleva el estado deseado
        if let Some(p) = self.processes.get_mut(&key) {
            p.cancel_push();
        }
        response
    }

    fn update_process_state(&mut self, key: &str, state: ProcessState) -> DealerResult<Response> {
        let process = self
            .processes
            .get_mut(key)
            .ok_or_else(|| DealerError::NotFound(format!("proceso {}", key)))?;
        let previous = process.state;
        process.state = state;
        process.last_update = Utc::now();
        info!(process = %key, from = %previous, to = %state, "cambio de estado de proceso");

        match state {
            ProcessState::Deleted => {
                let dep_key = process.deployment().map(str::to_string);
                let drained = match dep_key.and_then(|k| self.deployments.get_mut(&k)) {
                    Some(dep) => match self.processes.get_mut(key) {
                        Some(p) => !p.clear_tasks(dep.jobs_mut()),
                        None => true,
                    },
                    None => true,
                };
                if drained {
                    self.evict_process(key);
                    return Ok(Response::Done);
                }
            }
            ProcessState::Failed => {
                self.evict_process(key);
                return Ok(Response::Done);
            }
            ProcessState::Ready if previous != ProcessState::Ready => {
                self.rebalance_process_deployment(key);
            }
            _ => {}
        }
        self.process_response(key)
    }

    /// Pod visto en el cluster: alta o actualización
    fn update_pod(&mut self, msg: ProcessMessage) -> DealerResult<Response> {
        if msg.name.is_empty() {
            return Err(DealerError::InvalidRequest("el pod no tiene nombre".into()));
        }
        let key = msg.key();
        let was_ready = match self.processes.get_mut(&key) {
            Some(process) => {
                let was_ready = process.is_ready();
                process.update_from_pod(&msg);
                was_ready
            }
            None => {
                self.attach_process(&msg);
                self.report(&key, &msg, false, true);
                false
            }
        };
        let is_ready = self.processes.get(&key).is_some_and(Process::is_ready);
        if is_ready && !was_ready {
            self.rebalance_process_deployment(&key);
        }
        if self.processes.get(&key).map(|p| p.state) == Some(ProcessState::Failed) {
            self.evict_process(&key);
            return Ok(Response::Done);
        }
        self.process_response(&key)
    }

    /// Baja forzada: las tareas vuelven al pool y el deployment rebalancea
    fn evict_process(&mut self, key: &str) {
        let dep_key = self
            .processes
            .get(key)
            .and_then(|p| p.deployment().map(str::to_string));
        match dep_key.and_then(|k| self.deployments.get_mut(&k)) {
            Some(dep) => {
                let ns = dep.namespace.clone();
                let deleted = dep.evict_process(key, &mut self.processes);
                self.delete_job_records(&ns, &deleted);
            }
            None => {
                if self.processes.remove(key).is_some() {
                    info!(process = %key, "proceso sin deployment removido");
                }
            }
        }
    }

    /// Un proceso en baja ordenada que ya soltó todo se quita del mapa
    fn finish_draining(&mut self, key: &str) {
        let drained = self
            .processes
            .get(key)
            .is_some_and(|p| p.state == ProcessState::Deleted && p.task_count() == 0);
        if drained {
            self.evict_process(key);
        }
    }

    fn rebalance_process_deployment(&mut self, key: &str) {
        if let Some(dep_key) = self
            .processes
            .get(key)
            .and_then(|p| p.deployment().map(str::to_string))
        {
            self.rebalance_new_deps(&[dep_key]);
        }
    }

    /// Desaloja los procesos que dejaron de reportar. Los emulados (sin IP)
    /// no reportan por su cuenta y no se barren.
    pub fn health_sweep(&mut self) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.config.process_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = Utc::now();
        let stale: Vec<String> = self
            .processes
            .iter()
            .filter(|(_, p)| !p.ip.is_empty() && now - p.last_update > timeout)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            warn!(process = %key, "proceso sin reportes, se desaloja");
            self.evict_process(key);
        }
        stale
    }

    // ---- deployments y arranque ----

    /// Crea o actualiza un deployment y le asocia los procesos sueltos de la
    /// misma función. Devuelve su clave.
    pub fn update_deployment(&mut self, spec: &DeploymentSpec) -> String {
        let key = spec.key();
        match self.deployments.get_mut(&key) {
            Some(dep) => dep.update(spec, &mut self.processes),
            None => {
                let mut dep = Deployment::new(spec);
                dep.update(spec, &mut self.processes);
                info!(deployment = %key, replicas = spec.replicas, jobs = spec.jobs.len(), "deployment nuevo");
                self.deployments.insert(key.clone(), dep);
            }
        }

        let namespace = namespace_or_default(&spec.namespace);
        for p in self.processes.values_mut() {
            if p.deployment().is_none() && p.namespace == namespace && p.function == spec.function {
                debug!(process = %p.name, deployment = %key, "proceso asociado al deployment");
                p.set_deployment(Some(key.clone()));
                p.set_removing_tasks(false);
            }
        }
        key
    }

    /// Carga los jobs persistidos. Un job que ya existe (creado por el
    /// deployment) se reemplaza por el registro, salvo que haya cambiado
    /// su cantidad de tareas.
    pub fn init_jobs(&mut self, namespace: &str) -> usize {
        let records = match self.store.load_jobs(namespace) {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "no se pudieron cargar los jobs");
                return 0;
            }
        };

        let mut loaded = 0;
        for record in records {
            let dep_key = match self.find_deployment_for(&record.namespace, &record.function, &record.version) {
                Some(key) => key,
                None => {
                    let dep = Deployment::detached(&record.namespace, &record.function, &record.version);
                    let key = dep.key();
                    self.deployments.insert(key.clone(), dep);
                    key
                }
            };
            let Some(dep) = self.deployments.get_mut(&dep_key) else {
                continue;
            };
            let name = record.name.clone();
            let mut job = Job::from_record(record);
            if let Some(current) = dep.job(&name) {
                if current.assigned_tasks() > 0 {
                    warn!(job = %name, "job con tareas asignadas, se ignora el registro");
                    continue;
                }
                if current.total_tasks != job.total_tasks {
                    let total = current.total_tasks;
                    info!(job = %name, old = job.total_tasks, new = total, "el deployment cambió la cantidad de tareas");
                    job.rebuild(total);
                }
            }
            debug!(job = %name, deployment = %dep_key, state = %job.state(), "job cargado");
            dep.jobs_mut().insert(name, job);
            loaded += 1;
        }
        info!(loaded, "jobs cargados del store");
        loaded
    }

    /// Registra los pods existentes y adopta las tareas que reportan
    pub fn init_processes(&mut self, pods: &[ProcessMessage]) -> usize {
        let mut count = 0;
        for msg in pods {
            if msg.name.is_empty() || self.processes.contains_key(&msg.key()) {
                continue;
            }
            let key = self.attach_process(msg);
            let out = self.report(&key, msg, false, true);
            if out.updates.rejected > 0 {
                warn!(process = %key, rejected = out.updates.rejected, "tareas del pod no adoptadas");
            }
            count += 1;
        }
        info!(processes = count, "procesos iniciales registrados");
        count
    }

    pub fn rebalance_new_deps(&mut self, keys: &[String]) {
        for key in keys {
            let Some(dep) = self.deployments.get_mut(key) else {
                continue;
            };
            if !dep.is_active() {
                continue;
            }
            let ns = dep.namespace.clone();
            let deleted = dep.rebalance(&mut self.processes);
            self.delete_job_records(&ns, &deleted);
        }
    }

    pub fn deployment_keys(&self) -> Vec<String> {
        self.deployments.keys().cloned().collect()
    }

    // ---- persistencia y push ----

    /// Guarda los jobs marcados. Si falla, quedan marcados para el próximo intento.
    pub fn save_jobs(&mut self) {
        for dep in self.deployments.values_mut() {
            for job in dep.jobs_mut().values_mut() {
                if !job.need_to_save() {
                    continue;
                }
                match self.store.save_job(&job.to_record()) {
                    Ok(()) => job.mark_saved(),
                    Err(e) => warn!(job = %job.name, error = %e, "no se pudo guardar el job"),
                }
            }
        }
    }

    fn delete_job_records(&self, namespace: &str, names: &[String]) {
        for name in names {
            if let Err(e) = self.store.delete_job(namespace, name) {
                warn!(job = %name, error = %e, "no se pudo borrar el registro del job");
            }
        }
    }

    /// Envía el estado deseado a cada proceso que lo tenga pendiente
    pub fn flush_pushes(&mut self) {
        let empty = JobMap::new();
        for process in self.processes.values_mut().filter(|p| p.push_pending()) {
            let jobs = process
                .deployment()
                .and_then(|k| self.deployments.get(k))
                .map(Deployment::jobs)
                .unwrap_or(&empty);
            if let Err(e) = process.push_updates(jobs, &self.push) {
                error!(process = %process.name, error = %e, "no se pudo armar el push");
            }
        }
    }

    /// Verifica los contadores y las referencias cruzadas; sólo loguea
    pub fn check_invariants(&self) -> bool {
        let mut ok = true;
        let mut seen = BTreeSet::new();
        for (key, process) in &self.processes {
            let Some(dep) = process.deployment().and_then(|k| self.deployments.get(k)) else {
                if process.task_count() > 0 {
                    error!(process = %key, "proceso con tareas y sin deployment");
                    ok = false;
                }
                continue;
            };
            for name in process.job_names() {
                for &id in process.task_ids(name) {
                    let owned = dep
                        .job(name)
                        .and_then(|j| j.task(id))
                        .is_some_and(|t| t.is_owned_by(key));
                    if !owned || !seen.insert((dep.key(), name.to_string(), id)) {
                        error!(process = %key, job = %name, task = id, "referencia de tarea inconsistente");
                        ok = false;
                    }
                }
            }
        }
        for dep in self.deployments.values() {
            for job in dep.jobs().values() {
                let owned = job.tasks().iter().filter(|t| t.is_assigned()).count();
                if owned != job.assigned_tasks() {
                    error!(job = %job.name, owned, assigned = job.assigned_tasks(), "contador de tareas asignadas desincronizado");
                    ok = false;
                }
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::MemoryJobStore;
    use common::{DeploymentJob, JobShort, JobState, TaskMessage, TaskState};
    use std::time::Duration;

    fn config() -> ManagerContextConfig {
        ManagerContextConfig {
            disable_push: true,
            loopback_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn manager(store: &MemoryJobStore) -> JobManager {
        JobManager::new(
            config(),
            Box::new(store.clone()),
            Arc::new(LoopbackTransport::default()),
        )
    }

    fn spec(job: &str, total: usize) -> DeploymentSpec {
        let mut spec = DeploymentSpec {
            namespace: "default".into(),
            function: "fn".into(),
            replicas: 2,
            ..Default::default()
        };
        spec.jobs.insert(
            job.into(),
            DeploymentJob {
                total_tasks: total,
                ..Default::default()
            },
        );
        spec
    }

    fn pod(name: &str) -> ProcessMessage {
        ProcessMessage {
            name: name.into(),
            namespace: "default".into(),
            function: "fn".into(),
            state: ProcessState::Ready,
            ..Default::default()
        }
    }

    #[test]
    fn pull_de_proceso_nuevo_lo_registra_y_le_da_tareas() {
        let store = MemoryJobStore::new();
        let mut mgr = manager(&store);
        mgr.update_deployment(&spec("j", 4));

        let resp = mgr
            .handle_request(Request::ProcUpdate(pod("p1")))
            .unwrap()
            .into_process()
            .unwrap();

        let tasks = &resp.jobs["j"].tasks;
        assert_eq!(tasks.len(), 4);
        assert!(tasks.iter().all(|t| t.state == TaskState::Alloc));
        // el estado ya viaja en la respuesta
        assert!(!mgr.processes["p1.default"].push_pending());
        assert!(mgr.check_invariants());
    }

    #[test]
    fn job_inexistente_da_not_found() {
        let store = MemoryJobStore::new();
        let mut mgr = manager(&store);

        let err = mgr
            .handle_request(Request::JobGet {
                namespace: "default".into(),
                name: "nada".into(),
            })
            .unwrap_err();
        assert!(matches!(err, DealerError::NotFound(_)));

        let err = mgr
            .handle_request(Request::JobCreate(JobRequest {
                name: "x".into(),
                function: "fn".into(),
                total_tasks: 0,
                ..Default::default()
            }))
            .unwrap_err();
        assert!(matches!(err, DealerError::InvalidRequest(_)));
    }

    #[test]
    fn completadas_se_guardan_y_un_fallo_reintenta() {
        let store = MemoryJobStore::new();
        let mut mgr = manager(&store);
        mgr.update_deployment(&spec("j", 2));
        mgr.handle_request(Request::ProcUpdate(pod("p1"))).unwrap();
        mgr.save_jobs();

        let mut report = pod("p1");
        report.jobs.insert(
            "j".into(),
            JobShort {
                tasks: vec![
                    TaskMessage { id: 0, state: TaskState::Completed, ..Default::default() },
                    TaskMessage { id: 1, state: TaskState::Running, ..Default::default() },
                ],
                ..Default::default()
            },
        );
        store.fail_writes(true);
        mgr.handle_request(Request::ProcUpdate(report)).unwrap();
        mgr.save_jobs();
        assert!(store.get("default", "j").unwrap().completed_tasks.is_empty());

        store.fail_writes(false);
        mgr.save_jobs();
        assert_eq!(store.get("default", "j").unwrap().completed_tasks, vec![0]);
    }

    #[test]
    fn arranque_recupera_jobs_y_adopta_tareas_de_los_pods() {
        let store = MemoryJobStore::new();
        {
            let mut job = Job::new("j", "default", "fn", 3);
            job.update_state(JobState::Stopping);
            job.complete_task(2);
            store.save_job(&job.to_record()).unwrap();
        }
        let mut mgr = manager(&store);
        mgr.update_deployment(&spec("j", 3));
        assert_eq!(mgr.init_jobs(""), 1);

        let mut p1 = pod("p1");
        p1.jobs.insert(
            "j".into(),
            JobShort {
                tasks: vec![TaskMessage { id: 1, state: TaskState::Running, ..Default::default() }],
                ..Default::default()
            },
        );
        assert_eq!(mgr.init_processes(&[p1]), 1);
        mgr.rebalance_new_deps(&mgr.deployment_keys());

        let job = mgr
            .handle_request(Request::JobGet { namespace: "default".into(), name: "j".into() })
            .unwrap()
            .into_job()
            .unwrap();
        // estaba drenando al caer: queda suspendido hasta que lo reanuden
        assert_eq!(job.state, JobState::Suspended);
        assert_eq!(job.completed_tasks, vec![2]);
        assert_eq!(job.tasks[1].process, "p1.default");
        assert_eq!(job.assigned_tasks, 1);

        mgr.handle_request(Request::JobUpdate(JobRequest {
            name: "j".into(),
            namespace: "default".into(),
            function: "fn".into(),
            ..Default::default()
        }))
        .unwrap();
        let job = mgr.find_job("default", "j").unwrap().1;
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.assigned_tasks(), 2);
        assert!(mgr.check_invariants());
    }

    #[test]
    fn barrido_desaloja_procesos_viejos() {
        let store = MemoryJobStore::new();
        let mut mgr = JobManager::new(
            ManagerContextConfig {
                process_timeout: Duration::ZERO,
                ..config()
            },
            Box::new(store.clone()),
            Arc::new(LoopbackTransport::default()),
        );
        mgr.update_deployment(&spec("j", 2));
        let mut remote = pod("p1");
        remote.ip = "10.0.0.1".into();
        mgr.handle_request(Request::ProcUpdate(remote)).unwrap();
        mgr.handle_request(Request::ProcUpdate(pod("local"))).unwrap();
        mgr.processes.get_mut("p1.default").unwrap().last_update = Utc::now() - chrono::Duration::seconds(5);

        assert_eq!(mgr.health_sweep(), vec!["p1.default".to_string()]);
        assert!(!mgr.processes.contains_key("p1.default"));
        // el local se queda con todo tras el rebalanceo
        let job = mgr.find_job("default", "j").unwrap().1;
        assert_eq!(job.assigned_tasks(), 2);
        assert!(mgr.check_invariants());
    }

    #[test]
    fn estado_deleted_drena_y_luego_remueve() {
        let store = MemoryJobStore::new();
        let mut mgr = manager(&store);
        mgr.update_deployment(&spec("j", 2));
        mgr.handle_request(Request::ProcUpdate(pod("p1"))).unwrap();

        mgr.handle_request(Request::ProcUpdateState {
            namespace: "default".into(),
            name: "p1".into(),
            state: ProcessState::Deleted,
        })
        .unwrap();
        assert!(mgr.processes["p1.default"].push_pending());

        mgr.flush_pushes();
        let resp = mgr.responses.as_mut().unwrap().try_recv().unwrap();
        mgr.handle_push_response(resp);

        assert!(!mgr.processes.contains_key("p1.default"));
        assert_eq!(mgr.find_job("default", "j").unwrap().1.assigned_tasks(), 0);
    }

    #[test]
    fn la_respuesta_del_proceso_no_revierte_la_baja() {
        let store = MemoryJobStore::new();
        let mut mgr = manager(&store);
        mgr.update_deployment(&spec("j", 2));
        mgr.handle_request(Request::ProcUpdate(pod("p1"))).unwrap();
        mgr.handle_request(Request::ProcUpdateState {
            namespace: "default".into(),
            name: "p1".into(),
            state: ProcessState::Deleted,
        })
        .unwrap();

        // un worker real contesta siempre `ready`
        let mut reply = pod("p1");
        reply.jobs.insert(
            "j".into(),
            JobShort {
                total_tasks: 2,
                tasks: (0..2)
                    .map(|id| TaskMessage {
                        id,
                        state: TaskState::Deleted,
                        ..Default::default()
                    })
                    .collect(),
                metadata: None,
            },
        );
        mgr.handle_push_response(PushResponse {
            process: "p1.default".into(),
            result: Ok(serde_json::to_vec(&reply).unwrap()),
            emulated: false,
        });

        assert!(!mgr.processes.contains_key("p1.default"));
        assert_eq!(mgr.find_job("default", "j").unwrap().1.assigned_tasks(), 0);
        assert!(mgr.check_invariants());
    }

    #[test]
    fn el_pull_no_pisa_el_estado_del_pod() {
        let store = MemoryJobStore::new();
        let mut mgr = manager(&store);
        mgr.update_deployment(&spec("j", 2));
        let mut not_ready = pod("p1");
        not_ready.state = ProcessState::NotReady;
        mgr.handle_request(Request::PodUpdate(not_ready)).unwrap();

        let resp = mgr
            .handle_request(Request::ProcUpdate(pod("p1")))
            .unwrap()
            .into_process()
            .unwrap();

        assert_eq!(mgr.processes["p1.default"].state, ProcessState::NotReady);
        assert_eq!(resp.task_count(), 0);

        // el pod vuelve a estar listo y recibe trabajo
        mgr.handle_request(Request::PodUpdate(pod("p1"))).unwrap();
        assert_eq!(mgr.processes["p1.default"].task_count(), 2);
    }

    #[tokio::test]
    async fn el_contexto_serializa_los_pedidos() {
        let store = MemoryJobStore::new();
        let mgr = manager(&store);
        let (ctx, handle) = mgr.start();

        ctx.submit_req(Request::DeployUpdate(spec("j", 4))).await.unwrap();
        let procs = ctx
            .submit_req(Request::ProcList { namespace: String::new() })
            .await
            .unwrap()
            .into_processes()
            .unwrap();
        assert!(procs.is_empty());

        let list = ctx
            .submit_req(Request::JobList { namespace: "default".into() })
            .await
            .unwrap()
            .into_jobs()
            .unwrap();
        assert_eq!(list.len(), 1);

        drop(ctx);
        handle.await.unwrap();
    }
}
