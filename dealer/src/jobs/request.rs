use common::{
    DeploymentInfo, DeploymentSpec, JobInfo, JobRequest, ProcessMessage, ProcessState,
};
use std::fmt;
use tokio::sync::oneshot;

use crate::error::{DealerError, DealerResult};

/// Operaciones que atiende el manager, una a la vez
#[derive(Debug, Clone)]
pub enum Request {
    JobGet { namespace: String, name: String },
    JobDel { namespace: String, name: String },
    JobList { namespace: String },
    JobCreate(JobRequest),
    /// Reanuda el job o cambia su cantidad de tareas
    JobUpdate(JobRequest),

    ProcGet { namespace: String, name: String },
    ProcDel { namespace: String, name: String },
    ProcList { namespace: String },
    ProcCreate(ProcessMessage),
    /// Pull: el proceso reporta sus tareas y pide trabajo
    ProcUpdate(ProcessMessage),
    ProcUpdateState {
        namespace: String,
        name: String,
        state: ProcessState,
    },
    /// Barrido de procesos que dejaron de reportar
    ProcHealth,

    DeployUpdate(DeploymentSpec),
    DeployRemove {
        namespace: String,
        function: String,
        version: String,
    },
    DeployList { namespace: String },

    /// Pod observado en el cluster
    PodUpdate(ProcessMessage),
    PodRemove { namespace: String, name: String },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::JobGet { .. } => "jobGet",
            Request::JobDel { .. } => "jobDel",
            Request::JobList { .. } => "jobList",
            Request::JobCreate(_) => "jobCreate",
            Request::JobUpdate(_) => "jobUpdate",
            Request::ProcGet { .. } => "procGet",
            Request::ProcDel { .. } => "procDel",
            Request::ProcList { .. } => "procList",
            Request::ProcCreate(_) => "procCreate",
            Request::ProcUpdate(_) => "procUpdate",
            Request::ProcUpdateState { .. } => "procUpdateState",
            Request::ProcHealth => "procHealth",
            Request::DeployUpdate(_) => "deployUpdate",
            Request::DeployRemove { .. } => "deployRemove",
            Request::DeployList { .. } => "deployList",
            Request::PodUpdate(_) => "podUpdate",
            Request::PodRemove { .. } => "podRemove",
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    Job(JobInfo),
    Jobs(Vec<JobInfo>),
    Process(ProcessMessage),
    Processes(Vec<ProcessMessage>),
    Deployment(DeploymentInfo),
    Deployments(Vec<DeploymentInfo>),
    Done,
}

fn unexpected(resp: &Response) -> DealerError {
    DealerError::InvalidRequest(format!("respuesta inesperada del manager: {:?}", resp))
}

impl Response {
    pub fn into_job(self) -> DealerResult<JobInfo> {
        match self {
            Response::Job(job) => Ok(job),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_jobs(self) -> DealerResult<Vec<JobInfo>> {
        match self {
            Response::Jobs(jobs) => Ok(jobs),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_process(self) -> DealerResult<ProcessMessage> {
        match self {
            Response::Process(p) => Ok(p),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_processes(self) -> DealerResult<Vec<ProcessMessage>> {
        match self {
            Response::Processes(list) => Ok(list),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_deployment(self) -> DealerResult<DeploymentInfo> {
        match self {
            Response::Deployment(d) => Ok(d),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_deployments(self) -> DealerResult<Vec<DeploymentInfo>> {
        match self {
            Response::Deployments(list) => Ok(list),
            other => Err(unexpected(&other)),
        }
    }
}

/// Pedido encolado con el canal por donde vuelve la respuesta
#[derive(Debug)]
pub struct RequestMessage {
    pub request: Request,
    pub reply: oneshot::Sender<DealerResult<Response>>,
}
