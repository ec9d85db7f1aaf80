use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Json, Router,
};
use common::{
    namespace_or_default, ApiError, DeploymentInfo, DeploymentSpec, JobInfo, JobRequest,
    ProcessMessage, ProcessState,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::{DealerError, DealerResult};
use crate::jobs::{ManagerContext, Request};

#[derive(Clone)]
pub struct AppState {
    pub manager: ManagerContext,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs/:namespace", get(list_jobs).post(create_job))
        .route(
            "/jobs/:namespace/:job",
            get(get_job).put(update_job).delete(delete_job),
        )
        .route("/processes/:namespace", get(list_processes).post(create_process))
        .route(
            "/processes/:namespace/:proc",
            get(get_process).put(pull_process).delete(delete_process),
        )
        .route("/processes/:namespace/:proc/state", put(update_process_state))
        .route("/deployments/:namespace", get(list_deployments).post(update_deployment))
        .route(
            "/deployments/:namespace/:function",
            delete(remove_deployment),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

impl IntoResponse for DealerError {
    fn into_response(self) -> Response {
        let status = match &self {
            DealerError::NotFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DealerError::InvalidRequest(_) | DealerError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "error atendiendo pedido");
        }
        let body = ApiError {
            status: status.as_u16(),
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> DealerResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| DealerError::InvalidRequest(e.body_text()))
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn list_jobs(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> DealerResult<Json<Vec<JobInfo>>> {
    let jobs = state
        .manager
        .submit_req(Request::JobList { namespace })
        .await?
        .into_jobs()?;
    Ok(Json(jobs))
}

async fn create_job(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> DealerResult<(StatusCode, Json<JobInfo>)> {
    let mut req = body(payload)?;
    req.namespace = namespace;
    let job = state
        .manager
        .submit_req(Request::JobCreate(req))
        .await?
        .into_job()?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> DealerResult<Json<JobInfo>> {
    let job = state
        .manager
        .submit_req(Request::JobGet { namespace, name })
        .await?
        .into_job()?;
    Ok(Json(job))
}

/// Cuerpo de PUT /jobs: todo opcional; sin `totalTasks` sólo se reanuda
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobPatch {
    #[serde(default)]
    total_tasks: usize,
    #[serde(default)]
    max_task_allocation: Option<usize>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

async fn update_job(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    payload: Result<Json<JobPatch>, JsonRejection>,
) -> DealerResult<Json<JobInfo>> {
    let patch = match payload {
        Err(JsonRejection::MissingJsonContentType(_)) => JobPatch::default(),
        other => body(other)?,
    };
    let req = JobRequest {
        name,
        namespace,
        total_tasks: patch.total_tasks,
        max_task_allocation: patch.max_task_allocation,
        metadata: patch.metadata,
        ..Default::default()
    };
    let job = state
        .manager
        .submit_req(Request::JobUpdate(req))
        .await?
        .into_job()?;
    Ok(Json(job))
}

async fn delete_job(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> DealerResult<StatusCode> {
    state
        .manager
        .submit_req(Request::JobDel { namespace, name })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_processes(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> DealerResult<Json<Vec<ProcessMessage>>> {
    let list = state
        .manager
        .submit_req(Request::ProcList { namespace })
        .await?
        .into_processes()?;
    Ok(Json(list))
}

async fn create_process(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    payload: Result<Json<ProcessMessage>, JsonRejection>,
) -> DealerResult<(StatusCode, Json<ProcessMessage>)> {
    let mut msg = body(payload)?;
    msg.namespace = namespace;
    let process = state
        .manager
        .submit_req(Request::ProcCreate(msg))
        .await?
        .into_process()?;
    Ok((StatusCode::CREATED, Json(process)))
}

async fn get_process(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> DealerResult<Json<ProcessMessage>> {
    let process = state
        .manager
        .submit_req(Request::ProcGet { namespace, name })
        .await?
        .into_process()?;
    Ok(Json(process))
}

/// Pull del proceso: reporta sus tareas y recibe el estado deseado
async fn pull_process(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    payload: Result<Json<ProcessMessage>, JsonRejection>,
) -> DealerResult<Json<ProcessMessage>> {
    let mut msg = body(payload)?;
    msg.name = name;
    msg.namespace = namespace;
    let process = state
        .manager
        .submit_req(Request::ProcUpdate(msg))
        .await?
        .into_process()?;
    Ok(Json(process))
}

async fn delete_process(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> DealerResult<StatusCode> {
    state
        .manager
        .submit_req(Request::ProcDel { namespace, name })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct StateBody {
    state: ProcessState,
}

async fn update_process_state(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    payload: Result<Json<StateBody>, JsonRejection>,
) -> DealerResult<Response> {
    let StateBody { state: new_state } = body(payload)?;
    if new_state == ProcessState::Unknown {
        return Err(DealerError::InvalidRequest("estado de proceso desconocido".into()));
    }
    let resp = state
        .manager
        .submit_req(Request::ProcUpdateState {
            namespace,
            name,
            state: new_state,
        })
        .await?;
    match resp.into_process() {
        Ok(process) => Ok(Json(process).into_response()),
        // el proceso se desalojó
        Err(_) => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn list_deployments(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> DealerResult<Json<Vec<DeploymentInfo>>> {
    let list = state
        .manager
        .submit_req(Request::DeployList { namespace })
        .await?
        .into_deployments()?;
    Ok(Json(list))
}

async fn update_deployment(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    payload: Result<Json<DeploymentSpec>, JsonRejection>,
) -> DealerResult<Json<DeploymentInfo>> {
    let mut spec = body(payload)?;
    spec.namespace = namespace_or_default(&namespace).to_string();
    let dep = state
        .manager
        .submit_req(Request::DeployUpdate(spec))
        .await?
        .into_deployment()?;
    Ok(Json(dep))
}

#[derive(Debug, Default, Deserialize)]
struct VersionQuery {
    #[serde(default)]
    version: String,
}

async fn remove_deployment(
    State(state): State<AppState>,
    Path((namespace, function)): Path<(String, String)>,
    Query(query): Query<VersionQuery>,
) -> DealerResult<StatusCode> {
    state
        .manager
        .submit_req(Request::DeployRemove {
            namespace,
            function,
            version: query.version,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerContextConfig;
    use crate::jobs::{JobManager, MemoryJobStore};
    use crate::push::LoopbackTransport;
    use axum::body::Body;
    use axum::http::{header, Method, Request as HttpRequest};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let manager = JobManager::new(
            ManagerContextConfig {
                disable_push: true,
                loopback_delay: Duration::ZERO,
                ..Default::default()
            },
            Box::new(MemoryJobStore::new()),
            Arc::new(LoopbackTransport::default()),
        );
        let (ctx, _handle) = manager.start();
        build_router(AppState { manager: ctx })
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = HttpRequest::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let resp = app()
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn crear_y_consultar_job() {
        let app = app();

        let (status, job) = call(
            &app,
            Method::POST,
            "/jobs/default",
            Some(json!({"name": "j", "function": "fn", "totalTasks": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(job["state"], json!("created"));

        let (status, job) = call(&app, Method::GET, "/jobs/default/j", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["totalTasks"], json!(3));

        let (status, list) = call(&app, Method::GET, "/jobs/default", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, Method::DELETE, "/jobs/default/j", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn errores_con_cuerpo_status_error() {
        let app = app();

        let (status, err) = call(&app, Method::GET, "/jobs/default/nada", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["status"], json!(422));
        assert!(err["error"].as_str().unwrap().contains("nada"));

        let (status, err) = call(&app, Method::POST, "/jobs/default", Some(json!({"name": 3}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["status"], json!(400));
    }

    #[tokio::test]
    async fn pull_de_un_proceso_recibe_tareas() {
        let app = app();
        let (status, _) = call(
            &app,
            Method::POST,
            "/deployments/default",
            Some(json!({"function": "fn", "replicas": 1, "jobs": {"j": {"totalTasks": 2}}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, proc) = call(
            &app,
            Method::PUT,
            "/processes/default/p1",
            Some(json!({"name": "p1", "function": "fn", "state": "ready"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(proc["jobs"]["j"]["tasks"].as_array().unwrap().len(), 2);

        let (status, deps) = call(&app, Method::GET, "/deployments/default", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deps[0]["processes"], json!(["p1.default"]));

        let (status, _) = call(
            &app,
            Method::PUT,
            "/processes/default/p1/state",
            Some(json!({"state": "failed"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&app, Method::GET, "/processes/default/p1", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
