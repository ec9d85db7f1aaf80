//! Envío de estado deseado a los procesos.
//!
//! Cada push corre en su propia tarea de tokio y la respuesta vuelve al
//! manager por un canal; el manager nunca espera la red.

use common::{ProcessMessage, TaskState};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Un envío pendiente hacia un proceso
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub need_response: bool,
    /// Clave del proceso destino
    pub process: String,
}

impl PushRequest {
    pub fn post(process: String, url: String, body: Vec<u8>) -> Self {
        Self {
            url,
            body,
            need_response: true,
            process,
        }
    }
}

/// Respuesta (o error de transporte) de un push
#[derive(Debug, Clone)]
pub struct PushResponse {
    pub process: String,
    pub result: Result<Vec<u8>, String>,
    /// La respuesta la generó el emulador local
    pub emulated: bool,
}

pub trait Transport: Send + Sync {
    /// Lanza el envío y publica la respuesta en `responses`. No bloquea.
    fn send(&self, request: PushRequest, responses: mpsc::Sender<PushResponse>);
}

/// Transporte HTTP real
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "no se pudo configurar el cliente http, se usa el default");
                Client::new()
            });
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: PushRequest, responses: mpsc::Sender<PushResponse>) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let PushRequest {
                url,
                body,
                need_response,
                process,
            } = request;
            let result = match client
                .post(&url)
                .header("content-type", "application/json")
                .body(body)
                .send()
                .await
                .and_then(|resp| resp.error_for_status())
            {
                Ok(resp) => resp.bytes().await.map(|b| b.to_vec()).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            if let Err(e) = &result {
                warn!(process = %process, url = %url, error = %e, "push fallido");
            }
            if !need_response {
                return;
            }
            let resp = PushResponse {
                process,
                result,
                emulated: false,
            };
            if responses.send(resp).await.is_err() {
                debug!("canal de respuestas cerrado, se descarta la respuesta del push");
            }
        });
    }
}

/// Emula un proceso que acepta todo lo que se le pide: las tareas en
/// `Stopping` pasan a `Deleted` y el resto a `Running`.
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    delay: Duration,
}

impl LoopbackTransport {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn emulate(msg: &ProcessMessage) -> ProcessMessage {
        let mut reply = msg.clone();
        for job in reply.jobs.values_mut() {
            for task in &mut job.tasks {
                task.state = match task.state {
                    TaskState::Stopping => TaskState::Deleted,
                    _ => TaskState::Running,
                };
            }
        }
        reply
    }

    fn reply(request: &PushRequest) -> PushResponse {
        let result = serde_json::from_slice::<ProcessMessage>(&request.body)
            .map(|msg| Self::emulate(&msg))
            .and_then(|reply| serde_json::to_vec(&reply))
            .map_err(|e| e.to_string());
        PushResponse {
            process: request.process.clone(),
            result,
            emulated: true,
        }
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, request: PushRequest, responses: mpsc::Sender<PushResponse>) {
        let resp = Self::reply(&request);
        if self.delay.is_zero() {
            if let Err(e) = responses.try_send(resp) {
                warn!(process = %request.process, error = %e, "no se pudo encolar la respuesta emulada");
            }
            return;
        }
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if responses.send(resp).await.is_err() {
                debug!("canal de respuestas cerrado, se descarta la respuesta emulada");
            }
        });
    }
}

/// Punto único de salida de pushes del manager
#[derive(Clone)]
pub struct PushClient {
    remote: Arc<dyn Transport>,
    loopback: Arc<dyn Transport>,
    responses: mpsc::Sender<PushResponse>,
    disable_push: bool,
}

impl PushClient {
    pub fn new(
        remote: Arc<dyn Transport>,
        loopback: Arc<dyn Transport>,
        responses: mpsc::Sender<PushResponse>,
        disable_push: bool,
    ) -> Self {
        Self {
            remote,
            loopback,
            responses,
            disable_push,
        }
    }

    pub fn push_disabled(&self) -> bool {
        self.disable_push
    }

    pub fn submit(&self, request: PushRequest) {
        debug!(process = %request.process, url = %request.url, "push");
        self.remote.send(request, self.responses.clone());
    }

    pub fn submit_local(&self, request: PushRequest) {
        debug!(process = %request.process, "push emulado");
        self.loopback.send(request, self.responses.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{JobShort, TaskMessage};

    fn message() -> ProcessMessage {
        let mut msg = ProcessMessage {
            name: "p1".to_string(),
            ..Default::default()
        };
        msg.jobs.insert(
            "j".to_string(),
            JobShort {
                total_tasks: 3,
                tasks: vec![
                    TaskMessage { id: 0, state: TaskState::Alloc, ..Default::default() },
                    TaskMessage { id: 1, state: TaskState::Stopping, ..Default::default() },
                    TaskMessage { id: 2, state: TaskState::Running, ..Default::default() },
                ],
                metadata: None,
            },
        );
        msg
    }

    #[test]
    fn emulador_borra_las_stopping_y_corre_el_resto() {
        let reply = LoopbackTransport::emulate(&message());
        let states: Vec<_> = reply.jobs["j"].tasks.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![TaskState::Running, TaskState::Deleted, TaskState::Running]
        );
    }

    #[tokio::test]
    async fn loopback_responde_por_el_canal() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = PushClient::new(
            Arc::new(LoopbackTransport::default()),
            Arc::new(LoopbackTransport::new(Duration::from_millis(5))),
            tx,
            true,
        );
        let body = serde_json::to_vec(&message()).unwrap();

        client.submit_local(PushRequest::post("p1.default".into(), String::new(), body));

        let resp = rx.recv().await.unwrap();
        assert!(resp.emulated);
        assert_eq!(resp.process, "p1.default");
        let reply: ProcessMessage = serde_json::from_slice(&resp.result.unwrap()).unwrap();
        assert_eq!(reply.jobs["j"].tasks[1].state, TaskState::Deleted);
    }

    #[tokio::test]
    async fn cuerpo_invalido_devuelve_error() {
        let (tx, mut rx) = mpsc::channel(1);
        LoopbackTransport::default().send(
            PushRequest::post("p1.default".into(), String::new(), b"nope".to_vec()),
            tx,
        );
        assert!(rx.recv().await.unwrap().result.is_err());
    }

    #[tokio::test]
    async fn loopback_con_canal_cerrado_no_falla() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let body = serde_json::to_vec(&message()).unwrap();
        LoopbackTransport::new(Duration::from_millis(1))
            .send(PushRequest::post("p1.default".into(), String::new(), body), tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
