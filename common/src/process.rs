use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::task::TaskMessage;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_PROCESS_PORT: u16 = 8077;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Ready,
    NotReady,
    Failed,
    Deleted,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Unknown => "unknown",
            ProcessState::Ready => "ready",
            ProcessState::NotReady => "notready",
            ProcessState::Failed => "failed",
            ProcessState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Mensaje que intercambian dealer y proceso: push, pull y respuestas REST.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMessage {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub function: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub state: ProcessState,

    /// Capacidad máxima de tareas que acepta el proceso (None = sin tope)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tasks: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dealer_url: Option<String>,

    #[serde(default)]
    pub jobs: BTreeMap<String, JobShort>,
}

impl ProcessMessage {
    pub fn key(&self) -> String {
        process_key(&self.name, &self.namespace)
    }

    pub fn namespace(&self) -> &str {
        namespace_or_default(&self.namespace)
    }

    /// Cantidad total de tareas reportadas en el mensaje
    pub fn task_count(&self) -> usize {
        self.jobs.values().map(|j| j.tasks.len()).sum()
    }
}

/// Tareas de un job dentro de un `ProcessMessage`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobShort {
    #[serde(default)]
    pub total_tasks: usize,
    #[serde(default)]
    pub tasks: Vec<TaskMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

pub fn namespace_or_default(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

/// Clave única de un proceso: `nombre.namespace`
pub fn process_key(name: &str, namespace: &str) -> String {
    format!("{}.{}", name, namespace_or_default(namespace))
}
