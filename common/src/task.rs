use serde::{Deserialize, Serialize};
use std::fmt;

pub type TaskId = usize;

/// Estado de una tarea, igual en el dealer y en el mensaje que viaja al proceso.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Unassigned,
    Alloc,
    Running,
    Stopping,
    Completed,
    Deleted,
    /// Valor desconocido reportado por un proceso (se loguea y se ignora)
    #[serde(other)]
    Unknown,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Unassigned => "unassigned",
            TaskState::Alloc => "alloc",
            TaskState::Running => "running",
            TaskState::Stopping => "stopping",
            TaskState::Completed => "completed",
            TaskState::Deleted => "deleted",
            TaskState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estado de una tarea tal como lo intercambian dealer y proceso.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub id: TaskId,
    #[serde(default)]
    pub state: TaskState,

    /// Marca opaca de progreso, se persiste para poder retomar la tarea
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,

    /// Retraso reportado por el proceso, en milisegundos
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}
