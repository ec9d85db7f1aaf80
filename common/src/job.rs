use serde::{Deserialize, Serialize};
use std::fmt;

use crate::task::{TaskId, TaskState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Created,
    Running,
    Stopping,
    Suspended,
    Completed,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Created => "created",
            JobState::Running => "running",
            JobState::Stopping => "stopping",
            JobState::Suspended => "suspended",
            JobState::Completed => "completed",
            JobState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Cuerpo para crear o redefinir un job vía REST.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub function: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Cantidad fija de tareas en que se parte el trabajo
    pub total_tasks: usize,

    /// Tope opcional de tareas de este job por proceso
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_task_allocation: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Vista de un job para la API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub name: String,
    pub namespace: String,
    pub function: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub state: JobState,
    pub total_tasks: usize,
    pub assigned_tasks: usize,
    #[serde(default)]
    pub completed_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_task_allocation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub tasks: Vec<JobTaskInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTaskInfo {
    pub id: TaskId,
    pub state: TaskState,
    /// Nombre del proceso dueño, vacío si la tarea no está asignada
    #[serde(default)]
    pub process: String,
    #[serde(default)]
    pub progress: f64,
}
