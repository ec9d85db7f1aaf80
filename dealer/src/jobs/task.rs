use chrono::{DateTime, Utc};
use common::{TaskId, TaskMessage, TaskState};
use std::time::Duration;

/// Unidad mínima de trabajo de un job.
///
/// El dueño estructural es siempre el `Job`; `process` es sólo la clave del
/// proceso que la tiene asignada y únicamente el job la modifica, así el
/// contador de tareas asignadas nunca se desincroniza.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    state: TaskState,
    process: Option<String>,
    pub last_update: DateTime<Utc>,
    pub checkpoint: Option<serde_json::Value>,
    pub progress: f64,
    pub delay: Duration,
}

impl Task {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Unassigned,
            process: None,
            last_update: Utc::now(),
            checkpoint: None,
            progress: 0.0,
            delay: Duration::ZERO,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    /// Clave del proceso dueño, si la tarea está asignada
    pub fn process(&self) -> Option<&str> {
        self.process.as_deref()
    }

    pub(super) fn set_process(&mut self, process: Option<String>) {
        self.process = process;
    }

    pub fn is_assigned(&self) -> bool {
        self.process.is_some()
    }

    /// Asignada y no en proceso de detenerse
    pub fn is_active(&self) -> bool {
        self.is_assigned() && self.state != TaskState::Stopping
    }

    pub fn is_owned_by(&self, process: &str) -> bool {
        self.process.as_deref() == Some(process)
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }

    /// Copia los datos de avance reportados por el proceso.
    /// Un checkpoint ausente no borra el último conocido.
    pub(crate) fn apply_report(&mut self, msg: &TaskMessage) {
        self.touch();
        if msg.checkpoint.is_some() {
            self.checkpoint = msg.checkpoint.clone();
        }
        if let Some(progress) = msg.progress {
            self.progress = progress;
        }
        if let Some(delay) = msg.delay {
            self.delay = Duration::from_millis(delay);
        }
    }

    pub fn to_message(&self) -> TaskMessage {
        TaskMessage {
            id: self.id,
            state: self.state,
            checkpoint: self.checkpoint.clone(),
            progress: Some(self.progress),
            delay: Some(self.delay.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reporte_sin_checkpoint_conserva_el_anterior() {
        let mut task = Task::new(3);
        task.apply_report(&TaskMessage {
            id: 3,
            state: TaskState::Running,
            checkpoint: Some(json!({"offset": 10})),
            progress: Some(0.5),
            delay: Some(250),
        });
        task.apply_report(&TaskMessage {
            id: 3,
            state: TaskState::Running,
            ..Default::default()
        });

        assert_eq!(task.checkpoint, Some(json!({"offset": 10})));
        assert_eq!(task.progress, 0.5);
        assert_eq!(task.delay, Duration::from_millis(250));
    }

    #[test]
    fn tarea_stopping_no_cuenta_como_activa() {
        let mut task = Task::new(0);
        assert!(!task.is_active());

        task.set_process(Some("p1.default".to_string()));
        task.set_state(TaskState::Running);
        assert!(task.is_active());
        assert!(task.is_owned_by("p1.default"));

        task.set_state(TaskState::Stopping);
        assert!(task.is_assigned());
        assert!(!task.is_active());
    }
}
