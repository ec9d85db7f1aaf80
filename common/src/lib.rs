pub mod deployment;
pub mod job;
pub mod process;
pub mod task;

use serde::{Deserialize, Serialize};

pub use deployment::{deployment_key, DeploymentInfo, DeploymentJob, DeploymentSpec};
pub use job::{JobInfo, JobRequest, JobState, JobTaskInfo};
pub use process::{
    namespace_or_default, process_key, JobShort, ProcessMessage, ProcessState,
    DEFAULT_NAMESPACE, DEFAULT_PROCESS_PORT,
};
pub use task::{TaskId, TaskMessage, TaskState};

/// Cuerpo de error que devuelve la API REST del dealer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub status: u16,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn estado_desconocido_no_rompe_el_mensaje() {
        let msg: ProcessMessage = serde_json::from_value(json!({
            "name": "p1",
            "state": "ready",
            "jobs": {
                "j1": {"totalTasks": 2, "tasks": [
                    {"id": 0, "state": "running"},
                    {"id": 1, "state": "exploded"}
                ]}
            }
        }))
        .unwrap();

        let tasks = &msg.jobs["j1"].tasks;
        assert_eq!(tasks[0].state, TaskState::Running);
        assert_eq!(tasks[1].state, TaskState::Unknown);
        assert_eq!(msg.state, ProcessState::Ready);
        assert_eq!(msg.task_count(), 2);
    }

    #[test]
    fn estado_de_proceso_desconocido_decodifica_unknown() {
        let msg: ProcessMessage =
            serde_json::from_value(json!({"name": "p1", "state": "evaporated"})).unwrap();
        assert_eq!(msg.state, ProcessState::Unknown);
        assert_eq!(ProcessState::default(), ProcessState::Unknown);
        let failed: ProcessState = serde_json::from_value(json!("failed")).unwrap();
        assert_eq!(failed, ProcessState::Failed);
    }

    #[test]
    fn namespace_vacio_usa_default() {
        assert_eq!(process_key("p1", ""), "p1.default");
        assert_eq!(process_key("p1", "prod"), "p1.prod");
        assert_eq!(deployment_key("", "fn", ""), "default/fn");
        assert_eq!(deployment_key("prod", "fn", "2"), "prod/fn:2");
    }

    #[test]
    fn mensaje_usa_camel_case() {
        let mut msg = ProcessMessage {
            name: "p1".to_string(),
            max_tasks: Some(3),
            ..Default::default()
        };
        msg.jobs.insert(
            "j1".to_string(),
            JobShort {
                total_tasks: 4,
                tasks: vec![TaskMessage {
                    id: 2,
                    state: TaskState::Stopping,
                    delay: Some(15),
                    ..Default::default()
                }],
                metadata: None,
            },
        );

        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["maxTasks"], json!(3));
        assert_eq!(v["jobs"]["j1"]["totalTasks"], json!(4));
        assert_eq!(v["jobs"]["j1"]["tasks"][0]["state"], json!("stopping"));
        assert_eq!(v["jobs"]["j1"]["tasks"][0]["delay"], json!(15));
        assert!(v["jobs"]["j1"]["tasks"][0].get("checkpoint").is_none());
    }
}
