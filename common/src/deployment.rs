use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::process::namespace_or_default;

/// Descriptor de un deployment observado en el cluster (o cargado del snapshot).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    #[serde(default)]
    pub namespace: String,
    pub function: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub replicas: usize,
    #[serde(default)]
    pub jobs: BTreeMap<String, DeploymentJob>,
}

impl DeploymentSpec {
    pub fn key(&self) -> String {
        deployment_key(&self.namespace, &self.function, &self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentJob {
    pub total_tasks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_task_allocation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Vista de un deployment para la API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentInfo {
    pub namespace: String,
    pub function: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub replicas: usize,
    pub active: bool,
    pub jobs: Vec<String>,
    pub processes: Vec<String>,
}

/// `namespace/function` o `namespace/function:version`
pub fn deployment_key(namespace: &str, function: &str, version: &str) -> String {
    let namespace = namespace_or_default(namespace);
    if version.is_empty() {
        format!("{}/{}", namespace, function)
    } else {
        format!("{}/{}:{}", namespace, function, version)
    }
}
