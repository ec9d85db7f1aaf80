use chrono::{DateTime, Utc};
use common::{JobState, TaskId};
use glob::glob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::{DealerError, DealerResult};

/// Lo que se persiste de un job: lo necesario para retomar tras un reinicio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub name: String,
    pub namespace: String,
    pub function: String,
    #[serde(default)]
    pub version: String,
    pub total_tasks: usize,
    #[serde(default)]
    pub max_task_allocation: Option<usize>,
    pub state: JobState,
    #[serde(default)]
    pub completed_tasks: Vec<TaskId>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub checkpoints: Vec<TaskCheckpoint>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub id: TaskId,
    pub checkpoint: serde_json::Value,
    #[serde(default)]
    pub progress: f64,
}

/// Persistencia de jobs. Se consulta al arrancar y se escribe cuando un job
/// reporta checkpoints o completa tareas.
pub trait JobStore: Send {
    fn save_job(&self, record: &JobRecord) -> DealerResult<()>;

    /// Jobs de un namespace; namespace vacío devuelve todos
    fn load_jobs(&self, namespace: &str) -> DealerResult<Vec<JobRecord>>;

    fn delete_job(&self, namespace: &str, name: &str) -> DealerResult<()>;
}

/// Un archivo JSON por job: `{dir}/{namespace}.{job}.json`
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(dir: impl Into<PathBuf>) -> DealerResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn job_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.json", namespace, name))
    }

    fn read_record(path: &Path) -> DealerResult<JobRecord> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

impl JobStore for FileJobStore {
    fn save_job(&self, record: &JobRecord) -> DealerResult<()> {
        let path = self.job_path(&record.namespace, &record.name);
        let tmp = path.with_extension("json.tmp");

        // escribimos en un temporal y renombramos para no dejar archivos a medias
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        debug!(job = %record.name, path = %path.display(), "job guardado");
        Ok(())
    }

    fn load_jobs(&self, namespace: &str) -> DealerResult<Vec<JobRecord>> {
        let prefix = if namespace.is_empty() { "*" } else { namespace };
        let pattern = format!("{}/{}.*.json", self.dir.display(), prefix);
        let paths = glob(&pattern).map_err(|e| DealerError::Store(e.to_string()))?;

        let mut records = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, "no se pudo leer una entrada del store");
                    continue;
                }
            };
            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "registro de job inválido, se ignora"),
            }
        }
        records.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(records)
    }

    fn delete_job(&self, namespace: &str, name: &str) -> DealerResult<()> {
        let path = self.job_path(namespace, name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Store en memoria: se usa cuando no hay directorio configurado y en los tests.
/// Los clones comparten el mismo contenido.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    records: Arc<Mutex<BTreeMap<String, JobRecord>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<JobRecord> {
        self.lock_records()
            .ok()?
            .get(&format!("{}.{}", namespace, name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_records().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hace fallar las escrituras siguientes (para probar reintentos)
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_writes.lock() {
            *flag = fail;
        }
    }

    fn lock_records(
        &self,
    ) -> DealerResult<std::sync::MutexGuard<'_, BTreeMap<String, JobRecord>>> {
        self.records
            .lock()
            .map_err(|_| DealerError::Store("lock memory store".to_string()))
    }
}

impl JobStore for MemoryJobStore {
    fn save_job(&self, record: &JobRecord) -> DealerResult<()> {
        if self.fail_writes.lock().map(|f| *f).unwrap_or(false) {
            return Err(DealerError::Store("writes disabled".to_string()));
        }
        self.lock_records()?.insert(
            format!("{}.{}", record.namespace, record.name),
            record.clone(),
        );
        Ok(())
    }

    fn load_jobs(&self, namespace: &str) -> DealerResult<Vec<JobRecord>> {
        Ok(self
            .lock_records()?
            .values()
            .filter(|r| namespace.is_empty() || r.namespace == namespace)
            .cloned()
            .collect())
    }

    fn delete_job(&self, namespace: &str, name: &str) -> DealerResult<()> {
        self.lock_records()?.remove(&format!("{}.{}", namespace, name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::Job;
    use serde_json::json;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("dealer_store_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn record(namespace: &str, name: &str) -> JobRecord {
        let mut job = Job::new(name, namespace, "fn", 3);
        job.complete_task(1);
        job.task_mut(0).unwrap().checkpoint = Some(json!({"offset": 42}));
        job.to_record()
    }

    #[test]
    fn file_store_guarda_y_carga_por_namespace() {
        let dir = temp_dir("por_namespace");
        let store = FileJobStore::new(&dir).unwrap();

        store.save_job(&record("prod", "b")).unwrap();
        store.save_job(&record("prod", "a")).unwrap();
        store.save_job(&record("dev", "c")).unwrap();

        let prod = store.load_jobs("prod").unwrap();
        let names: Vec<_> = prod.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(prod[0].completed_tasks, vec![1]);
        assert_eq!(prod[0].checkpoints[0].checkpoint, json!({"offset": 42}));

        assert_eq!(store.load_jobs("").unwrap().len(), 3);
    }

    #[test]
    fn file_store_ignora_archivos_corruptos_y_borra() {
        let dir = temp_dir("corruptos");
        let store = FileJobStore::new(&dir).unwrap();

        store.save_job(&record("prod", "ok")).unwrap();
        fs::write(dir.join("prod.roto.json"), b"{no es json").unwrap();

        assert_eq!(store.load_jobs("prod").unwrap().len(), 1);

        store.delete_job("prod", "ok").unwrap();
        store.delete_job("prod", "no-existe").unwrap();
        assert!(store.load_jobs("prod").unwrap().is_empty());
    }

    #[test]
    fn memory_store_puede_simular_fallos() {
        let store = MemoryJobStore::new();
        store.fail_writes(true);
        assert!(store.save_job(&record("prod", "a")).is_err());
        assert!(store.is_empty());

        store.fail_writes(false);
        store.save_job(&record("prod", "a")).unwrap();
        assert_eq!(store.get("prod", "a").unwrap().total_tasks, 3);
    }
}
