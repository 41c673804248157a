use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{JobError, Result};
use crate::job::{JobRecord, JobStatus};
use crate::store::KvStore;

pub const DEFAULT_NAMESPACE: &str = "job";

/// Reintentos ante una escritura concurrente sobre el mismo registro.
const MAX_UPDATE_ATTEMPTS: usize = 8;

/// Persistencia de `JobRecord` sobre el store compartido.
///
/// El registro vive en `{ns}:{job_id}` y el flag de cancelación en
/// `{ns}:{job_id}:cancel`, separado para que el intake pueda pedir la
/// cancelación sin pisar una actualización del runner.
#[derive(Clone)]
pub struct JobRepository {
    store: Arc<dyn KvStore>,
    namespace: String,
}

impl JobRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_namespace(store, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:{}", self.namespace, job_id)
    }

    fn cancel_key(&self, job_id: &str) -> String {
        format!("{}:{}:cancel", self.namespace, job_id)
    }

    /// Upsert idempotente: reemplaza la representación completa.
    pub fn save(&self, record: &JobRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        self.store.set(&self.job_key(&record.job_id), &payload)?;
        debug!("persistido job {} en estado {}", record.job_id, record.status);
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        match self.store.get(&self.job_key(job_id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Lee, aplica `mutate` y escribe con compare-and-set contra el valor
    /// leído. Si otro escritor se adelantó se vuelve a leer y aplicar.
    pub fn update<F>(&self, job_id: &str, mut mutate: F) -> Result<JobRecord>
    where
        F: FnMut(&mut JobRecord) -> Result<()>,
    {
        let key = self.job_key(job_id);

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let raw = self
                .store
                .get(&key)?
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            let mut record: JobRecord = serde_json::from_str(&raw)?;

            mutate(&mut record)?;

            let updated = serde_json::to_string(&record)?;
            if self.store.compare_and_set(&key, Some(&raw), &updated)? {
                return Ok(record);
            }
            debug!(
                "escritura concurrente sobre job {} (intento {}), reintentando",
                job_id, attempt
            );
        }

        Err(JobError::Conflict(job_id.to_string()))
    }

    pub fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<JobRecord> {
        let record = self.update(job_id, |record| record.transition(status, at, error))?;
        debug!("job {} -> {}", job_id, status);
        Ok(record)
    }

    pub fn update_progress(
        &self,
        job_id: &str,
        percent: Option<f64>,
        step: Option<&str>,
        message: Option<&str>,
    ) -> Result<JobRecord> {
        self.update(job_id, |record| record.set_progress(percent, step, message))
    }

    pub fn update_task_id(&self, job_id: &str, task_id: &str) -> Result<JobRecord> {
        self.update(job_id, |record| record.set_task_id(task_id))
    }

    pub fn mark_cancel_flag(&self, job_id: &str) -> Result<()> {
        self.store.set(&self.cancel_key(job_id), "1")?;
        info!("cancelación solicitada para job {}", job_id);
        Ok(())
    }

    pub fn clear_cancel_flag(&self, job_id: &str) -> Result<()> {
        self.store.delete(&self.cancel_key(job_id))?;
        Ok(())
    }

    pub fn is_cancel_requested(&self, job_id: &str) -> Result<bool> {
        let flag = self.store.get(&self.cancel_key(job_id))?;
        Ok(flag
            .and_then(|v| v.trim().parse::<i64>().ok())
            .is_some_and(|v| v != 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobProgress, JobType};
    use crate::store::{MemoryStore, SqliteStore};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_704_067_200 + secs, 0).unwrap()
    }

    fn repo() -> JobRepository {
        JobRepository::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn save_y_get_devuelven_el_mismo_registro() {
        let repo = JobRepository::new(Arc::new(SqliteStore::open_in_memory().unwrap()));

        let mut record = JobRecord::new("job-rt", JobType::BootstrapDual, Utc::now());
        record.task_id = Some("host-1".to_string());
        record.transition(JobStatus::Running, Utc::now(), None).unwrap();
        record.progress = JobProgress {
            percent: 37.5,
            step: Some("bootstrap".to_string()),
            message: Some("Bootstrap iteration 3/8".to_string()),
        };
        record
            .transition(JobStatus::Failed, Utc::now(), Some("boom"))
            .unwrap();

        repo.save(&record).unwrap();
        assert_eq!(repo.get("job-rt").unwrap(), Some(record.clone()));

        // save es idempotente
        repo.save(&record).unwrap();
        assert_eq!(repo.get("job-rt").unwrap(), Some(record));
    }

    #[test]
    fn get_de_job_inexistente_es_none() {
        assert_eq!(repo().get("nope").unwrap(), None);
    }

    #[test]
    fn updates_sobre_job_inexistente_dan_not_found() {
        let repo = repo();
        assert!(matches!(
            repo.update_status("nope", JobStatus::Running, at(0), None),
            Err(JobError::NotFound(id)) if id == "nope"
        ));
        assert!(matches!(
            repo.update_progress("nope", Some(1.0), None, None),
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            repo.update_task_id("nope", "t"),
            Err(JobError::NotFound(_))
        ));
    }

    #[test]
    fn update_status_persiste_la_transicion() {
        let repo = repo();
        repo.save(&JobRecord::new("j", JobType::BootstrapSingle, at(0)))
            .unwrap();

        repo.update_status("j", JobStatus::Running, at(5), None).unwrap();
        repo.update_progress("j", Some(40.0), Some("descriptive"), None)
            .unwrap();
        repo.update_status("j", JobStatus::Cancelled, at(9), Some("Cancelled"))
            .unwrap();

        let stored = repo.get("j").unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.started_at, Some(at(5)));
        assert_eq!(stored.finished_at, Some(at(9)));
        assert_eq!(stored.error.as_deref(), Some("Cancelled"));
        assert_eq!(stored.progress.percent, 40.0);
    }

    #[test]
    fn terminal_no_vuelve_atras() {
        let repo = repo();
        repo.save(&JobRecord::new("j", JobType::BootstrapSingle, at(0)))
            .unwrap();
        repo.update_status("j", JobStatus::Cancelled, at(1), Some("Cancelled"))
            .unwrap();

        for next in [JobStatus::Queued, JobStatus::Running, JobStatus::Failed] {
            assert!(matches!(
                repo.update_status("j", next, at(2), None),
                Err(JobError::InvalidState { .. })
            ));
        }
        assert!(matches!(
            repo.update_progress("j", Some(10.0), None, None),
            Err(JobError::InvalidState { .. })
        ));

        let stored = repo.get("j").unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.finished_at, Some(at(1)));
    }

    #[test]
    fn update_reintenta_si_otro_escritor_se_adelanta() {
        let store = Arc::new(MemoryStore::new());
        let repo = JobRepository::new(store.clone());
        repo.save(&JobRecord::new("j", JobType::BootstrapSingle, at(0)))
            .unwrap();

        let other = repo.clone();
        let mut calls = 0;
        let updated = repo
            .update("j", |record| {
                calls += 1;
                if calls == 1 {
                    // otro escritor cambia el registro entre la lectura y la escritura
                    other.update_task_id("j", "intruso").unwrap();
                }
                record.set_progress(Some(25.0), Some("prepare"), None)
            })
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(updated.task_id.as_deref(), Some("intruso"));
        assert_eq!(updated.progress.percent, 25.0);
        assert_eq!(repo.get("j").unwrap().unwrap(), updated);
    }

    #[test]
    fn flag_de_cancelacion_independiente_del_registro() {
        let repo = repo();
        repo.save(&JobRecord::new("j", JobType::BootstrapSingle, at(0)))
            .unwrap();

        assert!(!repo.is_cancel_requested("j").unwrap());
        repo.mark_cancel_flag("j").unwrap();
        assert!(repo.is_cancel_requested("j").unwrap());

        // actualizar el registro no toca el flag
        repo.update_progress("j", Some(10.0), None, None).unwrap();
        assert!(repo.is_cancel_requested("j").unwrap());

        repo.clear_cancel_flag("j").unwrap();
        assert!(!repo.is_cancel_requested("j").unwrap());
        assert_eq!(repo.get("j").unwrap().unwrap().progress.percent, 10.0);
    }
}
