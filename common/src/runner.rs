//! Ciclo de vida de un job dentro del worker: admisión, ejecución con
//! cancelación cooperativa y timeout, estado terminal y limpieza.

use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, error, info, info_span, warn};

use crate::config::Settings;
use crate::error::{JobError, Result};
use crate::executor::{ExecutionContext, ExecutionError, ExecutionResult, Executor, Interrupt};
use crate::job::{JobProgress, JobRecord, JobStatus, JobType};
use crate::repository::JobRepository;
use crate::semaphore::JobSemaphore;
use crate::storage::{cleanup_after_completion, cleanup_job, JobPaths};

pub const CONCURRENCY_LIMIT_MESSAGE: &str = "Concurrency limit reached";
pub const CANCELLED_MESSAGE: &str = "Cancelled";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct JobRunner {
    repository: JobRepository,
    semaphore: JobSemaphore,
    executor: Arc<dyn Executor>,
    settings: Arc<Settings>,
    clock: Arc<dyn Clock>,
}

/// Slot del semáforo ocupado por una ejecución. Al soltarse limpia el flag
/// de cancelación y libera el slot, una sola vez, salga como salga el job.
struct SlotGuard<'a> {
    runner: &'a JobRunner,
    job_id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.runner.clear_flag(self.job_id);
        if let Err(e) = self.runner.semaphore.release() {
            error!("no se pudo liberar el slot del semáforo: {}", e);
        }
    }
}

impl JobRunner {
    pub fn new(
        repository: JobRepository,
        semaphore: JobSemaphore,
        executor: Arc<dyn Executor>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            repository,
            semaphore,
            executor,
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn execute(
        &self,
        job_id: &str,
        job_type: JobType,
        paths: &JobPaths,
        payload: &Value,
        task_id: Option<&str>,
    ) -> Result<JobRecord> {
        let span = info_span!("job", job_id = %job_id, job_type = %job_type);
        let _enter = span.enter();

        // 1) registro existente o nuevo en QUEUED
        match self.repository.get(job_id)? {
            Some(record) if record.status.is_terminal() => {
                info!("job ya finalizado en {}, no se ejecuta", record.status);
                self.clear_flag(job_id);
                return self.adopt_terminal(job_id, paths);
            }
            Some(_) => {
                if let Some(task_id) = task_id {
                    match self.repository.update_task_id(job_id, task_id) {
                        Ok(_) => {}
                        Err(JobError::InvalidState { .. }) => {
                            self.clear_flag(job_id);
                            return self.adopt_terminal(job_id, paths);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            None => {
                let mut record = JobRecord::new(job_id, job_type, self.clock.now());
                if let Some(task_id) = task_id {
                    record.set_task_id(task_id)?;
                }
                self.repository.save(&record)?;
            }
        }

        // 2) admisión sin espera
        let acquired = self.semaphore.acquire(
            self.settings.max_concurrent_jobs,
            self.settings.job_timeout_seconds,
        )?;
        if !acquired {
            warn!("límite de concurrencia alcanzado, job rechazado");
            let result = self.finish(job_id, JobStatus::Failed, CONCURRENCY_LIMIT_MESSAGE, paths);
            self.clear_flag(job_id);
            return result;
        }
        let _slot = SlotGuard {
            runner: self,
            job_id,
        };

        // 3) RUNNING con deadline
        let started_at = self.clock.now();
        match self
            .repository
            .update_status(job_id, JobStatus::Running, started_at, None)
        {
            Ok(_) => {}
            Err(JobError::InvalidState { .. }) => return self.adopt_terminal(job_id, paths),
            Err(e) => return Err(e),
        }
        let timeout_secs = self.settings.job_timeout_seconds;
        let deadline = started_at + Duration::seconds(timeout_secs.min(u64::from(u32::MAX)) as i64);
        info!("job en ejecución (timeout {}s)", timeout_secs);

        // 4) executor con callbacks de progreso y guard
        let guard = || -> std::result::Result<(), Interrupt> {
            match self.repository.is_cancel_requested(job_id) {
                Ok(true) => return Err(Interrupt::Cancelled(job_id.to_string())),
                Ok(false) => {}
                Err(e) => warn!("no se pudo leer el flag de cancelación: {}", e),
            }
            if self.clock.now() > deadline {
                return Err(Interrupt::TimedOut {
                    job_id: job_id.to_string(),
                    timeout_secs,
                });
            }
            Ok(())
        };
        let progress = |percent: f64, step: &str, message: Option<&str>| {
            if let Err(e) =
                self.repository
                    .update_progress(job_id, Some(percent), Some(step), message)
            {
                debug!("progreso no registrado ({}): {}", step, e);
            }
        };
        let ctx = ExecutionContext::new(job_id, job_type, paths, payload, &progress, &guard);

        match self.run_guarded(&ctx, &guard) {
            Ok(result) => self.complete(job_id, paths, payload, &result),
            Err(ExecutionError::Interrupted(Interrupt::Cancelled(_))) => {
                info!("job cancelado");
                self.finish(job_id, JobStatus::Cancelled, CANCELLED_MESSAGE, paths)
            }
            Err(ExecutionError::Interrupted(timeout @ Interrupt::TimedOut { .. })) => {
                warn!("{}", timeout);
                self.finish(job_id, JobStatus::Failed, &timeout.to_string(), paths)
            }
            Err(ExecutionError::Failed(e)) => {
                error!("fallo inesperado en el job: {:#}", e);
                self.finish(job_id, JobStatus::Failed, &format!("{:#}", e), paths)
            }
        }
    }

    /// guard antes y después del executor; un panic del executor se trata
    /// como un fallo más del job.
    fn run_guarded(
        &self,
        ctx: &ExecutionContext<'_>,
        guard: &dyn Fn() -> std::result::Result<(), Interrupt>,
    ) -> std::result::Result<ExecutionResult, ExecutionError> {
        guard()?;
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.executor.run(ctx)))
            .unwrap_or_else(|payload| Err(anyhow!(panic_message(payload)).into()))?;
        guard()?;
        Ok(result)
    }

    fn complete(
        &self,
        job_id: &str,
        paths: &JobPaths,
        payload: &Value,
        result: &ExecutionResult,
    ) -> Result<JobRecord> {
        if let Err(e) = self.write_results(paths, result) {
            error!("no se pudieron escribir los resultados: {}", e);
            return self.finish(job_id, JobStatus::Failed, &e.to_string(), paths);
        }

        let now = self.clock.now();
        let record = match self.repository.update(job_id, |record| {
            record.transition(JobStatus::Completed, now, None)?;
            record.progress = JobProgress::completed();
            Ok(())
        }) {
            Ok(record) => record,
            Err(JobError::InvalidState { .. }) => return self.adopt_terminal(job_id, paths),
            Err(e) => return Err(e),
        };

        let clean_all = payload
            .get("cleanAll")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        cleanup_after_completion(paths, clean_all);
        info!("job completado");
        Ok(record)
    }

    fn write_results(&self, paths: &JobPaths, result: &ExecutionResult) -> Result<()> {
        fs::create_dir_all(&paths.output_dir)?;
        fs::write(
            paths.output_dir.join("results.json"),
            serde_json::to_vec_pretty(&result.normalized)?,
        )?;
        if let Some(text) = self.executor.render_text(&result.raw) {
            fs::write(paths.output_dir.join("results.txt"), text)?;
        }
        Ok(())
    }

    /// Transición terminal distinta de COMPLETED más limpieza completa.
    fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        message: &str,
        paths: &JobPaths,
    ) -> Result<JobRecord> {
        let record = match self
            .repository
            .update_status(job_id, status, self.clock.now(), Some(message))
        {
            Ok(record) => record,
            Err(JobError::InvalidState { .. }) => return self.adopt_terminal(job_id, paths),
            Err(e) => {
                cleanup_job(paths);
                return Err(e);
            }
        };
        cleanup_job(paths);
        Ok(record)
    }

    /// Otro escritor ya cerró el job: se respeta su estado terminal y se
    /// limpia el directorio salvo que haya completado.
    fn adopt_terminal(&self, job_id: &str, paths: &JobPaths) -> Result<JobRecord> {
        let record = self
            .repository
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        debug!("job cerrado por otro escritor en {}", record.status);
        if record.status != JobStatus::Completed {
            cleanup_job(paths);
        }
        Ok(record)
    }

    fn clear_flag(&self, job_id: &str) {
        if let Err(e) = self.repository.clear_cancel_flag(job_id) {
            warn!("no se pudo limpiar el flag de cancelación: {}", e);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return format!("executor panicked: {}", s);
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return format!("executor panicked: {}", s);
    }
    "executor panicked".to_string()
}


#[cfg(test)]
mod tests {
    use super::test_support::ManualClock;
    use super::*;
    use crate::storage::prepare_job_paths;
    use crate::store::{KvStore, MemoryStore};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    type StepFn = dyn Fn(&ExecutionContext<'_>) -> std::result::Result<ExecutionResult, ExecutionError>
        + Send
        + Sync;

    struct ScriptedExecutor {
        step: Box<StepFn>,
    }

    impl ScriptedExecutor {
        fn new(
            step: impl Fn(&ExecutionContext<'_>) -> std::result::Result<ExecutionResult, ExecutionError>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                step: Box::new(step),
            })
        }
    }

    impl Executor for ScriptedExecutor {
        fn run(
            &self,
            ctx: &ExecutionContext<'_>,
        ) -> std::result::Result<ExecutionResult, ExecutionError> {
            (self.step)(ctx)
        }

        fn render_text(&self, raw: &Value) -> Option<String> {
            Some(format!("raw: {}", raw))
        }
    }

    fn ok_result() -> std::result::Result<ExecutionResult, ExecutionError> {
        Ok(ExecutionResult {
            normalized: json!({ "summary": "ok" }),
            raw: json!({ "value": 1 }),
        })
    }

    struct Fixture {
        _tmp: TempDir,
        store: Arc<MemoryStore>,
        repository: JobRepository,
        semaphore: JobSemaphore,
        clock: Arc<ManualClock>,
        paths: JobPaths,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let store = Arc::new(MemoryStore::new());
            let paths = prepare_job_paths("job-1", tmp.path()).unwrap();
            Self {
                repository: JobRepository::new(store.clone()),
                semaphore: JobSemaphore::new(store.clone()),
                clock: Arc::new(ManualClock::new(Utc.timestamp_opt(1_704_067_200, 0).unwrap())),
                store,
                paths,
                _tmp: tmp,
            }
        }

        fn runner(&self, executor: Arc<dyn Executor>, max_concurrent_jobs: u32) -> JobRunner {
            let settings = Settings {
                max_concurrent_jobs,
                job_timeout_seconds: 60,
                ..Settings::default()
            };
            JobRunner::new(
                self.repository.clone(),
                self.semaphore.clone(),
                executor,
                Arc::new(settings),
            )
            .with_clock(self.clock.clone())
        }

        fn queue(&self) {
            self.repository
                .save(&JobRecord::new("job-1", JobType::BootstrapSingle, self.clock.now()))
                .unwrap();
        }

        fn execute(&self, runner: &JobRunner, payload: Value) -> JobRecord {
            runner
                .execute("job-1", JobType::BootstrapSingle, &self.paths, &payload, Some("host-abc"))
                .unwrap()
        }
    }

    #[test]
    fn ejecucion_exitosa_escribe_resultados_y_completa() {
        let fx = Fixture::new();
        fx.queue();
        let runner = fx.runner(
            ScriptedExecutor::new(|ctx| {
                ctx.progress(50.0, "bootstrap", Some("half"));
                ok_result()
            }),
            2,
        );

        let record = fx.execute(&runner, json!({}));

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, JobProgress::completed());
        assert_eq!(record.task_id.as_deref(), Some("host-abc"));
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
        assert!(record.error.is_none());

        let results: Value = serde_json::from_slice(
            &fs::read(fx.paths.output_dir.join("results.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(results, json!({ "summary": "ok" }));
        assert_eq!(
            fs::read_to_string(fx.paths.output_dir.join("results.txt")).unwrap(),
            "raw: {\"value\":1}"
        );
        assert_eq!(fx.semaphore.in_use().unwrap(), 0);
        assert_eq!(fx.repository.get("job-1").unwrap().unwrap(), record);
    }

    #[test]
    fn crea_el_registro_si_no_existe() {
        let fx = Fixture::new();
        let runner = fx.runner(ScriptedExecutor::new(|_| ok_result()), 1);

        let record = fx.execute(&runner, json!({}));

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.job_type, JobType::BootstrapSingle);
    }

    #[test]
    fn cancelacion_durante_la_ejecucion() {
        let fx = Fixture::new();
        fx.queue();
        let repository = fx.repository.clone();
        let runner = fx.runner(
            ScriptedExecutor::new(move |ctx| {
                repository.mark_cancel_flag(ctx.job_id).unwrap();
                ctx.guard()?;
                ok_result()
            }),
            2,
        );

        let record = fx.execute(&runner, json!({}));

        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.error.as_deref(), Some("Cancelled"));
        assert!(!fx.paths.root.exists());
        assert!(!fx.repository.is_cancel_requested("job-1").unwrap());
        assert_eq!(fx.semaphore.in_use().unwrap(), 0);
    }

    #[test]
    fn timeout_por_reloj_marca_failed() {
        let fx = Fixture::new();
        fx.queue();
        let clock = fx.clock.clone();
        let runner = fx.runner(
            ScriptedExecutor::new(move |ctx| {
                clock.advance(Duration::seconds(61));
                ctx.guard()?;
                ok_result()
            }),
            2,
        );

        let record = fx.execute(&runner, json!({}));

        assert_eq!(record.status, JobStatus::Failed);
        let error = record.error.unwrap();
        assert!(error.contains("timeout"), "{error}");
        assert_eq!(error, "Job job-1 exceeded timeout of 60s");
        assert!(!fx.paths.root.exists());
        assert_eq!(fx.semaphore.in_use().unwrap(), 0);
    }

    #[test]
    fn el_guard_final_detecta_timeout_aunque_el_executor_no_lo_consulte() {
        let fx = Fixture::new();
        fx.queue();
        let clock = fx.clock.clone();
        let runner = fx.runner(
            ScriptedExecutor::new(move |_| {
                clock.advance(Duration::seconds(120));
                ok_result()
            }),
            2,
        );

        let record = fx.execute(&runner, json!({}));
        assert_eq!(record.status, JobStatus::Failed);
        assert!(!fx.paths.output_dir.join("results.json").exists());
    }

    #[test]
    fn error_del_executor_marca_failed_con_el_mensaje() {
        let fx = Fixture::new();
        fx.queue();
        let runner = fx.runner(
            ScriptedExecutor::new(|_| Err(anyhow!("columna vacía").into())),
            2,
        );

        let record = fx.execute(&runner, json!({}));

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("columna vacía"));
        assert!(!fx.paths.root.exists());
        assert_eq!(fx.semaphore.in_use().unwrap(), 0);
    }

    #[test]
    fn panic_del_executor_no_tumba_al_worker() {
        let fx = Fixture::new();
        fx.queue();
        let runner = fx.runner(ScriptedExecutor::new(|_| panic!("explotó")), 2);

        let record = fx.execute(&runner, json!({}));

        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().contains("explotó"));
        assert_eq!(fx.semaphore.in_use().unwrap(), 0);
    }

    #[test]
    fn rechazo_por_concurrencia_no_pasa_por_running() {
        let fx = Fixture::new();
        fx.queue();
        // otro worker ocupa el único slot
        assert!(fx.semaphore.acquire(1, 60).unwrap());
        let runner = fx.runner(ScriptedExecutor::new(|_| ok_result()), 1);

        let record = fx.execute(&runner, json!({}));

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some(CONCURRENCY_LIMIT_MESSAGE));
        assert!(record.started_at.is_none());
        assert!(!fx.paths.root.exists());
        // el slot ajeno sigue ocupado
        assert_eq!(fx.semaphore.in_use().unwrap(), 1);
    }

    #[test]
    fn job_cancelado_antes_de_arrancar_no_se_ejecuta() {
        let fx = Fixture::new();
        fx.queue();
        fx.repository.mark_cancel_flag("job-1").unwrap();
        fx.repository
            .update_status("job-1", JobStatus::Cancelled, fx.clock.now(), Some("Cancelled"))
            .unwrap();
        let runner = fx.runner(
            ScriptedExecutor::new(|_| panic!("no debería ejecutarse")),
            2,
        );

        let record = fx.execute(&runner, json!({}));

        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.task_id.is_none());
        assert!(!fx.paths.root.exists());
        assert!(!fx.repository.is_cancel_requested("job-1").unwrap());
        assert_eq!(fx.semaphore.in_use().unwrap(), 0);
    }

    #[test]
    fn flag_sin_transicion_se_detecta_en_el_primer_guard() {
        let fx = Fixture::new();
        fx.queue();
        fx.repository.mark_cancel_flag("job-1").unwrap();
        let runner = fx.runner(
            ScriptedExecutor::new(|_| panic!("no debería ejecutarse")),
            2,
        );

        let record = fx.execute(&runner, json!({}));

        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.started_at.is_some());
        assert!(!fx.repository.is_cancel_requested("job-1").unwrap());
    }

    #[test]
    fn cancelacion_externa_concurrente_se_respeta() {
        let fx = Fixture::new();
        fx.queue();
        let repository = fx.repository.clone();
        let clock = fx.clock.clone();
        // el intake cierra el job mientras el executor corre, sin que el
        // executor llegue a consultar el guard
        let runner = fx.runner(
            ScriptedExecutor::new(move |ctx| {
                repository
                    .update_status(ctx.job_id, JobStatus::Cancelled, clock.now(), Some("Cancelled"))
                    .unwrap();
                ok_result()
            }),
            2,
        );

        let record = fx.execute(&runner, json!({}));

        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(!fx.paths.root.exists());
        assert_eq!(fx.semaphore.in_use().unwrap(), 0);
    }

    #[test]
    fn clean_all_borra_intermedios_pero_no_resultados() {
        let fx = Fixture::new();
        fx.queue();
        let runner = fx.runner(
            ScriptedExecutor::new(|ctx| {
                fs::write(ctx.paths.output_dir.join("file1_cleaned.csv"), "1").unwrap();
                fs::write(ctx.paths.output_dir.join("file1_sampled.csv"), "1").unwrap();
                ok_result()
            }),
            2,
        );

        let record = fx.execute(&runner, json!({ "cleanAll": true }));

        assert_eq!(record.status, JobStatus::Completed);
        assert!(fx.paths.output_dir.join("results.json").exists());
        assert!(!fx.paths.output_dir.join("file1_cleaned.csv").exists());
        assert!(!fx.paths.output_dir.join("file1_sampled.csv").exists());
    }

    #[test]
    fn sin_clean_all_se_conservan_intermedios() {
        let fx = Fixture::new();
        fx.queue();
        let runner = fx.runner(
            ScriptedExecutor::new(|ctx| {
                fs::write(ctx.paths.output_dir.join("file1_cleaned.csv"), "1").unwrap();
                ok_result()
            }),
            2,
        );

        fx.execute(&runner, json!({}));
        assert!(fx.paths.output_dir.join("file1_cleaned.csv").exists());
        assert!(fx.store.get("job:job-1:cancel").unwrap().is_none());
    }

    #[test]
    fn iteraciones_desmedidas_terminan_en_failed() {
        let fx = Fixture::new();
        fx.queue();
        fs::write(fx.paths.input_dir.join("file1.csv"), "value\n1\n2\n3\n").unwrap();
        let runner = fx.runner(Arc::new(crate::executor::DescriptiveExecutor::default()), 2);

        let record = fx.execute(&runner, json!({ "bootstrapIterations": 1u64 << 59 }));

        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("bootstrapIterations"));
        assert_eq!(fx.semaphore.in_use().unwrap(), 0);
        assert!(!fx.paths.root.exists());
    }
}
