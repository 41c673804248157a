use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use common::{
    storage::sweep_expired_jobs, DescriptiveExecutor, DispatchMessage, JobPaths, JobQueue,
    JobRecord, JobRepository, JobRunner, JobSemaphore, KvStore, Settings, SqliteStore,
};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Lo que comparte cada ejecución lanzada por el worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub worker_id: String,
    pub runner: Arc<JobRunner>,
    pub queue: JobQueue,
    pub settings: Arc<Settings>,
}

impl WorkerContext {
    pub fn new(worker_id: impl Into<String>, store: Arc<dyn KvStore>, settings: Arc<Settings>) -> Self {
        let runner = JobRunner::new(
            JobRepository::new(store.clone()),
            JobSemaphore::new(store.clone()),
            Arc::new(DescriptiveExecutor::default()),
            settings.clone(),
        );
        Self {
            worker_id: worker_id.into(),
            runner: Arc::new(runner),
            queue: JobQueue::new(store),
            settings,
        }
    }

    /// Id de tarea con el que el job queda asociado a esta ejecución.
    fn next_task_id(&self) -> String {
        format!("{}-{}", self.worker_id, uuid::Uuid::new_v4())
    }

    /// Ejecuta un mensaje de la cola hasta su estado terminal (bloqueante).
    pub fn execute_message(&self, message: &DispatchMessage) -> common::Result<JobRecord> {
        let paths = JobPaths::resolve(&message.job_id, &self.settings.storage_root)?;
        let task_id = self.next_task_id();
        self.runner.execute(
            &message.job_id,
            message.job_type,
            &paths,
            &message.payload,
            Some(&task_id),
        )
    }

    /// Toma el siguiente job de la cola y lo ejecuta. `None` si no había nada.
    pub fn process_next(&self) -> common::Result<Option<JobRecord>> {
        match self.queue.pop()? {
            Some(message) => self.execute_message(&message).map(Some),
            None => Ok(None),
        }
    }

    /// Barrido TTL de los directorios de jobs.
    pub fn sweep(&self) -> usize {
        let deleted = sweep_expired_jobs(
            &self.settings.storage_root,
            Some(self.settings.job_ttl_hours),
            Utc::now(),
        );
        if !deleted.is_empty() {
            info!("barrido TTL: {} directorios eliminados", deleted.len());
        }
        deleted.len()
    }
}

/// Loop principal del worker.
/// - Abre el store compartido con el master.
/// - Lanza el barrido TTL periódico.
/// - Saca jobs de la cola mientras tenga "slots" libres (WORKER_CONCURRENCY).
pub async fn run() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Arc::new(Settings::from_env()?);
    std::fs::create_dir_all(&settings.storage_root).with_context(|| {
        format!(
            "no se pudo crear el storage root {}",
            settings.storage_root.display()
        )
    })?;
    let store: Arc<dyn KvStore> = Arc::new(
        SqliteStore::open(&settings.store_path)
            .with_context(|| format!("abriendo store {}", settings.store_path.display()))?,
    );

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let concurrency: usize = env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_WORKER_CONCURRENCY) as usize;

    let ctx = WorkerContext::new(hostname, store, settings.clone());
    info!(
        "worker {} con concurrency={} sobre {}",
        ctx.worker_id,
        concurrency,
        settings.store_path.display()
    );

    // --------- Barrido TTL en segundo plano ---------
    let sweeper = ctx.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(sweeper.settings.sweep_interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let ctx = sweeper.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || ctx.sweep()).await {
                warn!("barrido TTL abortado: {:?}", e);
            }
        }
    });

    let sem = Arc::new(Semaphore::new(concurrency));

    loop {
        // --------- Control de concurrencia local ---------
        let permit = sem.clone().acquire_owned().await?;

        let queue = ctx.queue.clone();
        let message = match tokio::task::spawn_blocking(move || queue.pop()).await? {
            Ok(Some(message)) => message,
            Ok(None) => {
                drop(permit);
                sleep(IDLE_POLL).await;
                continue;
            }
            Err(e) => {
                warn!("error leyendo la cola: {}", e);
                drop(permit);
                sleep(IDLE_POLL).await;
                continue;
            }
        };

        debug!("tengo job {} ({})", message.job_id, message.job_type);
        let job_ctx = ctx.clone();
        tokio::spawn(async move {
            let job_id = message.job_id.clone();
            let handle = tokio::task::spawn_blocking(move || job_ctx.execute_message(&message));

            match handle.await {
                Ok(Ok(record)) => info!("job {} terminó en {}", job_id, record.status),
                Ok(Err(e)) => warn!("error procesando job {}: {}", job_id, e),
                Err(e) => warn!("panic o join error en job {}: {:?}", job_id, e),
            }

            // liberar el "slot" de concurrencia al terminar
            drop(permit);
        });
    }
}
