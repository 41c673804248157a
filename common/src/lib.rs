//! Motor de orquestación de jobs analíticos: modelo de estados, repositorio
//! sobre el store compartido, semáforo distribuido, runner, almacenamiento
//! por job y validación de bundles KW.

pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod kw_zip;
pub mod queue;
pub mod repository;
pub mod runner;
pub mod semaphore;
pub mod service;
pub mod storage;
pub mod store;

pub use config::{ConfigError, Settings};
pub use error::{JobError, Result};
pub use executor::{
    DescriptiveExecutor, ExecutionContext, ExecutionError, ExecutionResult, Executor, Interrupt,
};
pub use job::{JobId, JobProgress, JobRecord, JobStatus, JobType};
pub use kw_zip::{KwGroup, KwLayout, KwZipError, KwZipErrorCode, KwZipLayout};
pub use queue::{DispatchMessage, JobQueue};
pub use repository::JobRepository;
pub use runner::{Clock, JobRunner, SystemClock};
pub use semaphore::JobSemaphore;
pub use service::{ArtifactInfo, ConfigOverrides, JobService, JobUploads, PlotToggles};
pub use storage::JobPaths;
pub use store::{KvStore, MemoryStore, SqliteStore, StoreError};
