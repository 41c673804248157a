//! Intake de jobs: valida la submission, materializa las entradas en disco,
//! crea el registro QUEUED y lo despacha. También expone las consultas que
//! usa la API (estado, cancelación, resultados y artefactos).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{JobError, Result};
use crate::executor::{MAX_ITERATIONS, MAX_SAMPLE_SIZE};
use crate::job::{JobRecord, JobStatus, JobType};
use crate::kw_zip::{extract_kw_bundle, validate_kw_zip};
use crate::queue::{DispatchMessage, JobQueue};
use crate::repository::JobRepository;
use crate::storage::{cleanup_job, ensure_within_size_limit, prepare_job_paths, safe_join, JobPaths};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlotToggles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boxplot: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kde: Option<bool>,
}

/// Overrides de configuración que acompañan a una submission. Los campos
/// ausentes conservan el default; un campo desconocido es un error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_iterations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permutation_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier_lower_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier_upper_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptive_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_log: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plots: Option<PlotToggles>,
}

impl ConfigOverrides {
    pub fn defaults() -> Self {
        Self {
            descriptive_enabled: Some(true),
            create_log: Some(false),
            clean_all: Some(false),
            plots: Some(PlotToggles::default()),
            ..Self::default()
        }
    }

    /// Parsea el campo `config` de la submission (JSON).
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let overrides: Self = serde_json::from_str(raw).map_err(|e| {
            JobError::validation("INVALID_CONFIG", format!("Invalid config JSON: {}", e))
        })?;
        overrides.validate()?;
        Ok(overrides)
    }

    /// Rangos de los contadores numéricos: `1..=max` cuando están presentes.
    pub fn validate(&self) -> Result<()> {
        let bounded = [
            ("bootstrapIterations", self.bootstrap_iterations, MAX_ITERATIONS),
            ("permutationCount", self.permutation_count, MAX_ITERATIONS),
            ("sampleSize", self.sample_size, MAX_SAMPLE_SIZE),
        ];
        for (field, value, max) in bounded {
            if let Some(v) = value {
                if v == 0 || v > max {
                    return Err(JobError::validation(
                        "INVALID_CONFIG",
                        format!("{} must be between 1 and {}.", field, max),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobUploads {
    pub file1: Option<Vec<u8>>,
    pub file2: Option<Vec<u8>>,
    pub kw_bundle: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactInfo {
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Merge recursivo: los objetos se combinan clave a clave, el resto se pisa.
pub fn deep_merge(base: Value, overrides: Value) -> Value {
    match (base, overrides) {
        (Value::Object(mut base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overrides) => overrides,
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "json" => "application/json",
        "csv" => "text/csv",
        "txt" | "log" => "text/plain",
        "png" => "image/png",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[derive(Clone)]
pub struct JobService {
    repository: JobRepository,
    queue: JobQueue,
    settings: Arc<Settings>,
}

impl JobService {
    pub fn new(repository: JobRepository, queue: JobQueue, settings: Arc<Settings>) -> Self {
        Self {
            repository,
            queue,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn create_job(
        &self,
        job_type: JobType,
        overrides: &ConfigOverrides,
        uploads: &JobUploads,
    ) -> Result<JobRecord> {
        let job_id = Uuid::new_v4().to_string();
        let paths = prepare_job_paths(&job_id, &self.settings.storage_root)?;

        let payload = match self.stage_inputs(&paths, job_type, overrides, uploads) {
            Ok(payload) => payload,
            Err(e) => {
                info!("submission rechazada ({}): {}", e.code(), e);
                cleanup_job(&paths);
                return Err(e);
            }
        };

        let record = JobRecord::new(job_id.clone(), job_type, Utc::now());
        if let Err(e) = self.repository.save(&record) {
            warn!("no se pudo guardar el job {}: {}", job_id, e);
            cleanup_job(&paths);
            return Err(e);
        }

        let message = DispatchMessage {
            job_id: job_id.clone(),
            job_type,
            payload,
        };
        if let Err(e) = self.queue.push(&message) {
            warn!("no se pudo despachar el job {}: {}", job_id, e);
            if let Err(mark_err) = self.repository.update_status(
                &job_id,
                JobStatus::Failed,
                Utc::now(),
                Some("Dispatch failed"),
            ) {
                warn!("no se pudo marcar FAILED el job {}: {}", job_id, mark_err);
            }
            cleanup_job(&paths);
            return Err(e);
        }

        info!("job {} ({}) encolado", job_id, job_type);
        Ok(record)
    }

    fn resolve_config(&self, overrides: &ConfigOverrides) -> Result<Value> {
        let defaults = serde_json::to_value(ConfigOverrides::defaults())?;
        let mut merged = deep_merge(defaults, serde_json::to_value(overrides)?);
        if let Value::Object(map) = &mut merged {
            map.entry("plots").or_insert_with(|| Value::Object(Map::new()));
            map.entry("cleanAll").or_insert(Value::Bool(false));
        }
        Ok(merged)
    }

    fn stage_inputs(
        &self,
        paths: &JobPaths,
        job_type: JobType,
        overrides: &ConfigOverrides,
        uploads: &JobUploads,
    ) -> Result<Value> {
        overrides.validate()?;
        let resolved = self.resolve_config(overrides)?;
        fs::write(
            paths.input_dir.join("config.json"),
            serde_json::to_vec(&resolved)?,
        )?;
        let mut payload = deep_merge(json!({ "jobType": job_type }), resolved);

        match job_type {
            JobType::KwPermutation => {
                let bundle = uploads.kw_bundle.as_deref().ok_or_else(|| {
                    JobError::validation("MISSING_FILE", "kwBundle is required for KW_PERMUTATION.")
                })?;
                ensure_within_size_limit(bundle.len() as i64, self.settings.max_upload_bytes())?;
                let layout = validate_kw_zip(bundle)?;
                fs::write(paths.input_dir.join("kw_bundle.zip"), bundle)?;
                let extract_cap = u64::try_from(self.settings.max_upload_bytes()).unwrap_or(0);
                extract_kw_bundle(bundle, &layout, &paths.input_dir, extract_cap)?;

                payload["kwLayout"] = json!(layout.layout);
                payload["kwGroups"] = json!(layout.group_names());

                if uploads.file1.is_some() || uploads.file2.is_some() {
                    return Err(JobError::validation(
                        "INVALID_FILE",
                        "file1/file2 are not accepted for KW_PERMUTATION.",
                    ));
                }
            }
            JobType::BootstrapDual => {
                let (Some(file1), Some(file2)) = (&uploads.file1, &uploads.file2) else {
                    return Err(JobError::validation(
                        "MISSING_FILE",
                        "file1 and file2 are required for BOOTSTRAP_DUAL.",
                    ));
                };
                self.store_file(&paths.input_dir.join("file1.csv"), file1)?;
                self.store_file(&paths.input_dir.join("file2.csv"), file2)?;
            }
            JobType::BootstrapSingle | JobType::DescriptiveOnly => {
                let file1 = uploads.file1.as_deref().ok_or_else(|| {
                    JobError::validation("MISSING_FILE", "file1 is required for the selected jobType.")
                })?;
                self.store_file(&paths.input_dir.join("file1.csv"), file1)?;
                if let Some(file2) = &uploads.file2 {
                    self.store_file(&paths.input_dir.join("file2.csv"), file2)?;
                }
                if uploads.kw_bundle.is_some() {
                    return Err(JobError::validation(
                        "INVALID_FILE",
                        "kwBundle is only valid for KW_PERMUTATION.",
                    ));
                }
            }
        }

        Ok(payload)
    }

    fn store_file(&self, destination: &Path, data: &[u8]) -> Result<()> {
        ensure_within_size_limit(data.len() as i64, self.settings.max_upload_bytes())?;
        fs::write(destination, data)?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        self.repository
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<JobRecord> {
        let record = self.get_job(job_id)?;
        record.ensure_active()?;

        self.repository.mark_cancel_flag(job_id)?;
        let mut previous = record.status;
        let updated = self.repository.update(job_id, |current| {
            previous = current.status;
            current.transition(JobStatus::Cancelled, Utc::now(), Some("Cancelled"))
        });
        let updated = match updated {
            Ok(record) => record,
            Err(e) => {
                // el runner cerró el job primero; el flag ya no tiene dueño
                let _ = self.repository.clear_cancel_flag(job_id);
                return Err(e);
            }
        };

        if previous == JobStatus::Queued {
            cleanup_job(&JobPaths::resolve(job_id, &self.settings.storage_root)?);
        }
        info!("job {} cancelado (estaba en {})", job_id, previous);
        Ok(updated)
    }

    pub fn get_results(&self, job_id: &str) -> Result<Value> {
        let record = self.get_job(job_id)?;
        if record.status != JobStatus::Completed {
            return Err(JobError::NotReady(job_id.to_string()));
        }

        let results_path = self.output_dir(job_id)?.join("results.json");
        if !results_path.is_file() {
            return Err(JobError::ArtifactNotFound("results.json".to_string()));
        }
        Ok(serde_json::from_slice(&fs::read(results_path)?)?)
    }

    pub fn list_artifacts(&self, job_id: &str) -> Result<Vec<ArtifactInfo>> {
        self.get_job(job_id)?;
        let output_dir = self.output_dir(job_id)?;
        if !output_dir.exists() {
            return Ok(Vec::new());
        }

        let pattern = format!(
            "{}/**/*",
            glob::Pattern::escape(&output_dir.to_string_lossy())
        );
        let mut files: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| JobError::validation("INVALID_PATH", e.to_string()))?
            .flatten()
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        let mut artifacts = Vec::with_capacity(files.len());
        for path in files {
            let metadata = fs::metadata(&path)?;
            let name = path
                .strip_prefix(&output_dir)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            artifacts.push(ArtifactInfo {
                content_type: content_type_for(&path).to_string(),
                size_bytes: metadata.len(),
                created_at: metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
                name,
            });
        }
        Ok(artifacts)
    }

    pub fn artifact_path(&self, job_id: &str, artifact_name: &str) -> Result<PathBuf> {
        let output_dir = self.output_dir(job_id)?;
        let target = safe_join(&output_dir, [artifact_name]).map_err(|e| match e {
            JobError::PathTraversal { .. } => JobError::validation("INVALID_ARTIFACT", e.to_string()),
            other => other,
        })?;
        if !target.is_file() {
            return Err(JobError::ArtifactNotFound(artifact_name.to_string()));
        }
        Ok(target)
    }

    pub fn content_type(&self, path: &Path) -> &'static str {
        content_type_for(path)
    }

    fn output_dir(&self, job_id: &str) -> Result<PathBuf> {
        let paths = JobPaths::resolve(job_id, &self.settings.storage_root).map_err(|e| match e {
            JobError::PathTraversal { .. } => JobError::validation("INVALID_JOB", e.to_string()),
            other => other,
        })?;
        Ok(paths.output_dir)
    }
}
