use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

pub const DEFAULT_STORAGE_ROOT: &str = "/tmp/smartcomp";
pub const DEFAULT_STORE_PATH: &str = "/tmp/smartcomp-store.db";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: valor inválido {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Configuración del motor, leída una vez al arrancar desde variables `APP_*`
/// y pasada explícitamente a quien la necesite.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub storage_root: PathBuf,
    pub store_path: PathBuf,
    pub job_timeout_seconds: u64,
    pub max_concurrent_jobs: u32,
    pub max_upload_mb: u64,
    pub job_ttl_hours: i64,
    pub sweep_interval_secs: u64,
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            job_timeout_seconds: 1800,
            max_concurrent_jobs: 2,
            max_upload_mb: 100,
            job_ttl_hours: 24,
            sweep_interval_secs: 3600,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Igual que `from_env` pero con una función de lookup arbitraria
    /// (los tests no tocan el entorno del proceso).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let storage_root = get("APP_STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_root);
        let store_path = get("APP_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.store_path);
        let bind_addr = get("APP_BIND_ADDR").unwrap_or(defaults.bind_addr);

        let job_timeout_seconds: u64 = parse_var(&get, "APP_JOB_TIMEOUT_SECONDS")?
            .unwrap_or(defaults.job_timeout_seconds);
        if job_timeout_seconds == 0 {
            return Err(invalid("APP_JOB_TIMEOUT_SECONDS", "0", "debe ser > 0"));
        }

        let max_concurrent_jobs: u32 = parse_var(&get, "APP_MAX_CONCURRENT_JOBS")?
            .unwrap_or(defaults.max_concurrent_jobs);
        if max_concurrent_jobs == 0 {
            return Err(invalid("APP_MAX_CONCURRENT_JOBS", "0", "debe ser >= 1"));
        }

        let max_upload_mb: u64 =
            parse_var(&get, "APP_MAX_UPLOAD_MB")?.unwrap_or(defaults.max_upload_mb);
        if max_upload_mb == 0 {
            return Err(invalid("APP_MAX_UPLOAD_MB", "0", "debe ser > 0"));
        }

        let job_ttl_hours: i64 =
            parse_var(&get, "APP_JOB_TTL_HOURS")?.unwrap_or(defaults.job_ttl_hours);
        if job_ttl_hours < 0 {
            return Err(invalid(
                "APP_JOB_TTL_HOURS",
                &job_ttl_hours.to_string(),
                "debe ser >= 0",
            ));
        }

        let sweep_interval_secs: u64 = parse_var(&get, "APP_SWEEP_INTERVAL_SECS")?
            .unwrap_or(defaults.sweep_interval_secs);

        Ok(Self {
            storage_root,
            store_path,
            job_timeout_seconds,
            max_concurrent_jobs,
            max_upload_mb,
            job_ttl_hours,
            sweep_interval_secs,
            bind_addr,
        })
    }

    pub fn max_upload_bytes(&self) -> i64 {
        i64::try_from(self.max_upload_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }
}

fn parse_var<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(var, &raw, "no es un número válido")),
    }
}

fn invalid(var: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    }
}
