//! Ciclo de vida del almacenamiento por job: contención de rutas, árbol de
//! directorios del job, limpieza de artefactos y barrido por TTL.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::{JobError, Result};

/// Patrones de artefactos intermedios dentro de `output/`.
const INTERMEDIATE_PATTERNS: [&str; 3] = ["*_cleaned.csv", "*_sampled.csv", "*_sample.csv"];
const SAMPLES_DIR: &str = "samples";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub root: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub plots_dir: PathBuf,
    pub log_file: PathBuf,
}

impl JobPaths {
    /// Calcula el árbol del job sin crear nada en disco.
    pub fn resolve(job_id: &str, storage_root: &Path) -> Result<Self> {
        let root = safe_join(storage_root, [job_id])?;
        if root == resolve_path(storage_root)? {
            return Err(JobError::validation(
                "INVALID_JOB",
                "Job id must name a directory inside the storage root.",
            ));
        }

        let input_dir = root.join("input");
        let output_dir = root.join("output");
        let plots_dir = output_dir.join("plots");
        let log_file = output_dir.join("tool.log");

        Ok(Self {
            root,
            input_dir,
            output_dir,
            plots_dir,
            log_file,
        })
    }
}

/// Une `parts` a `base` y garantiza que el resultado quede dentro de `base`
/// (o sea `base`). Ambos se resuelven a su forma canónica absoluta.
pub fn safe_join<I, P>(base: &Path, parts: I) -> Result<PathBuf>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let base_resolved = resolve_path(base)?;

    let mut joined = base_resolved.clone();
    for part in parts {
        joined.push(part);
    }
    let candidate = resolve_path(&joined)?;

    if candidate.starts_with(&base_resolved) {
        Ok(candidate)
    } else {
        Err(JobError::PathTraversal {
            base: base_resolved,
            candidate,
        })
    }
}

/// Ruta absoluta normalizada; los symlinks se resuelven en el ancestro más
/// profundo que exista, el resto se normaliza léxicamente.
fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };
    let normalized = normalize_lexically(&absolute);

    let mut existing = normalized.as_path();
    let mut pending: Vec<OsString> = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(existing) {
            let mut out = canonical;
            for name in pending.iter().rev() {
                out.push(name);
            }
            return Ok(out);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                pending.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(normalized),
        }
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Crea `input/`, `output/` y `output/plots/` del job. Idempotente.
pub fn prepare_job_paths(job_id: &str, storage_root: &Path) -> Result<JobPaths> {
    let paths = JobPaths::resolve(job_id, storage_root)?;
    fs::create_dir_all(&paths.input_dir)?;
    fs::create_dir_all(&paths.plots_dir)?;
    debug!("directorios del job preparados en {}", paths.root.display());
    Ok(paths)
}

pub fn ensure_within_size_limit(size_bytes: i64, max_bytes: i64) -> Result<()> {
    if size_bytes < 0 {
        return Err(JobError::validation("INVALID_SIZE", "Size cannot be negative."));
    }
    if max_bytes <= 0 {
        return Err(JobError::validation(
            "INVALID_SIZE",
            "Maximum size must be positive.",
        ));
    }
    if size_bytes > max_bytes {
        return Err(JobError::validation(
            "PAYLOAD_TOO_LARGE",
            format!(
                "Payload size {} exceeds configured limit of {} bytes.",
                size_bytes, max_bytes
            ),
        ));
    }
    Ok(())
}

/// Borra el árbol completo del job. Best-effort: los errores se ignoran.
pub fn cleanup_job(paths: &JobPaths) {
    if paths.root.exists() {
        let _ = fs::remove_dir_all(&paths.root);
        info!("directorio del job eliminado: {}", paths.root.display());
    }
}

/// Borra CSVs intermedios (`*_cleaned.csv`, `*_sampled.csv`, `*_sample.csv`)
/// y `output/samples/`, dejando intactos los resultados finales.
pub fn cleanup_intermediate_outputs(paths: &JobPaths) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    let output_dir = glob::Pattern::escape(&paths.output_dir.to_string_lossy());

    for pattern in INTERMEDIATE_PATTERNS {
        let full = format!("{}/{}", output_dir, pattern);
        let entries = match glob::glob(&full) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("patrón inválido {}: {}", full, e);
                continue;
            }
        };
        for path in entries.flatten() {
            if path.is_file() && fs::remove_file(&path).is_ok() {
                removed.push(path);
            }
        }
    }

    let samples_dir = paths.output_dir.join(SAMPLES_DIR);
    if samples_dir.exists() {
        let _ = fs::remove_dir_all(&samples_dir);
        removed.push(samples_dir);
    }

    info!(
        "eliminados {} artefactos intermedios de {}",
        removed.len(),
        paths.root.display()
    );
    removed
}

pub fn cleanup_after_completion(paths: &JobPaths, clean_all: bool) -> Vec<PathBuf> {
    if !clean_all {
        return Vec::new();
    }
    cleanup_intermediate_outputs(paths)
}

/// Barre los directorios de primer nivel del storage root:
/// - `ttl_hours` ausente o negativo: no borra nada
/// - `ttl_hours == 0`: borra todo
/// - si no, borra los que tengan `mtime <= now - ttl_hours`
pub fn sweep_expired_jobs(
    storage_root: &Path,
    ttl_hours: Option<i64>,
    now: DateTime<Utc>,
) -> Vec<PathBuf> {
    let ttl_hours = match ttl_hours {
        Some(h) if h >= 0 => h,
        _ => return Vec::new(),
    };

    let entries = match fs::read_dir(storage_root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    // un TTL que no cabe en el calendario no expira nada
    let cutoff = match Duration::try_hours(ttl_hours).and_then(|ttl| now.checked_sub_signed(ttl)) {
        Some(cutoff) => cutoff,
        None => {
            debug!("ttl de {} horas fuera de rango, barrido omitido", ttl_hours);
            return Vec::new();
        }
    };

    let mut deleted = Vec::new();
    for entry in entries.flatten() {
        let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }

        let resolved = match safe_join(storage_root, [entry.file_name()]) {
            Ok(p) => p,
            Err(_) => {
                warn!(
                    "ruta sospechosa ignorada en barrido TTL: {}",
                    entry.path().display()
                );
                continue;
            }
        };

        let should_delete = if ttl_hours == 0 {
            true
        } else {
            match fs::metadata(&resolved).and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified) <= cutoff,
                Err(e) => {
                    warn!("no se pudo leer mtime de {}: {}", resolved.display(), e);
                    false
                }
            }
        };

        if should_delete {
            let _ = fs::remove_dir_all(&resolved);
            info!("directorio de job expirado eliminado: {}", resolved.display());
            deleted.push(resolved);
        }
    }

    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration as StdDuration, SystemTime};
    use tempfile::TempDir;

    fn set_mtime(path: &Path, at: DateTime<Utc>) {
        let when = SystemTime::UNIX_EPOCH + StdDuration::from_secs(at.timestamp() as u64);
        fs::File::open(path).unwrap().set_modified(when).unwrap();
    }

    #[test]
    fn prepare_job_paths_crea_el_layout_esperado() {
        let tmp = TempDir::new().unwrap();
        let paths = prepare_job_paths("job-123", tmp.path()).unwrap();

        assert_eq!(paths.root, fs::canonicalize(tmp.path()).unwrap().join("job-123"));
        assert!(paths.input_dir.is_dir());
        assert!(paths.output_dir.is_dir());
        assert!(paths.plots_dir.is_dir());
        assert_eq!(paths.log_file.file_name().unwrap(), "tool.log");
        assert_eq!(paths.plots_dir, paths.output_dir.join("plots"));

        // idempotente
        fs::write(paths.input_dir.join("file1.csv"), "x").unwrap();
        let again = prepare_job_paths("job-123", tmp.path()).unwrap();
        assert_eq!(again, paths);
        assert!(paths.input_dir.join("file1.csv").exists());
    }

    #[test]
    fn job_id_que_no_nombra_un_subdirectorio_se_rechaza() {
        let tmp = TempDir::new().unwrap();
        assert!(prepare_job_paths("", tmp.path()).is_err());
        assert!(prepare_job_paths(".", tmp.path()).is_err());
        assert!(matches!(
            prepare_job_paths("../fuera", tmp.path()),
            Err(JobError::PathTraversal { .. })
        ));
    }

    #[test]
    fn safe_join_impide_path_traversal() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();

        for bad in ["../escape", "a/../../escape", "/etc/passwd", "./../x"] {
            assert!(
                matches!(safe_join(base, [bad]), Err(JobError::PathTraversal { .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn safe_join_acepta_rutas_dentro_de_la_base() {
        let tmp = TempDir::new().unwrap();
        let base = fs::canonicalize(tmp.path()).unwrap();

        assert_eq!(safe_join(&base, ["job", "output"]).unwrap(), base.join("job/output"));
        assert_eq!(safe_join(&base, ["a/../b"]).unwrap(), base.join("b"));
        assert_eq!(safe_join(&base, ["."]).unwrap(), base);
        let absolute_inside = base.join("dentro");
        assert_eq!(safe_join(&base, [&absolute_inside]).unwrap(), absolute_inside);
    }

    #[cfg(unix)]
    #[test]
    fn safe_join_detecta_symlinks_que_escapan() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let base = tmp.path().join("root");
        fs::create_dir_all(&base).unwrap();
        std::os::unix::fs::symlink(outside.path(), base.join("link")).unwrap();

        assert!(matches!(
            safe_join(&base, ["link", "secret.txt"]),
            Err(JobError::PathTraversal { .. })
        ));
    }

    #[test]
    fn size_limit_guard() {
        ensure_within_size_limit(512, 1024).unwrap();
        assert!(ensure_within_size_limit(2048, 1024).is_err());
        assert!(ensure_within_size_limit(-1, 1024).is_err());
        assert!(ensure_within_size_limit(1, 0).is_err());
    }

    #[test]
    fn cleanup_job_borra_todo_y_tolera_llamadas_repetidas() {
        let tmp = TempDir::new().unwrap();
        let paths = prepare_job_paths("job-x", tmp.path()).unwrap();
        fs::write(paths.output_dir.join("results.json"), "{}").unwrap();

        cleanup_job(&paths);
        assert!(!paths.root.exists());
        cleanup_job(&paths);
    }

    #[test]
    fn cleanup_after_completion_elimina_intermedios() {
        let tmp = TempDir::new().unwrap();
        let paths = prepare_job_paths("job-clean", tmp.path()).unwrap();
        let cleaned = paths.output_dir.join("data_cleaned.csv");
        let sampled = paths.output_dir.join("data_sampled.csv");
        let results = paths.output_dir.join("results.json");
        fs::write(&cleaned, "c").unwrap();
        fs::write(&sampled, "s").unwrap();
        fs::write(&results, "{}").unwrap();
        let samples_dir = paths.output_dir.join("samples");
        fs::create_dir_all(&samples_dir).unwrap();
        fs::write(samples_dir.join("sample.csv"), "x").unwrap();

        assert!(cleanup_after_completion(&paths, false).is_empty());
        assert!(cleaned.exists());

        let removed = cleanup_after_completion(&paths, true);

        assert!(!cleaned.exists());
        assert!(!sampled.exists());
        assert!(!samples_dir.exists());
        assert!(results.exists());
        assert!(paths.plots_dir.exists());
        assert_eq!(removed.len(), 3);
    }

    #[test]
    fn barrido_ttl_respeta_el_corte() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let old_job = root.join("old");
        let recent_job = root.join("recent");
        fs::create_dir(&old_job).unwrap();
        fs::create_dir(&recent_job).unwrap();

        let reference = Utc::now();
        set_mtime(&old_job, reference - Duration::hours(2));
        set_mtime(&recent_job, reference - Duration::minutes(30));

        let deleted = sweep_expired_jobs(root, Some(1), reference);

        assert!(!old_job.exists());
        assert!(recent_job.exists());
        assert_eq!(deleted, vec![fs::canonicalize(root).unwrap().join("old")]);
    }

    #[test]
    fn barrido_borra_exactamente_en_el_limite() {
        let tmp = TempDir::new().unwrap();
        let job = tmp.path().join("edge");
        fs::create_dir(&job).unwrap();

        let reference = DateTime::<Utc>::from(SystemTime::UNIX_EPOCH)
            + Duration::seconds(1_704_067_200);
        set_mtime(&job, reference - Duration::hours(3));

        assert_eq!(sweep_expired_jobs(tmp.path(), Some(3), reference).len(), 1);
        assert!(!job.exists());
    }

    #[test]
    fn barrido_ttl_cero_borra_todo() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("a")).unwrap();
        fs::create_dir(tmp.path().join("b")).unwrap();
        fs::write(tmp.path().join("suelto.txt"), "no es un job").unwrap();

        let mut deleted = sweep_expired_jobs(tmp.path(), Some(0), Utc::now());
        deleted.sort();

        let base = fs::canonicalize(tmp.path()).unwrap();
        assert_eq!(deleted, vec![base.join("a"), base.join("b")]);
        assert!(tmp.path().join("suelto.txt").exists());
    }

    #[test]
    fn barrido_con_ttl_negativo_o_ausente_no_borra_nada() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("a")).unwrap();

        assert!(sweep_expired_jobs(tmp.path(), None, Utc::now()).is_empty());
        assert!(sweep_expired_jobs(tmp.path(), Some(-1), Utc::now()).is_empty());
        assert!(tmp.path().join("a").exists());
    }

    #[test]
    fn barrido_con_ttl_enorme_no_borra_nada() {
        let tmp = TempDir::new().unwrap();
        let job = tmp.path().join("a");
        fs::create_dir(&job).unwrap();
        set_mtime(&job, Utc::now() - Duration::days(365 * 50));

        assert!(sweep_expired_jobs(tmp.path(), Some(i64::MAX), Utc::now()).is_empty());
        assert!(sweep_expired_jobs(tmp.path(), Some(200_000_000), Utc::now()).is_empty());
        assert!(job.exists());
    }
}
