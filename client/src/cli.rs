use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{ArtifactInfo, JobRecord, JobType};
use reqwest::{multipart, Client, Response};
use serde::Deserialize;
use serde_json::Value;
use std::{env, path::Path, path::PathBuf};

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un job nuevo con sus archivos de entrada
    Submit {
        /// BOOTSTRAP_SINGLE, BOOTSTRAP_DUAL, DESCRIPTIVE_ONLY o KW_PERMUTATION
        #[arg(value_name = "JOB_TYPE")]
        job_type: String,

        /// Overrides de configuración en JSON, ej. '{"cleanAll": true}'
        #[arg(long)]
        config: Option<String>,

        #[arg(long)]
        file1: Option<PathBuf>,

        #[arg(long)]
        file2: Option<PathBuf>,

        /// ZIP con los grupos para KW_PERMUTATION
        #[arg(long)]
        kw_bundle: Option<PathBuf>,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Cancela un job en cola o en ejecución
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Muestra results.json de un job completado
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los artefactos de salida, o descarga uno con --name
    Artifacts {
        #[arg(value_name = "JOB_ID")]
        id: String,

        #[arg(long)]
        name: Option<String>,

        /// Destino de la descarga (por defecto el nombre del artefacto)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Muestra la configuración por defecto
    Defaults,
}

#[derive(Deserialize)]
struct CreatedJob {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Deserialize)]
struct ArtifactList {
    artifacts: Vec<ArtifactInfo>,
}

/// Extrae "CODE: mensaje" del sobre de error del master.
fn describe_error(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(v) if v["error"]["code"].is_string() => format!(
            "{} ({}): {}",
            v["error"]["code"].as_str().unwrap_or_default(),
            status,
            v["error"]["message"].as_str().unwrap_or_default()
        ),
        _ => format!("status {}: {}", status, body),
    }
}

async fn check(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    bail!("Error del master: {}", describe_error(status, &body))
}

async fn file_part(path: &Path) -> Result<multipart::Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("no se pudo leer {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    Ok(multipart::Part::bytes(bytes).file_name(filename))
}

fn print_job(job: &JobRecord) {
    println!("Job:");
    println!("  id: {}", job.job_id);
    println!("  tipo: {}", job.job_type);
    println!("  estado: {}", job.status);
    match &job.progress.step {
        Some(step) => println!("  progreso: {:.1}% ({})", job.progress.percent, step),
        None => println!("  progreso: {:.1}%", job.progress.percent),
    }
    if let Some(msg) = &job.progress.message {
        println!("  mensaje: {}", msg);
    }
    println!("  creado: {}", job.created_at);
    if let Some(started) = &job.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(done) = &job.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(err) = &job.error {
        println!("  error: {}", err);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit {
            job_type,
            config,
            file1,
            file2,
            kw_bundle,
        } => {
            // validación local del tipo antes de subir archivos
            let job_type: JobType = job_type.parse()?;

            let mut form = multipart::Form::new().text("jobType", job_type.as_str());
            if let Some(config) = config {
                form = form.text("config", config);
            }
            for (field, path) in [("file1", file1), ("file2", file2), ("kwBundle", kw_bundle)] {
                if let Some(path) = path {
                    form = form.part(field, file_part(&path).await?);
                }
            }

            let url = format!("{}/api/v1/jobs", base_url);
            let resp = check(client.post(&url).multipart(form).send().await?).await?;
            let created: CreatedJob = resp.json().await?;

            println!("Job creado:");
            println!("  id: {}", created.job_id);
            println!("  tipo: {}", job_type);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/jobs/{}", base_url, id);
            let job: JobRecord = check(client.get(&url).send().await?).await?.json().await?;
            print_job(&job);
        }

        Commands::Cancel { id } => {
            let url = format!("{}/api/v1/jobs/{}/cancel", base_url, id);
            let job: JobRecord = check(client.post(&url).send().await?).await?.json().await?;
            println!("Cancelación aceptada.");
            print_job(&job);
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/jobs/{id}/results", base_url);
            let results: Value = check(client.get(&url).send().await?).await?.json().await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }

        Commands::Artifacts { id, name, output } => match name {
            None => {
                let url = format!("{}/api/v1/jobs/{id}/artifacts", base_url);
                let list: ArtifactList = check(client.get(&url).send().await?).await?.json().await?;
                if list.artifacts.is_empty() {
                    println!("  (sin artefactos)");
                } else {
                    println!("Artefactos para job {}:", id);
                    for a in list.artifacts {
                        println!("  - {} ({} bytes, {})", a.name, a.size_bytes, a.content_type);
                    }
                }
            }
            Some(name) => {
                let url = format!("{}/api/v1/jobs/{id}/artifacts/{name}", base_url);
                let bytes = check(client.get(&url).send().await?).await?.bytes().await?;
                let dest = output.unwrap_or_else(|| {
                    Path::new(&name)
                        .file_name()
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("artifact"))
                });
                tokio::fs::write(&dest, &bytes)
                    .await
                    .with_context(|| format!("no se pudo escribir {}", dest.display()))?;
                println!("Artefacto guardado en {} ({} bytes)", dest.display(), bytes.len());
            }
        },

        Commands::Defaults => {
            let url = format!("{}/api/v1/config/defaults", base_url);
            let defaults: Value = check(client.get(&url).send().await?).await?.json().await?;
            println!("{}", serde_json::to_string_pretty(&defaults)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_bien_formada() {
        Cli::command().debug_assert();
    }

    #[test]
    fn submit_acepta_archivos_y_config() {
        let cli = Cli::try_parse_from([
            "client",
            "submit",
            "KW_PERMUTATION",
            "--kw-bundle",
            "groups.zip",
            "--config",
            r#"{"permutationCount": 100}"#,
        ])
        .unwrap();
        match cli.command {
            Commands::Submit {
                job_type,
                kw_bundle,
                config,
                file1,
                ..
            } => {
                assert_eq!(job_type, "KW_PERMUTATION");
                assert_eq!(kw_bundle, Some(PathBuf::from("groups.zip")));
                assert!(config.unwrap().contains("permutationCount"));
                assert!(file1.is_none());
            }
            _ => panic!("se esperaba submit"),
        }
    }

    #[test]
    fn describe_error_usa_el_sobre_del_master() {
        let body = r#"{"error":{"code":"NOT_FOUND","message":"Job x not found.","details":{}},"requestId":"r"}"#;
        let text = describe_error(reqwest::StatusCode::NOT_FOUND, body);
        assert!(text.starts_with("NOT_FOUND"));
        assert!(text.ends_with("Job x not found."));

        let text = describe_error(reqwest::StatusCode::BAD_GATEWAY, "upstream caído");
        assert!(text.contains("502"));
    }
}
