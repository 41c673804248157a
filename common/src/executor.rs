//! Frontera entre el runner y el motor de análisis.
//!
//! El runner sólo conoce el trait `Executor`: le pasa las rutas del job, el
//! payload resuelto y dos callbacks (progreso y guard). Lo que haga el
//! executor con los CSV es opaco para el ciclo de vida del job.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::job::{JobId, JobType};
use crate::storage::JobPaths;

/// Señal cooperativa que devuelve `guard()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    #[error("Job {0} cancelled")]
    Cancelled(JobId),

    #[error("Job {job_id} exceeded timeout of {timeout_secs}s")]
    TimedOut { job_id: JobId, timeout_secs: u64 },
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    Interrupted(#[from] Interrupt),

    #[error("{0:#}")]
    Failed(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Sección que se publica como `results.json`.
    pub normalized: Value,
    /// Salida cruda del análisis, usada para `results.txt`.
    pub raw: Value,
}

pub struct ExecutionContext<'a> {
    pub job_id: &'a str,
    pub job_type: JobType,
    pub paths: &'a JobPaths,
    pub payload: &'a Value,
    progress: &'a dyn Fn(f64, &str, Option<&str>),
    guard: &'a dyn Fn() -> Result<(), Interrupt>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        job_id: &'a str,
        job_type: JobType,
        paths: &'a JobPaths,
        payload: &'a Value,
        progress: &'a dyn Fn(f64, &str, Option<&str>),
        guard: &'a dyn Fn() -> Result<(), Interrupt>,
    ) -> Self {
        Self {
            job_id,
            job_type,
            paths,
            payload,
            progress,
            guard,
        }
    }

    pub fn progress(&self, percent: f64, step: &str, message: Option<&str>) {
        (self.progress)(percent, step, message)
    }

    /// Punto de control: cancelación o deadline vencido.
    pub fn guard(&self) -> Result<(), Interrupt> {
        (self.guard)()
    }

    fn payload_u64(&self, key: &str, default: u64) -> u64 {
        self.payload
            .get(key)
            .and_then(Value::as_u64)
            .filter(|v| *v > 0)
            .unwrap_or(default)
    }

    /// Como `payload_u64`, pero por encima de `MAX_ITERATIONS` el job falla.
    fn payload_iterations(&self, key: &str) -> anyhow::Result<u64> {
        let iterations = self.payload_u64(key, DEFAULT_ITERATIONS);
        if iterations > MAX_ITERATIONS {
            bail!("{} must be at most {} (got {})", key, MAX_ITERATIONS, iterations);
        }
        Ok(iterations)
    }

    fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }

    fn payload_bool(&self, key: &str, default: bool) -> bool {
        self.payload
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }
}

pub trait Executor: Send + Sync {
    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<ExecutionResult, ExecutionError>;

    /// Versión legible de la sección cruda; `None` si no hay nada que escribir.
    fn render_text(&self, _raw: &Value) -> Option<String> {
        None
    }
}

const DEFAULT_ITERATIONS: u64 = 5;
/// Tope para `bootstrapIterations` y `permutationCount`.
pub const MAX_ITERATIONS: u64 = 1_000_000;
/// Tope para `sampleSize`.
pub const MAX_SAMPLE_SIZE: u64 = 10_000_000;
const DEFAULT_ALPHA: f64 = 0.05;

/// Executor incorporado: estadística descriptiva, bootstrap del p95 y test de
/// permutación Kruskal-Wallis sobre los CSV del job.
#[derive(Debug, Clone)]
pub struct DescriptiveExecutor {
    seed: u64,
}

impl Default for DescriptiveExecutor {
    fn default() -> Self {
        Self { seed: 42 }
    }
}

impl DescriptiveExecutor {
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Summary {
    count: usize,
    min: f64,
    max: f64,
    mean: f64,
    median: f64,
    p95: f64,
}

impl Summary {
    fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        Some(Self {
            count: sorted.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
            median: percentile(&sorted, 0.5),
            p95: percentile(&sorted, 0.95),
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "count": self.count,
            "min": self.min,
            "max": self.max,
            "mean": self.mean,
            "median": self.median,
            "p95": self.p95,
        })
    }
}

/// Percentil con interpolación lineal sobre datos ya ordenados.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

fn p95_of(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile(&sorted, 0.95)
}

/// Primer campo numérico finito de cada fila; filas sin números (cabeceras
/// incluidas) se saltan.
fn read_values(path: &Path) -> anyhow::Result<Vec<f64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("no se pudo abrir {}", path.display()))?;

    let mut values = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("CSV inválido en {}", path.display()))?;
        if let Some(v) = record
            .iter()
            .filter_map(|field| field.trim().parse::<f64>().ok())
            .find(|v| v.is_finite())
        {
            values.push(v);
        }
    }
    Ok(values)
}

fn write_values(path: &Path, values: &[f64]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("no se pudo escribir {}", path.display()))?;
    writer.write_record(["value"])?;
    for v in values {
        writer.write_record([v.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

fn apply_bounds(values: Vec<f64>, lower: Option<f64>, upper: Option<f64>) -> Vec<f64> {
    values
        .into_iter()
        .filter(|v| lower.map_or(true, |lo| *v >= lo))
        .filter(|v| upper.map_or(true, |hi| *v <= hi))
        .collect()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}

/// Rangos promedio (los empates comparten el rango medio).
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Estadístico H de Kruskal-Wallis con corrección por empates. `sizes`
/// parte `pooled` en grupos consecutivos.
fn kruskal_h(pooled: &[f64], sizes: &[usize]) -> (f64, f64) {
    let n = pooled.len() as f64;
    let ranks = average_ranks(pooled);

    let mut offset = 0;
    let mut sum = 0.0;
    for size in sizes {
        let rank_sum: f64 = ranks[offset..offset + size].iter().sum();
        sum += rank_sum * rank_sum / *size as f64;
        offset += size;
    }
    let h = 12.0 / (n * (n + 1.0)) * sum - 3.0 * (n + 1.0);

    let mut sorted = pooled.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mut ties = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1] == sorted[i] {
            j += 1;
        }
        let t = (j - i + 1) as f64;
        ties += t * t * t - t;
        i = j + 1;
    }
    let correction = 1.0 - ties / (n * n * n - n);
    if correction <= 0.0 {
        return (0.0, correction);
    }
    (h / correction, correction)
}

struct LoadedInput {
    name: String,
    values: Vec<f64>,
}

impl DescriptiveExecutor {
    fn load_input(
        &self,
        ctx: &ExecutionContext<'_>,
        name: String,
        sources: &[PathBuf],
    ) -> anyhow::Result<LoadedInput> {
        let lower = ctx.payload_f64("outlierLowerBound");
        let upper = ctx.payload_f64("outlierUpperBound");

        let mut values = Vec::new();
        for source in sources {
            values.extend(read_values(source)?);
        }
        let values = apply_bounds(values, lower, upper);
        if values.is_empty() {
            bail!("No numeric values found for {}", name);
        }

        let cleaned = ctx.paths.output_dir.join(format!("{}_cleaned.csv", name));
        write_values(&cleaned, &values)?;
        debug!("{} valores limpios escritos en {}", values.len(), cleaned.display());

        Ok(LoadedInput { name, values })
    }

    fn run_bootstrap_flows(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> Result<ExecutionResult, ExecutionError> {
        ctx.progress(5.0, "prepare", Some("Preparing inputs"));
        ctx.guard()?;

        let mut inputs = Vec::new();
        for file in ["file1.csv", "file2.csv"] {
            let source = ctx.paths.input_dir.join(file);
            if source.exists() {
                inputs.push(self.load_input(ctx, file_stem(&source), &[source])?);
            }
        }
        if inputs.is_empty() {
            return Err(anyhow!("No input CSVs found for job.").into());
        }
        ctx.progress(25.0, "clean", Some("Inputs cleaned"));
        ctx.guard()?;

        let descriptive_enabled =
            ctx.payload_bool("descriptiveEnabled", true) || ctx.job_type == JobType::DescriptiveOnly;
        let mut descriptive = Map::new();
        if descriptive_enabled {
            for input in &inputs {
                if let Some(summary) = Summary::of(&input.values) {
                    descriptive.insert(input.name.clone(), summary.to_json());
                }
            }
            ctx.progress(40.0, "descriptive", Some("Descriptive analysis complete"));
            ctx.guard()?;
        }

        if ctx.job_type == JobType::DescriptiveOnly {
            let descriptive = Value::Object(descriptive);
            return Ok(ExecutionResult {
                normalized: self.normalized(ctx, Some(&descriptive), None),
                raw: json!({ "descriptive": descriptive }),
            });
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let samples = self.sample_inputs(ctx, &inputs, &mut rng)?;
        ctx.progress(50.0, "sampling", Some("Sampling ready"));
        ctx.guard()?;

        let iterations = ctx.payload_iterations("bootstrapIterations")?;
        let alpha = ctx.payload_f64("alpha").unwrap_or(DEFAULT_ALPHA);

        let mut replicates: Vec<f64> = Vec::new();
        for i in 0..iterations {
            ctx.guard()?;
            let stat = match samples.as_slice() {
                [single] => p95_of(&resample(single, &mut rng)),
                [first, second, ..] => {
                    p95_of(&resample(second, &mut rng)) - p95_of(&resample(first, &mut rng))
                }
                [] => return Err(anyhow!("No samples available for bootstrap.").into()),
            };
            replicates.push(stat);
            let percent = 50.0 + (i + 1) as f64 / iterations as f64 * 35.0;
            let message = format!("Bootstrap iteration {}/{}", i + 1, iterations);
            ctx.progress(percent, "bootstrap", Some(&message));
        }
        replicates.sort_by(f64::total_cmp);

        let ci = [
            percentile(&replicates, alpha / 2.0),
            percentile(&replicates, 1.0 - alpha / 2.0),
        ];
        let bootstrap = match samples.as_slice() {
            [single] => {
                let observed = p95_of(single);
                let threshold = ctx.payload_f64("threshold");
                // proporción de réplicas que no superan el umbral
                let p_value = threshold.map(|t| {
                    replicates.iter().filter(|r| **r <= t).count() as f64
                        / replicates.len() as f64
                });
                json!({
                    "mode": "single",
                    "iterations": iterations,
                    "alpha": alpha,
                    "observed_p95": observed,
                    "threshold": threshold,
                    "ci": ci,
                    "p_value": p_value,
                    "significant": p_value.map(|p| p < alpha),
                })
            }
            _ => {
                let observed = p95_of(&samples[1]) - p95_of(&samples[0]);
                json!({
                    "mode": "dual",
                    "iterations": iterations,
                    "alpha": alpha,
                    "observed_p95_diff": observed,
                    "ci": ci,
                    "significant": ci[0] > 0.0 || ci[1] < 0.0,
                })
            }
        };
        ctx.progress(85.0, "bootstrap", Some("Bootstrap complete"));

        let descriptive = (!descriptive.is_empty()).then_some(Value::Object(descriptive));
        let mut raw = json!({ "bootstrap": bootstrap });
        if let Some(d) = &descriptive {
            raw["descriptive"] = d.clone();
        }
        Ok(ExecutionResult {
            normalized: self.normalized(ctx, descriptive.as_ref(), Some(("bootstrap", &bootstrap))),
            raw,
        })
    }

    /// Submuestra sin reemplazo cuando `sampleSize` es menor que la entrada;
    /// la muestra queda en `<nombre>_sampled.csv`.
    fn sample_inputs(
        &self,
        ctx: &ExecutionContext<'_>,
        inputs: &[LoadedInput],
        rng: &mut StdRng,
    ) -> anyhow::Result<Vec<Vec<f64>>> {
        let sample_size = ctx
            .payload
            .get("sampleSize")
            .and_then(Value::as_u64)
            .filter(|s| *s > 0)
            .map(|s| s as usize);

        let mut samples = Vec::with_capacity(inputs.len());
        for input in inputs {
            let sample: Vec<f64> = match sample_size {
                Some(size) if size < input.values.len() => {
                    input.values.choose_multiple(rng, size).copied().collect()
                }
                _ => input.values.clone(),
            };
            let target = ctx
                .paths
                .output_dir
                .join(format!("{}_sampled.csv", input.name));
            write_values(&target, &sample)?;
            samples.push(sample);
        }
        Ok(samples)
    }

    fn run_kw_permutation(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> Result<ExecutionResult, ExecutionError> {
        ctx.progress(10.0, "prepare", Some("Preparing KW groups"));
        ctx.guard()?;

        let group_names: Vec<String> = ctx
            .payload
            .get("kwGroups")
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if group_names.is_empty() {
            return Err(anyhow!("KW permutation requires kwGroups in payload.").into());
        }

        let mut groups = Vec::with_capacity(group_names.len());
        for name in group_names {
            let group_dir = ctx.paths.input_dir.join(&name);
            let mut sources: Vec<PathBuf> = fs::read_dir(&group_dir)
                .with_context(|| format!("group {} not found in job inputs", name))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
                })
                .collect();
            sources.sort();
            groups.push(self.load_input(ctx, name, &sources)?);
            ctx.guard()?;
        }

        let sizes: Vec<usize> = groups.iter().map(|g| g.values.len()).collect();
        let mut pooled: Vec<f64> = groups.iter().flat_map(|g| g.values.clone()).collect();
        let (observed_h, tie_correction) = kruskal_h(&pooled, &sizes);

        let iterations = ctx.payload_iterations("permutationCount")?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut extreme = 0u64;
        for i in 0..iterations {
            ctx.guard()?;
            pooled.shuffle(&mut rng);
            let (h, _) = kruskal_h(&pooled, &sizes);
            if h >= observed_h {
                extreme += 1;
            }
            let percent = 10.0 + (i + 1) as f64 / iterations as f64 * 75.0;
            let message = format!("Permutation {}/{}", i + 1, iterations);
            ctx.progress(percent, "permutation", Some(&message));
        }
        let p_value = (extreme + 1) as f64 / (iterations + 1) as f64;
        let alpha = ctx.payload_f64("alpha").unwrap_or(DEFAULT_ALPHA);

        let mut summaries = Map::new();
        let mut summary_rows = Vec::with_capacity(groups.len());
        for group in &groups {
            if let Some(summary) = Summary::of(&group.values) {
                summaries.insert(group.name.clone(), summary.to_json());
                summary_rows.push((group.name.clone(), summary));
            }
        }

        let kw = json!({
            "iterations": iterations,
            "alpha": alpha,
            "observed_h": observed_h,
            "tie_correction": tie_correction,
            "p_value": p_value,
            "significant": p_value < alpha,
            "groups": summaries,
        });
        self.write_kw_reports(ctx, &kw, &summary_rows)?;
        ctx.progress(90.0, "finalize", Some("KW artifacts ready"));

        let raw = json!({
            "kw_permutation": {
                "p_value": p_value,
                "iterations": iterations,
                "observed_h": observed_h,
                "tie_correction": tie_correction,
            }
        });
        Ok(ExecutionResult {
            normalized: self.normalized(ctx, None, Some(("kwPermutation", &kw))),
            raw,
        })
    }

    fn write_kw_reports(
        &self,
        ctx: &ExecutionContext<'_>,
        report: &Value,
        rows: &[(String, Summary)],
    ) -> anyhow::Result<()> {
        let report_path = ctx.paths.output_dir.join("kw_report.json");
        fs::write(&report_path, serde_json::to_vec_pretty(report)?)?;

        let summary_path = ctx.paths.output_dir.join("kw_summary.csv");
        let mut writer = csv::Writer::from_path(&summary_path)?;
        writer.write_record(["group", "count", "mean", "median", "p95"])?;
        for (name, s) in rows {
            writer.write_record([
                name.clone(),
                s.count.to_string(),
                s.mean.to_string(),
                s.median.to_string(),
                s.p95.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    fn normalized(
        &self,
        ctx: &ExecutionContext<'_>,
        descriptive: Option<&Value>,
        analysis: Option<(&str, &Value)>,
    ) -> Value {
        let plots_requested = ctx
            .payload
            .get("plots")
            .and_then(Value::as_object)
            .is_some_and(|flags| flags.values().any(|v| v.as_bool() == Some(true)));

        let mut out = json!({
            "jobId": ctx.job_id,
            "jobType": ctx.job_type,
            "plots": { "requested": plots_requested, "files": [] },
        });
        if let Some(d) = descriptive {
            out["descriptive"] = d.clone();
        }
        if let Some((key, value)) = analysis {
            out[key] = value.clone();
        }
        out
    }

    fn write_log(&self, ctx: &ExecutionContext<'_>, result: &ExecutionResult) {
        if !ctx.payload_bool("createLog", false) {
            return;
        }
        let body = format!(
            "job {} ({})\n{}\n",
            ctx.job_id,
            ctx.job_type,
            self.render_text(&result.raw).unwrap_or_default()
        );
        if let Err(e) = fs::write(&ctx.paths.log_file, body) {
            warn!("no se pudo escribir {}: {}", ctx.paths.log_file.display(), e);
        }
    }
}

fn resample(values: &[f64], rng: &mut StdRng) -> Vec<f64> {
    (0..values.len())
        .map(|_| values[rng.gen_range(0..values.len())])
        .collect()
}

fn render_value(out: &mut String, indent: usize, key: &str, value: &Value) {
    let pad = "  ".repeat(indent);
    match value {
        Value::Object(map) => {
            out.push_str(&format!("{}{}:\n", pad, key));
            for (k, v) in map {
                render_value(out, indent + 1, k, v);
            }
        }
        Value::Array(items) => {
            let joined: Vec<String> = items.iter().map(Value::to_string).collect();
            out.push_str(&format!("{}{}: [{}]\n", pad, key, joined.join(", ")));
        }
        other => out.push_str(&format!("{}{}: {}\n", pad, key, other)),
    }
}

impl Executor for DescriptiveExecutor {
    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<ExecutionResult, ExecutionError> {
        let result = match ctx.job_type {
            JobType::KwPermutation => self.run_kw_permutation(ctx)?,
            _ => self.run_bootstrap_flows(ctx)?,
        };
        self.write_log(ctx, &result);
        Ok(result)
    }

    fn render_text(&self, raw: &Value) -> Option<String> {
        let map = raw.as_object().filter(|m| !m.is_empty())?;
        let mut out = String::new();
        for (key, value) in map {
            render_value(&mut out, 0, key, value);
        }
        Some(out)
    }
}
