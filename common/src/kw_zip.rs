//! Validación de bundles ZIP para jobs KW_PERMUTATION.
//!
//! Dos layouts aceptados:
//! - `A` (Nested): una carpeta por grupo, con uno o más CSV dentro.
//! - `B` (Flat): un CSV por grupo en la raíz del ZIP.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zip::ZipArchive;

use crate::error::{JobError, Result};
use crate::storage::safe_join;

const MAX_GROUP_NAME_LEN: usize = 64;
const MACOS_METADATA_DIR: &str = "__MACOSX";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KwLayout {
    #[serde(rename = "A")]
    Nested,
    #[serde(rename = "B")]
    Flat,
}

impl KwLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            KwLayout::Nested => "A",
            KwLayout::Flat => "B",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KwGroup {
    pub name: String,
    /// Rutas dentro del ZIP, ordenadas.
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KwZipLayout {
    pub layout: KwLayout,
    pub groups: Vec<KwGroup>,
}

impl KwZipLayout {
    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KwZipErrorCode {
    InvalidZip,
    InvalidLayout,
    MixedLayout,
    DuplicateGroupName,
    InsufficientGroups,
    EmptyGroup,
    InvalidGroupName,
}

impl KwZipErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KwZipErrorCode::InvalidZip => "INVALID_ZIP",
            KwZipErrorCode::InvalidLayout => "INVALID_KW_ZIP_LAYOUT",
            KwZipErrorCode::MixedLayout => "MIXED_KW_ZIP_LAYOUT",
            KwZipErrorCode::DuplicateGroupName => "DUPLICATE_GROUP_NAME",
            KwZipErrorCode::InsufficientGroups => "INSUFFICIENT_GROUPS",
            KwZipErrorCode::EmptyGroup => "EMPTY_GROUP",
            KwZipErrorCode::InvalidGroupName => "INVALID_GROUP_NAME",
        }
    }
}

impl fmt::Display for KwZipErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct KwZipError {
    pub code: KwZipErrorCode,
    pub message: String,
    /// Grupos implicados (sólo para `EMPTY_GROUP`).
    pub groups: Vec<String>,
}

impl KwZipError {
    fn new(code: KwZipErrorCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            groups: Vec::new(),
        }
    }

    fn duplicate() -> Self {
        Self::new(
            KwZipErrorCode::DuplicateGroupName,
            "Group names collide after sanitization.",
        )
    }
}

/// trim, `[^A-Za-z0-9._-]` -> `_`, colapsa `_` repetidos, quita `_` de los
/// extremos y recorta a 64 caracteres.
pub fn sanitize_group_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('_').chars().take(MAX_GROUP_NAME_LEN).collect()
}

/// Componentes de una ruta del ZIP, sin vacíos ni `.`.
fn entry_parts(name: &str) -> Vec<&str> {
    name.split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect()
}

fn is_ignored(name: &str, parts: &[&str]) -> bool {
    name.starts_with(&format!("{}/", MACOS_METADATA_DIR))
        || parts.iter().any(|p| p.starts_with('.'))
}

fn is_csv(parts: &[&str]) -> bool {
    parts
        .last()
        .and_then(|file| Path::new(file).extension())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

fn open_archive(raw: &[u8]) -> std::result::Result<ZipArchive<Cursor<&[u8]>>, KwZipError> {
    ZipArchive::new(Cursor::new(raw)).map_err(|_| {
        KwZipError::new(
            KwZipErrorCode::InvalidZip,
            "kwBundle must be a valid ZIP archive.",
        )
    })
}

/// Inspecciona el ZIP y devuelve el layout detectado con sus grupos
/// ordenados por nombre (y archivos ordenados dentro de cada grupo).
pub fn validate_kw_zip(raw: &[u8]) -> std::result::Result<KwZipLayout, KwZipError> {
    let mut archive = open_archive(raw)?;

    let mut csv_entries: Vec<String> = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|_| {
            KwZipError::new(
                KwZipErrorCode::InvalidZip,
                "kwBundle must be a valid ZIP archive.",
            )
        })?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let parts = entry_parts(&name);
        if parts.is_empty() || is_ignored(&name, &parts) || !is_csv(&parts) {
            continue;
        }
        csv_entries.push(name);
    }

    if csv_entries.is_empty() {
        return Err(KwZipError::new(
            KwZipErrorCode::InvalidLayout,
            "ZIP must include at least two CSV files.",
        ));
    }

    let has_folder_csv = csv_entries.iter().any(|n| entry_parts(n).len() > 1);
    let has_root_csv = csv_entries.iter().any(|n| entry_parts(n).len() == 1);
    if has_folder_csv && has_root_csv {
        return Err(KwZipError::new(
            KwZipErrorCode::MixedLayout,
            "Do not mix root-level CSVs with grouped folders.",
        ));
    }

    let layout = if has_folder_csv {
        KwLayout::Nested
    } else {
        KwLayout::Flat
    };

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    // clave en minúsculas -> nombre original que la produjo
    let mut sources: BTreeMap<String, String> = BTreeMap::new();

    for name in &csv_entries {
        let parts = entry_parts(name);
        let raw_group = match layout {
            KwLayout::Nested => parts[0].to_string(),
            KwLayout::Flat => {
                let file = parts[parts.len() - 1];
                Path::new(file)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            }
        };

        let group = sanitize_group_name(&raw_group);
        let key = group.to_lowercase();
        match sources.get(&key) {
            Some(previous) if *previous != raw_group => return Err(KwZipError::duplicate()),
            Some(_) => {}
            None => {
                sources.insert(key, raw_group);
            }
        }
        groups.entry(group).or_default().push(name.clone());
    }

    ensure_group_rules(&groups)?;

    let groups: Vec<KwGroup> = groups
        .into_iter()
        .map(|(name, mut files)| {
            files.sort();
            KwGroup { name, files }
        })
        .collect();

    debug!(
        "bundle KW válido: layout {} con {} grupos",
        layout.as_str(),
        groups.len()
    );
    Ok(KwZipLayout { layout, groups })
}

fn ensure_group_rules(
    groups: &BTreeMap<String, Vec<String>>,
) -> std::result::Result<(), KwZipError> {
    if groups.keys().any(|k| k.is_empty()) {
        return Err(KwZipError::new(
            KwZipErrorCode::InvalidGroupName,
            "Group names cannot be empty after sanitization.",
        ));
    }

    let mut lowered: Vec<String> = groups.keys().map(|k| k.to_lowercase()).collect();
    lowered.sort();
    lowered.dedup();
    if lowered.len() != groups.len() {
        return Err(KwZipError::duplicate());
    }

    // la extracción aplana cada grupo en una sola carpeta
    let clashing: Vec<String> = groups
        .iter()
        .filter(|(_, files)| {
            let mut names: Vec<String> = files
                .iter()
                .filter_map(|f| entry_parts(f).last().map(|s| s.to_lowercase()))
                .collect();
            names.sort();
            let total = names.len();
            names.dedup();
            names.len() != total
        })
        .map(|(name, _)| name.clone())
        .collect();
    if !clashing.is_empty() {
        let mut err = KwZipError::new(
            KwZipErrorCode::InvalidLayout,
            "CSV file names must be unique within a group.",
        );
        err.groups = clashing;
        return Err(err);
    }

    if groups.len() < 2 {
        return Err(KwZipError::new(
            KwZipErrorCode::InsufficientGroups,
            "At least two groups are required.",
        ));
    }

    let empty: Vec<String> = groups
        .iter()
        .filter(|(_, files)| files.is_empty())
        .map(|(name, _)| name.clone())
        .collect();
    if !empty.is_empty() {
        let mut err = KwZipError::new(
            KwZipErrorCode::EmptyGroup,
            "Each group must include at least one CSV file.",
        );
        err.groups = empty;
        return Err(err);
    }

    Ok(())
}

/// Materializa cada grupo validado en `input_dir/<grupo>/<archivo>.csv`.
///
/// El total descomprimido no puede pasar de `max_bytes`.
pub fn extract_kw_bundle(
    raw: &[u8],
    layout: &KwZipLayout,
    input_dir: &Path,
    max_bytes: u64,
) -> Result<()> {
    let mut archive = open_archive(raw)?;
    let mut remaining = max_bytes;

    for group in &layout.groups {
        let group_dir = safe_join(input_dir, [&group.name])?;
        fs::create_dir_all(&group_dir)?;

        for entry_name in &group.files {
            let file_name = entry_parts(entry_name)
                .last()
                .map(|s| s.to_string())
                .unwrap_or_default();
            let target = safe_join(&group_dir, [&file_name])?;

            let entry = archive.by_name(entry_name).map_err(|_| {
                JobError::Bundle(KwZipError::new(
                    KwZipErrorCode::InvalidZip,
                    "kwBundle must be a valid ZIP archive.",
                ))
            })?;
            // el tamaño declarado puede mentir: se corta igual al copiar
            if entry.size() > remaining {
                return Err(extracted_too_large(max_bytes));
            }
            let mut limited = entry.take(remaining.saturating_add(1));
            let mut out = fs::File::create(&target)?;
            let written = io::copy(&mut limited, &mut out)?;
            if written > remaining {
                return Err(extracted_too_large(max_bytes));
            }
            remaining -= written;
        }
    }

    debug!(
        "bundle KW extraído en {} ({} grupos, {} bytes)",
        input_dir.display(),
        layout.groups.len(),
        max_bytes - remaining
    );
    Ok(())
}

fn extracted_too_large(max_bytes: u64) -> JobError {
    JobError::validation(
        "PAYLOAD_TOO_LARGE",
        format!(
            "Extracted kwBundle exceeds the limit of {} bytes.",
            max_bytes
        ),
    )
}
