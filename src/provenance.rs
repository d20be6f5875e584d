//! Provenance coverage of the request tables.
//!
//! Each request table `{name}.csv` is expected to come with a provenance
//! document `{name}.json` somewhere under the provenance directory. The
//! document must describe every raw variable the table requests.
//!
//! Provenance documents are hand-written, so variable names are collected
//! leniently: from top-level keys mentioning `raw` or `variable`, from the
//! usual input sections, and as a last resort from any list of records
//! carrying a `name`, `variable` or `id` field.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write as _};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::load_request_table;
use crate::domain::ProductType;
use crate::error::CatalogError;

const NAME_KEYS: [&str; 4] = ["name", "variable", "id", "var"];
const RECORD_KEYS: [&str; 3] = ["name", "variable", "id"];
const INPUT_KEYS: [&str; 4] = ["input", "inputs", "data", "raw_data"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceStatus {
    Ok,
    ExtraVarsInJson,
    VarsMissingInJson,
    MissingProvenance,
    InvalidJson,
    InvalidTable,
}

impl ProvenanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvenanceStatus::Ok => "ok",
            ProvenanceStatus::ExtraVarsInJson => "extra_vars_in_json",
            ProvenanceStatus::VarsMissingInJson => "vars_missing_in_json",
            ProvenanceStatus::MissingProvenance => "missing_provenance",
            ProvenanceStatus::InvalidJson => "invalid_json",
            ProvenanceStatus::InvalidTable => "invalid_table",
        }
    }

    /// Extra documented variables are informational only.
    pub fn is_problem(&self) -> bool {
        !matches!(self, ProvenanceStatus::Ok | ProvenanceStatus::ExtraVarsInJson)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvenanceCheck {
    pub dataset: String,
    pub table: String,
    pub provenance: Option<String>,
    pub candidates: Vec<String>,
    pub status: ProvenanceStatus,
    /// Raw variables of the table the document does not describe.
    pub undocumented: Vec<String>,
    /// Variables the document describes that the table never requests.
    pub extra: Vec<String>,
    pub message: Option<String>,
}

impl ProvenanceCheck {
    fn new(table: &Utf8Path, candidates: &[Utf8PathBuf]) -> Self {
        Self {
            dataset: table.file_stem().unwrap_or_default().to_string(),
            table: table.to_string(),
            provenance: None,
            candidates: candidates.iter().map(ToString::to_string).collect(),
            status: ProvenanceStatus::Ok,
            undocumented: Vec::new(),
            extra: Vec::new(),
            message: None,
        }
    }

    fn failed(mut self, status: ProvenanceStatus, message: String) -> Self {
        warn!("{}: {message}", self.table);
        self.status = status;
        self.message = Some(message);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvenanceReport {
    pub datasets_checked: usize,
    pub missing_provenance: usize,
    pub undocumented_variables: usize,
    pub results: Vec<ProvenanceCheck>,
}

impl ProvenanceReport {
    pub fn has_problems(&self) -> bool {
        self.results.iter().any(|check| check.status.is_problem())
    }
}

/// Every `.json` file under `dir`, sorted. A missing directory has none.
pub fn discover_documents(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, CatalogError> {
    let mut documents = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = match fs::read_dir(current.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(CatalogError::Filesystem(format!("read {current}: {err}"))),
        };
        for entry in entries {
            let entry = entry.map_err(|err| CatalogError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if path.is_dir() {
                pending.push(path);
            } else if path.extension() == Some("json") {
                documents.push(path);
            }
        }
    }
    documents.sort();
    Ok(documents)
}

/// Documents named exactly after the dataset; failing that, every document
/// whose name contains it.
pub fn candidates_for(dataset: &str, documents: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    let stem = |path: &Utf8PathBuf| path.file_stem().unwrap_or_default().to_string();
    let exact = documents
        .iter()
        .filter(|path| stem(path) == dataset)
        .cloned()
        .collect::<Vec<_>>();
    if !exact.is_empty() {
        return exact;
    }
    let needle = dataset.to_lowercase();
    documents
        .iter()
        .filter(|path| stem(path).to_lowercase().contains(&needle))
        .cloned()
        .collect()
}

/// Variable names described by a provenance document.
pub fn described_variables(document: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    if let Value::Object(map) = document {
        for (key, value) in map {
            let key = key.to_lowercase();
            if key.contains("raw") || key.contains("variable") || INPUT_KEYS.contains(&key.as_str())
            {
                collect_names(value, &mut names);
            }
        }
    }
    if names.is_empty() {
        collect_records(document, &mut names);
    }
    names
}

fn collect_names(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(name) => {
                        names.insert(name.clone());
                    }
                    Value::Object(record) => {
                        if let Some(name) = record_name(record) {
                            names.insert(name);
                        }
                    }
                    _ => {}
                }
            }
        }
        Value::Object(map) => {
            for (key, value) in map {
                if value.is_string() || value.is_object() {
                    names.insert(key.clone());
                }
            }
        }
        _ => {}
    }
}

fn collect_records(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                let Value::Object(record) = item else {
                    continue;
                };
                if !RECORD_KEYS.iter().any(|key| record.contains_key(*key)) {
                    continue;
                }
                if let Some(name) = record_name(record) {
                    names.insert(name);
                }
            }
        }
        Value::Object(map) => {
            for value in map.values() {
                collect_records(value, names);
            }
        }
        _ => {}
    }
}

/// `{"name": "t2m", ...}` or the single-pair form `{"t2m": "2 m temperature"}`.
fn record_name(record: &Map<String, Value>) -> Option<String> {
    NAME_KEYS
        .iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .or_else(|| match record.iter().next() {
            Some((key, Value::String(_))) if record.len() == 1 => Some(key.clone()),
            _ => None,
        })
}

/// Check one request table against the provenance documents.
pub fn check_table(table: &Utf8Path, documents: &[Utf8PathBuf]) -> ProvenanceCheck {
    let dataset = table.file_stem().unwrap_or_default();
    let candidates = candidates_for(dataset, documents);
    let mut check = ProvenanceCheck::new(table, &candidates);

    let Some(document) = candidates.first() else {
        return check.failed(
            ProvenanceStatus::MissingProvenance,
            format!("no provenance document for {dataset}"),
        );
    };
    check.provenance = Some(document.to_string());

    let requested = match load_request_table(table) {
        Ok(loaded) => loaded
            .rows
            .iter()
            .filter(|row| row.descriptor.product_type == ProductType::Raw)
            .map(|row| row.descriptor.variable.clone())
            .collect::<BTreeSet<_>>(),
        Err(err) => return check.failed(ProvenanceStatus::InvalidTable, err.to_string()),
    };

    let parsed = fs::read_to_string(document.as_std_path())
        .map_err(|err| err.to_string())
        .and_then(|content| {
            serde_json::from_str::<Value>(&content).map_err(|err| err.to_string())
        });
    let described = match parsed {
        Ok(value) => described_variables(&value),
        Err(message) => {
            return check.failed(ProvenanceStatus::InvalidJson, format!("{document}: {message}"));
        }
    };

    check.undocumented = requested.difference(&described).cloned().collect();
    check.extra = described.difference(&requested).cloned().collect();
    check.status = if !check.undocumented.is_empty() {
        warn!(
            "{dataset}: {} raw variable(s) not described in {document}: {}",
            check.undocumented.len(),
            check.undocumented.join(", ")
        );
        ProvenanceStatus::VarsMissingInJson
    } else if !check.extra.is_empty() {
        info!(
            "{dataset}: {document} also describes {}",
            check.extra.join(", ")
        );
        ProvenanceStatus::ExtraVarsInJson
    } else {
        ProvenanceStatus::Ok
    };
    check
}

pub fn check_tables(tables: &[Utf8PathBuf], documents: &[Utf8PathBuf]) -> ProvenanceReport {
    let results = tables
        .iter()
        .map(|table| check_table(table, documents))
        .collect::<Vec<_>>();
    ProvenanceReport {
        datasets_checked: results.len(),
        missing_provenance: results
            .iter()
            .filter(|check| check.status == ProvenanceStatus::MissingProvenance)
            .count(),
        undocumented_variables: results.iter().map(|check| check.undocumented.len()).sum(),
        results,
    }
}

/// Write the report as pretty JSON, replacing `path` in one step.
pub fn write_report(report: &ProvenanceReport, path: &Utf8Path) -> Result<(), CatalogError> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|err| CatalogError::Export(err.to_string()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(directory.as_std_path())
        .map_err(|err| CatalogError::Filesystem(format!("create {directory}: {err}")))?;
    let mut file = tempfile::NamedTempFile::new_in(directory.as_std_path())
        .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
    file.write_all(json.as_bytes())
        .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
    file.persist(path.as_std_path())
        .map_err(|err| CatalogError::Filesystem(err.error.to_string()))?;
    Ok(())
}
