use std::collections::{BTreeMap, HashMap};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::{Cadence, DatasetKind, Descriptor, Origin, ProductType};
use crate::error::CatalogError;
use crate::exporter::ExportSettings;
use crate::layout::DependencyTable;
use crate::scanner::DEFAULT_EXTENSION;

pub const DEFAULT_CONFIG_FILE: &str = "climdata.json";
pub const DEFAULT_WORKERS: usize = 4;
const MAX_WORKERS: usize = 16;

pub const REQUIRED_COLUMNS: &[&str] = &[
    "dataset",
    "dataset_type",
    "product_type",
    "temporal_resolution",
    "interpolation",
    "filename_variable",
    "output_path",
    "input_path",
    "cds_years_start",
    "cds_years_end",
];
pub const PROJECTION_COLUMNS: &[&str] = &["model", "experiment"];

/// Prefix of the columns forwarded to the remote request builder.
pub const REQUEST_PREFIX: &str = "cds_";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub requests_dir: Option<String>,
    #[serde(default)]
    pub catalogue_dir: Option<String>,
    #[serde(default)]
    pub provenance_dir: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub file_extension: Option<String>,
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetEntry>,
    #[serde(default)]
    pub derived_dependencies: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub export: Option<ExportSettings>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DatasetEntry {
    #[serde(default)]
    pub cadence: Option<Cadence>,
    #[serde(default)]
    pub catalogue_id: Option<String>,
}

/// Per-dataset fetch settings, resolved once and passed explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetProfile {
    pub cadence: Cadence,
    pub catalogue_id: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub requests_dir: Utf8PathBuf,
    pub catalogue_dir: Utf8PathBuf,
    pub provenance_dir: Utf8PathBuf,
    pub workers: usize,
    pub extension: String,
    pub datasets: BTreeMap<String, DatasetProfile>,
    pub dependencies: DependencyTable,
    pub export: ExportSettings,
}

impl ResolvedConfig {
    pub fn profile(&self, dataset: &str) -> DatasetProfile {
        self.datasets
            .get(dataset)
            .cloned()
            .unwrap_or_else(|| DatasetProfile {
                cadence: Cadence::Yearly,
                catalogue_id: dataset.to_string(),
            })
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CatalogError> {
        let config_path = Utf8PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));

        if path.is_none() && !config_path.as_std_path().exists() {
            return Err(CatalogError::MissingConfig);
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| CatalogError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CatalogError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Like [`ConfigLoader::resolve`], but an absent default file means defaults.
    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, CatalogError> {
        match Self::resolve(path) {
            Err(CatalogError::MissingConfig) => Self::resolve_config(Config::default()),
            other => other,
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CatalogError> {
        let datasets = config
            .datasets
            .into_iter()
            .map(|(name, entry)| {
                let profile = DatasetProfile {
                    cadence: entry.cadence.unwrap_or_default(),
                    catalogue_id: entry.catalogue_id.unwrap_or_else(|| name.clone()),
                };
                (name, profile)
            })
            .collect();

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            requests_dir: Utf8PathBuf::from(config.requests_dir.as_deref().unwrap_or("requests")),
            catalogue_dir: Utf8PathBuf::from(
                config.catalogue_dir.as_deref().unwrap_or("catalogues"),
            ),
            provenance_dir: Utf8PathBuf::from(
                config.provenance_dir.as_deref().unwrap_or("provenance"),
            ),
            workers: config
                .workers
                .unwrap_or(DEFAULT_WORKERS)
                .clamp(1, MAX_WORKERS),
            extension: config
                .file_extension
                .unwrap_or_else(|| DEFAULT_EXTENSION.to_string()),
            datasets,
            dependencies: DependencyTable::new(config.derived_dependencies),
            export: config.export.unwrap_or_default(),
        })
    }
}

/// One request-table row: the descriptor plus the raw `cds_*` request columns.
#[derive(Debug, Clone)]
pub struct RequestRow {
    pub descriptor: Descriptor,
    pub params: BTreeMap<String, String>,
}

/// All rows of one per-dataset request table.
#[derive(Debug, Clone)]
pub struct RequestTable {
    pub name: String,
    pub file: Utf8PathBuf,
    pub rows: Vec<RequestRow>,
}

impl RequestTable {
    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.rows.iter().map(|row| row.descriptor.clone()).collect()
    }
}

/// `*.csv` files in `dir`, sorted by name.
pub fn discover_request_tables(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, CatalogError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| CatalogError::Filesystem(format!("read {dir}: {err}")))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|_| CatalogError::Filesystem("non-utf8 request table path".to_string()))?;
        if path.is_file() && path.extension() == Some("csv") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn load_request_table(path: &Utf8Path) -> Result<RequestTable, CatalogError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path.as_std_path())
        .map_err(|_| CatalogError::ConfigRead(path.to_path_buf()))?;
    let headers = reader
        .headers()
        .map_err(|err| CatalogError::ConfigParse(format!("{path}: {err}")))?
        .clone();
    let columns: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(index, name)| (name, index))
        .collect();

    let mut missing = missing_columns(&columns, REQUIRED_COLUMNS);
    if !missing.is_empty() {
        return Err(CatalogError::ConfigSchema {
            file: path.to_string(),
            missing,
        });
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| CatalogError::ConfigParse(format!("{path}: {err}")))?;
        let field = |name: &str| {
            columns
                .get(name)
                .and_then(|index| record.get(*index))
                .unwrap_or_default()
        };

        let dataset_type: DatasetKind = field("dataset_type").parse()?;
        if dataset_type == DatasetKind::Projections {
            missing = missing_columns(&columns, PROJECTION_COLUMNS);
            if !missing.is_empty() {
                return Err(CatalogError::ConfigSchema {
                    file: path.to_string(),
                    missing,
                });
            }
        }

        let descriptor = Descriptor {
            dataset: field("dataset").to_string(),
            dataset_type,
            product_type: field("product_type").parse::<ProductType>()?,
            temporal_resolution: field("temporal_resolution").to_string(),
            interpolation: field("interpolation").to_string(),
            variable: field("filename_variable").to_string(),
            model: optional(field("model")),
            experiment: optional(field("experiment")),
            ensemble: optional(field("ensemble")),
            years_start: parse_year("cds_years_start", field("cds_years_start"))?,
            years_end: parse_year("cds_years_end", field("cds_years_end"))?,
            base_path: Utf8PathBuf::from(field("output_path")),
            origin: Origin::parse(field("input_path")),
        };
        descriptor.validate()?;

        let params = headers
            .iter()
            .zip(record.iter())
            .filter(|(name, _)| {
                name.starts_with(REQUEST_PREFIX) && !name.starts_with("cds_years_")
            })
            .map(|(name, value)| {
                (
                    name.trim_start_matches(REQUEST_PREFIX).to_string(),
                    value.to_string(),
                )
            })
            .collect();

        rows.push(RequestRow {
            descriptor,
            params,
        });
    }

    Ok(RequestTable {
        name: path.file_stem().unwrap_or_default().to_string(),
        file: path.to_path_buf(),
        rows,
    })
}

fn missing_columns(columns: &HashMap<&str, usize>, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !columns.contains_key(*name))
        .map(|name| name.to_string())
        .collect()
}

fn optional(value: &str) -> Option<String> {
    match value {
        "" | "None" | "none" | "nan" | "NaN" => None,
        other => Some(other.to_string()),
    }
}

fn parse_year(column: &str, value: &str) -> Result<i32, CatalogError> {
    value.parse().map_err(|_| CatalogError::InvalidField {
        column: column.to_string(),
        value: value.to_string(),
    })
}
