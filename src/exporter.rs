//! Catalogue tables and matrix artifacts.
//!
//! Tables are written one per (dataset, product type) and later unioned into
//! `all_catalogues.csv`. Year columns stay nullable integers end to end: an
//! absent year is an empty field, never `NaN` or `0`.

use std::fmt::Write as _;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use crate::catalog::{CatalogEntry, CatalogMatrix};
use crate::domain::{Cell, CoverageStatus, ProductType};
use crate::error::CatalogError;

pub const MERGED_TABLE: &str = "all_catalogues.csv";
pub const OVERVIEW_FILE: &str = "README.md";
const TABLE_SUFFIX: &str = "_catalogue.csv";

pub const TABLE_COLUMNS: [&str; 14] = [
    "variable",
    "model",
    "experiment",
    "dataset",
    "dataset_type",
    "product_type",
    "temporal_resolution",
    "interpolation",
    "data_path",
    "origin_path",
    "start_file_exists",
    "final_file_exists",
    "earliest_date",
    "latest_date",
];

/// Per-status text used by renderers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusStyle {
    pub complete: String,
    pub partial: String,
    pub missing: String,
}

impl StatusStyle {
    pub fn get(&self, status: CoverageStatus) -> &str {
        match status {
            CoverageStatus::Complete => &self.complete,
            CoverageStatus::Partial => &self.partial,
            CoverageStatus::Missing => &self.missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSettings {
    #[serde(default = "default_labels")]
    pub labels: StatusStyle,
    #[serde(default = "default_palette")]
    pub palette: StatusStyle,
    #[serde(default = "default_not_applicable")]
    pub not_applicable: String,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            labels: default_labels(),
            palette: default_palette(),
            not_applicable: default_not_applicable(),
        }
    }
}

fn default_labels() -> StatusStyle {
    StatusStyle {
        complete: "downloaded".to_string(),
        partial: "partial".to_string(),
        missing: "not_downloaded".to_string(),
    }
}

fn default_palette() -> StatusStyle {
    StatusStyle {
        complete: "#43A055".to_string(),
        partial: "#FF8000".to_string(),
        missing: "#FF0000".to_string(),
    }
}

fn default_not_applicable() -> String {
    "n/a".to_string()
}

/// Everything a renderer needs to draw one matrix.
pub struct MatrixArtifact<'a> {
    pub dataset: &'a str,
    pub product_type: ProductType,
    pub matrix: &'a CatalogMatrix,
    pub settings: &'a ExportSettings,
}

/// Turns a matrix into a report artifact. Plotting backends plug in here.
pub trait MatrixRenderer: Send + Sync {
    fn render(
        &self,
        artifact: &MatrixArtifact<'_>,
        out_dir: &Utf8Path,
    ) -> Result<Utf8PathBuf, CatalogError>;
}

/// Writes the grid as a CSV of status codes; not-applicable cells stay empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeGridRenderer;

impl MatrixRenderer for CodeGridRenderer {
    fn render(
        &self,
        artifact: &MatrixArtifact<'_>,
        out_dir: &Utf8Path,
    ) -> Result<Utf8PathBuf, CatalogError> {
        let path = out_dir.join(format!(
            "{}_{}_matrix.csv",
            artifact.dataset, artifact.product_type
        ));
        let mut writer = csv::Writer::from_path(path.as_std_path()).map_err(export_err)?;

        let mut header = vec!["simulation".to_string()];
        header.extend(
            artifact
                .matrix
                .columns()
                .into_iter()
                .map(|(variable, scenario)| format!("{variable}/{scenario}")),
        );
        writer.write_record(&header).map_err(export_err)?;

        for (index, row) in artifact.matrix.rows.iter().enumerate() {
            let mut record = vec![row.clone()];
            record.extend(
                artifact
                    .matrix
                    .row_cells(index)
                    .iter()
                    .map(|cell| cell.code().map(|code| code.to_string()).unwrap_or_default()),
            );
            writer.write_record(&record).map_err(export_err)?;
        }
        writer
            .flush()
            .map_err(|err| CatalogError::Export(err.to_string()))?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportArtifacts {
    pub table: String,
    pub matrix: String,
}

#[derive(Debug, Clone)]
pub struct MergedCatalog {
    pub path: Utf8PathBuf,
    pub entries: Vec<CatalogEntry>,
}

pub struct CatalogExporter {
    out_dir: Utf8PathBuf,
    settings: ExportSettings,
    renderer: Box<dyn MatrixRenderer>,
}

impl CatalogExporter {
    pub fn new(out_dir: Utf8PathBuf, settings: ExportSettings) -> Self {
        Self::with_renderer(out_dir, settings, Box::new(CodeGridRenderer))
    }

    pub fn with_renderer(
        out_dir: Utf8PathBuf,
        settings: ExportSettings,
        renderer: Box<dyn MatrixRenderer>,
    ) -> Self {
        Self {
            out_dir,
            settings,
            renderer,
        }
    }

    pub fn out_dir(&self) -> &Utf8Path {
        &self.out_dir
    }

    pub fn export(
        &self,
        entries: &[CatalogEntry],
        matrix: &CatalogMatrix,
        dataset: &str,
        product_type: ProductType,
    ) -> Result<ExportArtifacts, CatalogError> {
        fs::create_dir_all(self.out_dir.as_std_path())
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;

        let table = self
            .out_dir
            .join(format!("{dataset}_{product_type}{TABLE_SUFFIX}"));
        write_table(&table, entries)?;

        let artifact = MatrixArtifact {
            dataset,
            product_type,
            matrix,
            settings: &self.settings,
        };
        let rendered = self.renderer.render(&artifact, &self.out_dir)?;
        info!("exported {table} and {rendered}");

        Ok(ExportArtifacts {
            table: table.into_string(),
            matrix: rendered.into_string(),
        })
    }

    /// Union the given per-run tables, in order, into [`MERGED_TABLE`].
    ///
    /// Only tables written by the current run are passed in, so tables left
    /// behind by earlier runs never reach the merged catalogue.
    pub fn merge(&self, tables: &[Utf8PathBuf]) -> Result<MergedCatalog, CatalogError> {
        fs::create_dir_all(self.out_dir.as_std_path())
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;

        let mut merged = Vec::new();
        for table in tables {
            merged.extend(read_table(table)?);
        }

        let path = self.out_dir.join(MERGED_TABLE);
        write_table(&path, &merged)?;
        info!("merged {} tables into {path}", tables.len());
        Ok(MergedCatalog {
            path,
            entries: merged,
        })
    }

    /// Markdown overview: one section per matrix plus the merged table.
    pub fn write_overview(
        &self,
        matrices: &[(String, ProductType, &CatalogMatrix)],
        merged: &MergedCatalog,
    ) -> Result<Utf8PathBuf, CatalogError> {
        let mut doc = String::from("# Catalogue Overview\n\n");
        let _ = writeln!(doc, "Legend:\n");
        for status in [
            CoverageStatus::Complete,
            CoverageStatus::Partial,
            CoverageStatus::Missing,
        ] {
            let _ = writeln!(
                doc,
                "- `{}` {} ({})",
                status.code(),
                self.settings.labels.get(status),
                self.settings.palette.get(status)
            );
        }
        doc.push('\n');

        for (dataset, product_type, matrix) in matrices {
            let _ = writeln!(doc, "## {dataset} {product_type}\n");
            let mut header = vec!["simulation".to_string()];
            header.extend(
                matrix
                    .columns()
                    .into_iter()
                    .map(|(variable, scenario)| format!("{variable} {scenario}")),
            );
            let rows = matrix
                .rows
                .iter()
                .enumerate()
                .map(|(index, row)| {
                    let mut cells = vec![row.clone()];
                    cells.extend(matrix.row_cells(index).iter().map(|cell| match cell {
                        Cell::Status(status) => self.settings.labels.get(*status).to_string(),
                        Cell::NotApplicable => self.settings.not_applicable.clone(),
                    }));
                    cells
                })
                .collect::<Vec<_>>();
            push_markdown_table(&mut doc, &header, &rows);
            doc.push('\n');
        }

        let _ = writeln!(doc, "## All Catalogues Table\n");
        let header = TABLE_COLUMNS.iter().map(|name| name.to_string()).collect::<Vec<_>>();
        let rows = merged.entries.iter().map(entry_fields).collect::<Vec<_>>();
        push_markdown_table(&mut doc, &header, &rows);

        let path = self.out_dir.join(OVERVIEW_FILE);
        fs::write(path.as_std_path(), doc).map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        Ok(path)
    }
}

pub fn write_table(path: &Utf8Path, entries: &[CatalogEntry]) -> Result<(), CatalogError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path.as_std_path())
        .map_err(export_err)?;
    writer.write_record(TABLE_COLUMNS).map_err(export_err)?;
    for entry in entries {
        writer.serialize(entry).map_err(export_err)?;
    }
    writer
        .flush()
        .map_err(|err| CatalogError::Export(err.to_string()))?;
    Ok(())
}

pub fn read_table(path: &Utf8Path) -> Result<Vec<CatalogEntry>, CatalogError> {
    let mut reader = csv::Reader::from_path(path.as_std_path()).map_err(export_err)?;
    reader
        .deserialize()
        .map(|record| record.map_err(|err| CatalogError::Export(format!("{path}: {err}"))))
        .collect()
}

/// Year columns: empty, `NaN`, `None` and `<NA>` are null; `2001.0` is 2001.
pub fn nullable_year<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = raw.trim();
    if matches!(value, "" | "NaN" | "nan" | "None" | "<NA>") {
        return Ok(None);
    }
    let integral = value.strip_suffix(".0").unwrap_or(value);
    integral
        .parse()
        .map(Some)
        .map_err(|_| serde::de::Error::custom(format!("invalid year: {value}")))
}

fn entry_fields(entry: &CatalogEntry) -> Vec<String> {
    let year = |value: Option<i32>| value.map(|year| year.to_string()).unwrap_or_default();
    vec![
        entry.variable.clone(),
        entry.model.clone().unwrap_or_default(),
        entry.experiment.clone().unwrap_or_default(),
        entry.dataset.clone(),
        entry.dataset_type.to_string(),
        entry.product_type.to_string(),
        entry.temporal_resolution.clone(),
        entry.interpolation.clone(),
        entry.data_path.clone(),
        entry.origin_path.clone(),
        entry.start_file_exists.to_string(),
        entry.final_file_exists.to_string(),
        year(entry.earliest_date),
        year(entry.latest_date),
    ]
}

fn push_markdown_table(doc: &mut String, header: &[String], rows: &[Vec<String>]) {
    let _ = writeln!(doc, "| {} |", header.join(" | "));
    let _ = writeln!(
        doc,
        "|{}",
        header.iter().map(|_| " --- |").collect::<String>()
    );
    for row in rows {
        let _ = writeln!(doc, "| {} |", row.join(" | "));
    }
}

fn export_err(err: csv::Error) -> CatalogError {
    CatalogError::Export(err.to_string())
}
