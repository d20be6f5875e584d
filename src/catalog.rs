use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{Cell, CoverageStatus, DatasetKind, Descriptor, ProductType};
use crate::layout;
use crate::scanner::{ArchiveScanner, Coverage};

/// One row of the exported catalogue table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub variable: String,
    pub model: Option<String>,
    pub experiment: Option<String>,
    pub dataset: String,
    pub dataset_type: DatasetKind,
    pub product_type: ProductType,
    pub temporal_resolution: String,
    pub interpolation: String,
    pub data_path: String,
    pub origin_path: String,
    pub start_file_exists: bool,
    pub final_file_exists: bool,
    #[serde(deserialize_with = "crate::exporter::nullable_year")]
    pub earliest_date: Option<i32>,
    #[serde(deserialize_with = "crate::exporter::nullable_year")]
    pub latest_date: Option<i32>,
}

impl CatalogEntry {
    pub fn status(&self) -> CoverageStatus {
        CoverageStatus::classify(
            self.start_file_exists,
            self.final_file_exists,
            self.earliest_date,
        )
    }
}

/// Simulation × (variable, scenario) grid of coverage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogMatrix {
    pub rows: Vec<String>,
    pub variables: Vec<String>,
    pub scenarios: Vec<String>,
    cells: Vec<Cell>,
}

impl CatalogMatrix {
    fn empty(rows: Vec<String>, variables: Vec<String>, scenarios: Vec<String>) -> Self {
        let size = rows.len() * variables.len() * scenarios.len();
        Self {
            rows,
            variables,
            scenarios,
            cells: vec![Cell::NotApplicable; size],
        }
    }

    /// Column headers, variable-major.
    pub fn columns(&self) -> Vec<(String, String)> {
        self.variables
            .iter()
            .flat_map(|variable| {
                self.scenarios
                    .iter()
                    .map(move |scenario| (variable.clone(), scenario.clone()))
            })
            .collect()
    }

    pub fn width(&self) -> usize {
        self.variables.len() * self.scenarios.len()
    }

    pub fn row_cells(&self, row: usize) -> &[Cell] {
        let width = self.width();
        &self.cells[row * width..(row + 1) * width]
    }

    pub fn cell(&self, row: &str, variable: &str, scenario: &str) -> Option<Cell> {
        let index = self.index_of(row, variable, scenario)?;
        self.cells.get(index).copied()
    }

    fn index_of(&self, row: &str, variable: &str, scenario: &str) -> Option<usize> {
        let r = self.rows.iter().position(|value| value == row)?;
        let v = self.variables.iter().position(|value| value == variable)?;
        let s = self.scenarios.iter().position(|value| value == scenario)?;
        Some(r * self.width() + v * self.scenarios.len() + s)
    }

    /// Several entries in one cell keep the worst status.
    fn merge(&mut self, row: &str, variable: &str, scenario: &str, status: CoverageStatus) {
        let Some(index) = self.index_of(row, variable, scenario) else {
            return;
        };
        self.cells[index] = match self.cells[index] {
            Cell::Status(existing) => Cell::Status(existing.max(status)),
            Cell::NotApplicable => Cell::Status(status),
        };
    }
}

/// Catalog of one (dataset, product type) pair.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogRun {
    pub dataset: String,
    pub product_type: ProductType,
    pub kind: DatasetKind,
    pub entries: Vec<CatalogEntry>,
    pub matrix: CatalogMatrix,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogSummary {
    pub complete: usize,
    pub partial: usize,
    pub missing: usize,
}

impl CatalogSummary {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a CatalogEntry>) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            match entry.status() {
                CoverageStatus::Complete => summary.complete += 1,
                CoverageStatus::Partial => summary.partial += 1,
                CoverageStatus::Missing => summary.missing += 1,
            }
        }
        summary
    }

    pub fn absorb(&mut self, other: CatalogSummary) {
        self.complete += other.complete;
        self.partial += other.partial;
        self.missing += other.missing;
    }
}

/// Derives coverage for descriptors from what is on disk. Read-only.
#[derive(Debug, Clone, Default)]
pub struct CatalogBuilder {
    scanner: ArchiveScanner,
}

impl CatalogBuilder {
    pub fn new(scanner: ArchiveScanner) -> Self {
        Self { scanner }
    }

    /// One run per (dataset, product type), in first-seen order.
    pub fn build(&self, descriptors: &[Descriptor]) -> Vec<CatalogRun> {
        let mut order: Vec<(String, ProductType)> = Vec::new();
        let mut groups: HashMap<(String, ProductType), Vec<&Descriptor>> = HashMap::new();
        for descriptor in descriptors {
            let key = (descriptor.dataset.clone(), descriptor.product_type);
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(descriptor);
        }

        order
            .into_iter()
            .filter_map(|key| {
                let members = groups.remove(&key)?;
                Some(self.build_run(key.0, key.1, &members))
            })
            .collect()
    }

    pub fn entry(&self, descriptor: &Descriptor) -> CatalogEntry {
        let data_path = descriptor.data_path();
        let (start, end) = (descriptor.years_start, descriptor.years_end);
        let projection = descriptor.dataset_type == DatasetKind::Projections;
        let coverage = if projection {
            self.scanner
                .scan_stem(&data_path, &descriptor.file_stem(), start, end)
        } else {
            self.scanner.scan(&data_path, start, end)
        };
        let coverage = coverage.unwrap_or_else(|err| {
            warn!("{err}; treating as missing");
            Coverage::default()
        });
        debug!(
            "{} {}: {:?}",
            descriptor.dataset, descriptor.variable, coverage
        );

        CatalogEntry {
            variable: descriptor.variable.clone(),
            model: descriptor.model.clone().filter(|_| projection),
            experiment: descriptor.experiment.clone().filter(|_| projection),
            dataset: descriptor.dataset.clone(),
            dataset_type: descriptor.dataset_type,
            product_type: descriptor.product_type,
            temporal_resolution: descriptor.temporal_resolution.clone(),
            interpolation: descriptor.interpolation.clone(),
            data_path: data_path.into_string(),
            origin_path: layout::origin_path(descriptor),
            start_file_exists: coverage.start_exists,
            final_file_exists: coverage.end_exists,
            earliest_date: coverage.earliest,
            latest_date: coverage.latest,
        }
    }

    fn build_run(
        &self,
        dataset: String,
        product_type: ProductType,
        members: &[&Descriptor],
    ) -> CatalogRun {
        let kind = members
            .first()
            .map(|descriptor| descriptor.dataset_type)
            .unwrap_or(DatasetKind::Reanalysis);
        let entries: Vec<CatalogEntry> = members
            .iter()
            .map(|descriptor| self.entry(descriptor))
            .collect();

        let mut rows = Vec::new();
        let mut variables = Vec::new();
        let mut scenarios = Vec::new();
        for descriptor in members {
            push_unique(&mut rows, descriptor.simulation_id());
            push_unique(&mut variables, descriptor.variable.clone());
            push_unique(&mut scenarios, descriptor.scenario());
        }

        let mut matrix = CatalogMatrix::empty(rows, variables, scenarios);
        for (descriptor, entry) in members.iter().zip(&entries) {
            matrix.merge(
                &descriptor.simulation_id(),
                &descriptor.variable,
                &descriptor.scenario(),
                entry.status(),
            );
        }

        CatalogRun {
            dataset,
            product_type,
            kind,
            entries,
            matrix,
        }
    }
}

fn push_unique(values: &mut Vec<String>, value: String) {
    if !values.contains(&value) {
        values.push(value);
    }
}
