use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Reanalysis,
    Projections,
    Observations,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Reanalysis => "reanalysis",
            DatasetKind::Projections => "projections",
            DatasetKind::Observations => "observations",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKind {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reanalysis" => Ok(DatasetKind::Reanalysis),
            "projections" => Ok(DatasetKind::Projections),
            "observations" => Ok(DatasetKind::Observations),
            _ => Err(CatalogError::InvalidField {
                column: "dataset_type".to_string(),
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductType {
    Raw,
    Derived,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Raw => "raw",
            ProductType::Derived => "derived",
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductType {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(ProductType::Raw),
            "derived" => Ok(ProductType::Derived),
            _ => Err(CatalogError::InvalidField {
                column: "product_type".to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// How a dataset is split into fetch units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    #[default]
    Yearly,
    Monthly,
}

impl Cadence {
    /// Units covering `[start, end]` in ascending year, then month, order.
    pub fn units(self, start: i32, end: i32) -> Vec<FetchUnit> {
        let mut units = Vec::new();
        for year in start..=end {
            match self {
                Cadence::Yearly => units.push(FetchUnit { year, month: None }),
                Cadence::Monthly => {
                    units.extend((1..=12).map(|month| FetchUnit {
                        year,
                        month: Some(month),
                    }));
                }
            }
        }
        units
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FetchUnit {
    pub year: i32,
    pub month: Option<u32>,
}

impl FetchUnit {
    /// Trailing filename token: `YYYY` or `YYYYMM`.
    pub fn token(&self) -> String {
        match self.month {
            Some(month) => format!("{:04}{:02}", self.year, month),
            None => format!("{:04}", self.year),
        }
    }
}

impl fmt::Display for FetchUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.month {
            Some(month) => write!(f, "{:04}-{:02}", self.year, month),
            None => write!(f, "{:04}", self.year),
        }
    }
}

/// Where a row's data comes from: the remote service or a local archive root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Remote,
    Local(Utf8PathBuf),
}

impl Origin {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("cds") {
            Origin::Remote
        } else {
            Origin::Local(Utf8PathBuf::from(trimmed))
        }
    }
}

/// One logical catalog entry, parsed from a request-table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub dataset: String,
    pub dataset_type: DatasetKind,
    pub product_type: ProductType,
    pub temporal_resolution: String,
    pub interpolation: String,
    pub variable: String,
    pub model: Option<String>,
    pub experiment: Option<String>,
    pub ensemble: Option<String>,
    pub years_start: i32,
    pub years_end: i32,
    pub base_path: Utf8PathBuf,
    pub origin: Origin,
}

impl Descriptor {
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.years_start > self.years_end {
            return Err(CatalogError::InvalidYearRange {
                start: self.years_start,
                end: self.years_end,
            });
        }
        Ok(())
    }

    pub fn base_path(&self) -> &Utf8Path {
        &self.base_path
    }

    pub fn data_path(&self) -> Utf8PathBuf {
        crate::layout::resolve(
            &self.base_path,
            self.product_type,
            &self.dataset,
            &self.temporal_resolution,
            &self.interpolation,
            &self.variable,
        )
    }

    /// Filename stem shared by every unit file of this descriptor.
    ///
    /// Projection simulations of one variable share a directory, so their
    /// stem carries the simulation and the experiment.
    pub fn file_stem(&self) -> String {
        match self.dataset_type {
            DatasetKind::Projections => format!(
                "{}_{}_{}",
                self.variable,
                self.simulation_id(),
                self.scenario()
            ),
            DatasetKind::Reanalysis | DatasetKind::Observations => {
                format!("{}_{}", self.variable, self.dataset)
            }
        }
    }

    /// Row identity in the catalog matrix.
    pub fn simulation_id(&self) -> String {
        match self.dataset_type {
            DatasetKind::Projections => {
                let model = self.model.as_deref().unwrap_or("unknown");
                match self.ensemble.as_deref() {
                    Some(member) if !member.is_empty() => format!("{model}_{member}"),
                    _ => model.to_string(),
                }
            }
            DatasetKind::Reanalysis | DatasetKind::Observations => self.dataset.clone(),
        }
    }

    /// Scenario axis value; everything but projections collapses to `historical`.
    pub fn scenario(&self) -> String {
        match self.dataset_type {
            DatasetKind::Projections => self
                .experiment
                .clone()
                .unwrap_or_else(|| "historical".to_string()),
            DatasetKind::Reanalysis | DatasetKind::Observations => "historical".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageStatus {
    Complete,
    Partial,
    Missing,
}

impl CoverageStatus {
    /// Boundary-year rule: both edge years present wins over interior gaps.
    pub fn classify(start_exists: bool, end_exists: bool, earliest: Option<i32>) -> Self {
        if start_exists && end_exists {
            CoverageStatus::Complete
        } else if earliest.is_some() {
            CoverageStatus::Partial
        } else {
            CoverageStatus::Missing
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            CoverageStatus::Complete => 0,
            CoverageStatus::Partial => 1,
            CoverageStatus::Missing => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageStatus::Complete => "complete",
            CoverageStatus::Partial => "partial",
            CoverageStatus::Missing => "missing",
        }
    }
}

impl fmt::Display for CoverageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catalog-matrix cell. `NotApplicable` marks combinations nobody requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cell {
    Status(CoverageStatus),
    NotApplicable,
}

impl Cell {
    pub fn code(&self) -> Option<u8> {
        match self {
            Cell::Status(status) => Some(status.code()),
            Cell::NotApplicable => None,
        }
    }
}
