//! Canonical archive layout.
//!
//! Every writer and reader goes through [`resolve`], so the catalog side and the
//! fetch side always agree on where a variable lives:
//!
//! ```text
//! {base}/{product_type}/{dataset}/{temporal_resolution}/{interpolation}/{variable}/{file}
//! ```

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use crate::domain::{Descriptor, FetchUnit, Origin, ProductType};
use crate::error::CatalogError;

pub const NATIVE_GRID: &str = "native";
pub const REMOTE_ORIGIN: &str = "CDS";

pub fn resolve(
    base: &Utf8Path,
    product_type: ProductType,
    dataset: &str,
    temporal_resolution: &str,
    interpolation: &str,
    variable: &str,
) -> Utf8PathBuf {
    base.join(product_type.as_str())
        .join(dataset)
        .join(temporal_resolution)
        .join(interpolation)
        .join(variable)
}

/// `{stem}_{token}.{ext}`; the token is the last `_` segment.
pub fn unit_filename(stem: &str, unit: &FetchUnit, extension: &str) -> String {
    format!("{stem}_{}.{extension}", unit.token())
}

pub fn unit_path(descriptor: &Descriptor, unit: &FetchUnit, extension: &str) -> Utf8PathBuf {
    descriptor
        .data_path()
        .join(unit_filename(&descriptor.file_stem(), unit, extension))
}

/// Lineage column of the catalog: where a row's input data comes from.
pub fn origin_path(descriptor: &Descriptor) -> String {
    match (&descriptor.origin, descriptor.product_type) {
        (Origin::Remote, _) => REMOTE_ORIGIN.to_string(),
        (Origin::Local(root), ProductType::Derived) => resolve(
            root,
            ProductType::Raw,
            &descriptor.dataset,
            &descriptor.temporal_resolution,
            NATIVE_GRID,
            &descriptor.variable,
        )
        .to_string(),
        (Origin::Local(_), ProductType::Raw) => descriptor.data_path().to_string(),
    }
}

/// Raw inputs each derived variable is computed from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyTable {
    inputs: BTreeMap<String, Vec<String>>,
}

impl DependencyTable {
    pub fn new(inputs: BTreeMap<String, Vec<String>>) -> Self {
        Self { inputs }
    }

    pub fn inputs_of(&self, variable: &str) -> Option<&[String]> {
        self.inputs
            .get(variable)
            .map(Vec::as_slice)
            .filter(|deps| !deps.is_empty())
    }
}

/// Resolve the raw directories a derived row reads from.
///
/// Each dependency must match exactly one raw row of the same dataset. The
/// resolved path always uses the `raw` product type and the native grid,
/// whatever the derived row's own interpolation is.
pub fn resolve_inputs(
    derived: &Descriptor,
    rows: &[Descriptor],
    table: &DependencyTable,
) -> Result<Vec<Utf8PathBuf>, CatalogError> {
    let dependencies = table
        .inputs_of(&derived.variable)
        .ok_or_else(|| CatalogError::MissingDependencies(derived.variable.clone()))?;

    dependencies
        .iter()
        .map(|dependency| {
            let source = require_single_raw(rows, &derived.dataset, dependency)?;
            let root = match &derived.origin {
                Origin::Local(root) => root.as_path(),
                Origin::Remote => source.base_path(),
            };
            Ok(resolve(
                root,
                ProductType::Raw,
                &source.dataset,
                &source.temporal_resolution,
                NATIVE_GRID,
                &source.variable,
            ))
        })
        .collect()
}

fn require_single_raw<'a>(
    rows: &'a [Descriptor],
    dataset: &str,
    variable: &str,
) -> Result<&'a Descriptor, CatalogError> {
    let matches = rows
        .iter()
        .filter(|row| {
            row.product_type == ProductType::Raw && row.dataset == dataset && row.variable == variable
        })
        .collect::<Vec<_>>();
    match matches.as_slice() {
        [single] => Ok(*single),
        other => Err(CatalogError::PathAmbiguity {
            lookup: format!("{dataset}/{variable}/raw"),
            matches: other.len(),
        }),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LayoutReport {
    pub dry_run: bool,
    pub directories: Vec<String>,
    pub raw: usize,
    pub derived: usize,
}

/// Create (or, in dry-run, only list) the canonical directory of every row.
pub fn create_structure(
    descriptors: &[Descriptor],
    dry_run: bool,
) -> Result<LayoutReport, CatalogError> {
    let mut report = LayoutReport {
        dry_run,
        ..LayoutReport::default()
    };
    for descriptor in descriptors {
        let directory = descriptor.data_path();
        if report.directories.iter().any(|known| known == directory.as_str()) {
            continue;
        }
        if dry_run {
            info!("[dry-run] would create {directory}");
        } else {
            fs::create_dir_all(directory.as_std_path())
                .map_err(|err| CatalogError::Filesystem(format!("create {directory}: {err}")))?;
            info!("created {directory}");
        }
        match descriptor.product_type {
            ProductType::Raw => report.raw += 1,
            ProductType::Derived => report.derived += 1,
        }
        report.directories.push(directory.into_string());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::DatasetKind;

    fn row(variable: &str, product_type: ProductType, interpolation: &str) -> Descriptor {
        Descriptor {
            dataset: "reanalysis-era5-single-levels".to_string(),
            dataset_type: DatasetKind::Reanalysis,
            product_type,
            temporal_resolution: "daily".to_string(),
            interpolation: interpolation.to_string(),
            variable: variable.to_string(),
            model: None,
            experiment: None,
            ensemble: None,
            years_start: 2000,
            years_end: 2001,
            base_path: Utf8PathBuf::from("/archive"),
            origin: Origin::Local(Utf8PathBuf::from("/archive")),
        }
    }

    #[test]
    fn canonical_layout() {
        let path = resolve(
            Utf8Path::new("/archive"),
            ProductType::Derived,
            "derived-era5-single-levels-daily-statistics",
            "daily",
            "gr006",
            "hurs",
        );
        assert_eq!(
            path,
            "/archive/derived/derived-era5-single-levels-daily-statistics/daily/gr006/hurs"
        );
    }

    #[test]
    fn unit_filenames_end_with_token() {
        let yearly = FetchUnit {
            year: 1995,
            month: None,
        };
        let monthly = FetchUnit {
            year: 1995,
            month: Some(7),
        };
        assert_eq!(unit_filename("t2m_era5", &yearly, "nc"), "t2m_era5_1995.nc");
        assert_eq!(unit_filename("t2m_era5", &monthly, "nc"), "t2m_era5_199507.nc");
    }

    #[test]
    fn projection_units_are_named_per_simulation() {
        let unit = FetchUnit {
            year: 2050,
            month: None,
        };
        let mut first = row("tas", ProductType::Raw, "native");
        first.dataset = "projections-cmip6".to_string();
        first.dataset_type = DatasetKind::Projections;
        first.model = Some("ec_earth3".to_string());
        first.experiment = Some("ssp5_8_5".to_string());
        let mut second = first.clone();
        second.model = Some("mpi_esm1_2_lr".to_string());
        second.ensemble = Some("r1i1p1f1".to_string());

        assert_eq!(first.data_path(), second.data_path());
        assert_eq!(
            unit_path(&first, &unit, "nc").file_name(),
            Some("tas_ec_earth3_ssp5_8_5_2050.nc")
        );
        assert_eq!(
            unit_path(&second, &unit, "nc").file_name(),
            Some("tas_mpi_esm1_2_lr_r1i1p1f1_ssp5_8_5_2050.nc")
        );
    }

    #[test]
    fn path_ignores_fields_outside_the_layout_key() {
        let base = row("tas", ProductType::Raw, "native");
        let mut other = base.clone();
        other.dataset_type = DatasetKind::Projections;
        other.model = Some("ec_earth3".to_string());
        other.experiment = Some("historical".to_string());
        other.ensemble = Some("r1i1p1f1".to_string());
        other.years_start = 1950;
        other.years_end = 2014;
        other.origin = Origin::Remote;

        assert_eq!(base.data_path(), other.data_path());
        assert_eq!(
            base.data_path(),
            "/archive/raw/reanalysis-era5-single-levels/daily/native/tas"
        );
    }

    #[test]
    fn origin_of_derived_row_is_raw_native() {
        let derived = row("sfcwind", ProductType::Derived, "gr006");
        assert_eq!(
            origin_path(&derived),
            "/archive/raw/reanalysis-era5-single-levels/daily/native/sfcwind"
        );

        let mut remote = row("u10", ProductType::Raw, "native");
        remote.origin = Origin::Remote;
        assert_eq!(origin_path(&remote), "CDS");
    }

    #[test]
    fn inputs_resolve_through_dependency_table() {
        let rows = vec![
            row("u10", ProductType::Raw, "native"),
            row("v10", ProductType::Raw, "native"),
            row("sfcwind", ProductType::Derived, "gr006"),
        ];
        let table = DependencyTable::new(BTreeMap::from([(
            "sfcwind".to_string(),
            vec!["u10".to_string(), "v10".to_string()],
        )]));

        let inputs = resolve_inputs(&rows[2], &rows, &table).unwrap();
        assert_eq!(inputs.len(), 2);
        assert!(inputs[0].ends_with("raw/reanalysis-era5-single-levels/daily/native/u10"));
        assert!(inputs[1].ends_with("raw/reanalysis-era5-single-levels/daily/native/v10"));
    }

    #[test]
    fn ambiguous_dependency_is_rejected() {
        let mut hourly = row("u10", ProductType::Raw, "native");
        hourly.temporal_resolution = "hourly".to_string();
        let rows = vec![
            row("u10", ProductType::Raw, "native"),
            hourly,
            row("sfcwind", ProductType::Derived, "native"),
        ];
        let table = DependencyTable::new(BTreeMap::from([(
            "sfcwind".to_string(),
            vec!["u10".to_string()],
        )]));

        let err = resolve_inputs(&rows[2], &rows, &table).unwrap_err();
        assert_matches!(err, CatalogError::PathAmbiguity { matches: 2, .. });

        let err = resolve_inputs(&rows[2], &rows[2..], &table).unwrap_err();
        assert_matches!(err, CatalogError::PathAmbiguity { matches: 0, .. });
    }

    #[test]
    fn undeclared_dependencies() {
        let rows = vec![row("hurs", ProductType::Derived, "native")];
        let err = resolve_inputs(&rows[0], &rows, &DependencyTable::default()).unwrap_err();
        assert_matches!(err, CatalogError::MissingDependencies(var) if var == "hurs");
    }

    #[test]
    fn structure_dry_run_touches_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut raw = row("t2m", ProductType::Raw, "native");
        raw.base_path = root.clone();
        let duplicate = raw.clone();

        let report = create_structure(&[raw.clone(), duplicate], true).unwrap();
        assert_eq!(report.directories.len(), 1);
        assert_eq!(report.raw, 1);
        assert!(!raw.data_path().as_std_path().exists());

        create_structure(&[raw.clone()], false).unwrap();
        assert!(raw.data_path().as_std_path().is_dir());
    }
}
