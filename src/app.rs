use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, warn};

use crate::catalog::{CatalogBuilder, CatalogRun, CatalogSummary};
use crate::cds::Retriever;
use crate::config::{RequestTable, ResolvedConfig, discover_request_tables, load_request_table};
use crate::domain::{Cadence, DatasetKind, Descriptor, ProductType};
use crate::error::CatalogError;
use crate::exporter::CatalogExporter;
use crate::fetch::{FetchOptions, FetchOrchestrator, FetchReport};
use crate::layout::{self, LayoutReport};
use crate::provenance::{self, ProvenanceReport};
use crate::scanner::ArchiveScanner;

#[derive(Debug, Clone, Default)]
pub struct CatalogOptions {
    pub requests_dir: Option<Utf8PathBuf>,
    pub out_dir: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ProvenanceOptions {
    pub requests_dir: Option<Utf8PathBuf>,
    pub provenance_dir: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableError {
    pub file: String,
    pub message: String,
}

/// A derived descriptor left out of the catalogue because its raw inputs
/// could not be located.
#[derive(Debug, Clone, Serialize)]
pub struct LineageError {
    pub file: String,
    pub dataset: String,
    pub variable: String,
    pub temporal_resolution: String,
    pub interpolation: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogRunResult {
    pub dataset: String,
    pub product_type: ProductType,
    pub kind: DatasetKind,
    pub summary: CatalogSummary,
    pub table: String,
    pub matrix: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogResult {
    pub generated_at: String,
    pub runs: Vec<CatalogRunResult>,
    pub summary: CatalogSummary,
    pub merged: String,
    pub overview: String,
    pub lineage_errors: Vec<LineageError>,
    pub errors: Vec<TableError>,
}

impl CatalogResult {
    pub fn has_schema_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_lineage_errors(&self) -> bool {
        !self.lineage_errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub dataset: String,
    pub catalogue_id: String,
    pub cadence: Cadence,
    pub workers: usize,
    pub rows: usize,
    pub report: FetchReport,
    /// Other datasets' tables that failed to load and were ignored.
    pub skipped_tables: Vec<TableError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayoutResult {
    pub tables: usize,
    pub report: LayoutReport,
    pub errors: Vec<TableError>,
}

impl LayoutResult {
    pub fn has_schema_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

struct LoadedTables {
    tables: Vec<RequestTable>,
    failed: Vec<(Utf8PathBuf, CatalogError)>,
}

impl LoadedTables {
    fn errors(&self) -> Vec<TableError> {
        self.failed
            .iter()
            .map(|(file, err)| TableError {
                file: file.to_string(),
                message: err.to_string(),
            })
            .collect()
    }
}

pub struct App<R: Retriever> {
    config: ResolvedConfig,
    retriever: R,
}

impl<R: Retriever> App<R> {
    pub fn new(config: ResolvedConfig, retriever: R) -> Self {
        Self { config, retriever }
    }

    /// Catalogue every request table. A table with a schema error is reported
    /// and skipped; the others are still catalogued and merged.
    pub fn catalog(
        &self,
        options: CatalogOptions,
        sink: &dyn ProgressSink,
    ) -> Result<CatalogResult, CatalogError> {
        let started = Instant::now();
        let requests_dir = options
            .requests_dir
            .unwrap_or_else(|| self.config.requests_dir.clone());
        let out_dir = options
            .out_dir
            .unwrap_or_else(|| self.config.catalogue_dir.clone());

        let builder = CatalogBuilder::new(ArchiveScanner::new(&self.config.extension));
        let exporter = CatalogExporter::new(out_dir, self.config.export.clone());
        let loaded = load_tables(&requests_dir)?;

        let mut runs: Vec<CatalogRun> = Vec::new();
        let mut results = Vec::new();
        let mut written = Vec::new();
        let mut summary = CatalogSummary::default();
        let mut lineage_errors = Vec::new();

        for table in &loaded.tables {
            sink.event(ProgressEvent {
                message: format!("cataloguing {} ({} rows)", table.name, table.rows.len()),
                elapsed: Some(started.elapsed()),
            });

            let (descriptors, rejected) = self.check_lineage(table);
            lineage_errors.extend(rejected);

            for run in builder.build(&descriptors) {
                let run_summary = CatalogSummary::from_entries(&run.entries);
                summary.absorb(run_summary);
                let artifacts =
                    exporter.export(&run.entries, &run.matrix, &run.dataset, run.product_type)?;
                written.push(Utf8PathBuf::from(artifacts.table.as_str()));
                results.push(CatalogRunResult {
                    dataset: run.dataset.clone(),
                    product_type: run.product_type,
                    kind: run.kind,
                    summary: run_summary,
                    table: artifacts.table,
                    matrix: artifacts.matrix,
                });
                runs.push(run);
            }
        }

        let merged = exporter.merge(&written)?;
        let matrices = runs
            .iter()
            .map(|run| (run.dataset.clone(), run.product_type, &run.matrix))
            .collect::<Vec<_>>();
        let overview = exporter.write_overview(&matrices, &merged)?;
        sink.event(ProgressEvent {
            message: format!("catalogue written to {}", exporter.out_dir()),
            elapsed: Some(started.elapsed()),
        });

        Ok(CatalogResult {
            generated_at: Utc::now().to_rfc3339(),
            runs: results,
            summary,
            merged: merged.path.into_string(),
            overview: overview.into_string(),
            lineage_errors,
            errors: loaded.errors(),
        })
    }

    /// Fetch the missing units of every raw row of `dataset`.
    ///
    /// Tables of other datasets that fail to load are logged and ignored. A
    /// broken table named after `dataset` aborts the fetch.
    pub fn fetch(
        &self,
        dataset: &str,
        options: FetchOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, CatalogError> {
        let started = Instant::now();
        let mut loaded = load_tables(&self.config.requests_dir)?;
        if let Some(index) = loaded
            .failed
            .iter()
            .position(|(file, _)| file.file_stem() == Some(dataset))
        {
            let (_, err) = loaded.failed.swap_remove(index);
            return Err(err);
        }
        let skipped_tables = loaded.errors();
        for skipped in &skipped_tables {
            warn!("ignoring {} while fetching {dataset}", skipped.file);
        }

        let rows = loaded
            .tables
            .into_iter()
            .flat_map(|table| table.rows)
            .filter(|row| row.descriptor.dataset == dataset)
            .collect::<Vec<_>>();
        if rows.is_empty() {
            return Err(CatalogError::UnknownDataset(dataset.to_string()));
        }
        let raw_rows = rows
            .into_iter()
            .filter(|row| row.descriptor.product_type == ProductType::Raw)
            .collect::<Vec<_>>();

        let profile = self.config.profile(dataset);
        let orchestrator = FetchOrchestrator::new(self.config.workers, &self.config.extension);
        sink.event(ProgressEvent {
            message: format!(
                "fetching {} rows of {dataset} with {} workers",
                raw_rows.len(),
                orchestrator.workers()
            ),
            elapsed: None,
        });

        let report = orchestrator.run_all(&raw_rows, &profile, &self.retriever, options);
        sink.event(ProgressEvent {
            message: format!(
                "{dataset}: {} fetched, {} skipped, {} failed",
                report.succeeded.len(),
                report.skipped,
                report.failed.len()
            ),
            elapsed: Some(started.elapsed()),
        });

        Ok(FetchResult {
            dataset: dataset.to_string(),
            catalogue_id: profile.catalogue_id,
            cadence: profile.cadence,
            workers: orchestrator.workers(),
            rows: raw_rows.len(),
            report,
            skipped_tables,
        })
    }

    /// Create (or list) the canonical directory of every request row.
    /// Tables that fail to load are reported in the result.
    pub fn layout(
        &self,
        dry_run: bool,
        sink: &dyn ProgressSink,
    ) -> Result<LayoutResult, CatalogError> {
        let loaded = load_tables(&self.config.requests_dir)?;
        let descriptors = loaded
            .tables
            .iter()
            .flat_map(RequestTable::descriptors)
            .collect::<Vec<_>>();
        let report = layout::create_structure(&descriptors, dry_run)?;
        sink.event(ProgressEvent {
            message: format!(
                "{} raw and {} derived directories",
                report.raw, report.derived
            ),
            elapsed: None,
        });
        Ok(LayoutResult {
            tables: loaded.tables.len(),
            report,
            errors: loaded.errors(),
        })
    }

    /// Check that every request table has a provenance document describing
    /// its raw variables.
    pub fn provenance(
        &self,
        options: ProvenanceOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ProvenanceReport, CatalogError> {
        let requests_dir = options
            .requests_dir
            .unwrap_or_else(|| self.config.requests_dir.clone());
        let provenance_dir = options
            .provenance_dir
            .unwrap_or_else(|| self.config.provenance_dir.clone());

        let tables = discover_request_tables(&requests_dir)?;
        if tables.is_empty() {
            return Err(CatalogError::NoRequestTables(requests_dir));
        }
        let documents = provenance::discover_documents(&provenance_dir)?;
        sink.event(ProgressEvent {
            message: format!(
                "checking {} tables against {} provenance documents",
                tables.len(),
                documents.len()
            ),
            elapsed: None,
        });
        Ok(provenance::check_tables(&tables, &documents))
    }

    /// Split a table's descriptors into those that can be catalogued and the
    /// derived ones whose declared raw inputs are missing or ambiguous.
    fn check_lineage(&self, table: &RequestTable) -> (Vec<Descriptor>, Vec<LineageError>) {
        let descriptors = table.descriptors();
        let mut kept = Vec::with_capacity(descriptors.len());
        let mut rejected = Vec::new();
        for descriptor in &descriptors {
            let declared = descriptor.product_type == ProductType::Derived
                && self.config.dependencies.inputs_of(&descriptor.variable).is_some();
            let lineage = if declared {
                layout::resolve_inputs(descriptor, &descriptors, &self.config.dependencies).err()
            } else {
                None
            };
            match lineage {
                Some(err) => {
                    error!(
                        "{}: dropping derived {}/{}: {err}",
                        table.file, descriptor.dataset, descriptor.variable
                    );
                    rejected.push(LineageError {
                        file: table.file.to_string(),
                        dataset: descriptor.dataset.clone(),
                        variable: descriptor.variable.clone(),
                        temporal_resolution: descriptor.temporal_resolution.clone(),
                        interpolation: descriptor.interpolation.clone(),
                        message: err.to_string(),
                    });
                }
                None => kept.push(descriptor.clone()),
            }
        }
        (kept, rejected)
    }
}

/// Load every request table in `dir`, keeping the ones that fail aside.
fn load_tables(dir: &Utf8Path) -> Result<LoadedTables, CatalogError> {
    let mut loaded = LoadedTables {
        tables: Vec::new(),
        failed: Vec::new(),
    };
    for file in discover_request_tables(dir)? {
        match load_request_table(&file) {
            Ok(table) => loaded.tables.push(table),
            Err(err) => {
                error!("{file}: {err}");
                loaded.failed.push((file, err));
            }
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use serde_json::Value;

    use super::*;
    use crate::config::{Config, ConfigLoader};
    use crate::exporter::read_table;
    use crate::layout::DependencyTable;

    const HEADER: &str = "dataset,dataset_type,product_type,temporal_resolution,interpolation,filename_variable,output_path,input_path,cds_years_start,cds_years_end,cds_variable";

    struct NullSink;

    impl ProgressSink for NullSink {
        fn event(&self, _event: ProgressEvent) {}
    }

    struct CountingRetriever {
        calls: Mutex<usize>,
    }

    impl Retriever for CountingRetriever {
        fn retrieve(
            &self,
            _catalogue_id: &str,
            _request: &Value,
            target: &Path,
        ) -> Result<(), CatalogError> {
            *self.calls.lock().unwrap() += 1;
            fs::write(target, b"netcdf").map_err(|err| CatalogError::Filesystem(err.to_string()))
        }
    }

    fn app(root: &Utf8PathBuf) -> App<CountingRetriever> {
        let mut config = ConfigLoader::resolve_config(Config::default()).unwrap();
        config.requests_dir = root.join("requests");
        config.catalogue_dir = root.join("catalogues");
        fs::create_dir_all(config.requests_dir.as_std_path()).unwrap();
        App::new(
            config,
            CountingRetriever {
                calls: Mutex::new(0),
            },
        )
    }

    #[test]
    fn fetch_unknown_dataset() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let app = app(&root);
        let err = app
            .fetch("reanalysis-era5-land", FetchOptions::default(), &NullSink)
            .unwrap_err();
        assert_matches!(err, CatalogError::UnknownDataset(name) if name == "reanalysis-era5-land");
    }

    #[test]
    fn fetch_skips_derived_rows() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let app = app(&root);
        let table = format!(
            "dataset,dataset_type,product_type,temporal_resolution,interpolation,filename_variable,output_path,input_path,cds_years_start,cds_years_end,cds_variable\n\
             era5,reanalysis,raw,daily,native,t2m,{root},CDS,2000,2001,2m_temperature\n\
             era5,reanalysis,derived,daily,native,hurs,{root},{root},2000,2001,\n"
        );
        fs::write(root.join("requests/era5.csv").as_std_path(), table).unwrap();

        let result = app.fetch("era5", FetchOptions::default(), &NullSink).unwrap();
        assert_eq!(result.rows, 1);
        assert_eq!(result.report.succeeded.len(), 2);
        assert_eq!(*app.retriever.calls.lock().unwrap(), 2);
        assert!(root.join("raw/era5/daily/native/t2m/t2m_era5_2001.nc").exists());
        assert!(!root.join("derived/era5/daily/native/hurs").exists());
    }

    fn write_table(root: &Utf8PathBuf, name: &str, rows: &[String]) {
        let mut content = format!("{HEADER}\n");
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        fs::write(root.join("requests").join(name).as_std_path(), content).unwrap();
    }

    fn broken_cerra(root: &Utf8PathBuf) {
        fs::write(
            root.join("requests/cerra.csv").as_std_path(),
            "dataset,filename_variable\nreanalysis-cerra-land,tp\n",
        )
        .unwrap();
    }

    #[test]
    fn fetch_ignores_broken_tables_of_other_datasets() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let app = app(&root);
        write_table(
            &root,
            "era5.csv",
            &[format!("era5,reanalysis,raw,daily,native,t2m,{root},CDS,2000,2000,2m_temperature")],
        );
        broken_cerra(&root);

        let result = app.fetch("era5", FetchOptions::default(), &NullSink).unwrap();
        assert_eq!(result.report.succeeded.len(), 1);
        assert_eq!(result.skipped_tables.len(), 1);
        assert!(result.skipped_tables[0].file.ends_with("cerra.csv"));
        assert!(root.join("raw/era5/daily/native/t2m/t2m_era5_2000.nc").exists());
    }

    #[test]
    fn fetch_fails_on_its_own_broken_table() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let app = app(&root);
        broken_cerra(&root);

        let err = app
            .fetch("cerra", FetchOptions::default(), &NullSink)
            .unwrap_err();
        assert_matches!(err, CatalogError::ConfigSchema { file, .. } if file.ends_with("cerra.csv"));
        assert_eq!(*app.retriever.calls.lock().unwrap(), 0);
    }

    #[test]
    fn layout_reports_broken_tables_and_continues() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let app = app(&root);
        write_table(
            &root,
            "era5.csv",
            &[format!("era5,reanalysis,raw,daily,native,t2m,{root},CDS,2000,2001,2m_temperature")],
        );
        broken_cerra(&root);

        let result = app.layout(false, &NullSink).unwrap();
        assert_eq!(result.tables, 1);
        assert!(result.has_schema_errors());
        assert!(result.errors[0].file.ends_with("cerra.csv"));
        assert!(root.join("raw/era5/daily/native/t2m").is_dir());
    }

    #[test]
    fn ambiguous_lineage_drops_the_derived_row() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut app = app(&root);
        app.config.dependencies = DependencyTable::new(
            [("sfcwind".to_string(), vec!["u10".to_string()])].into(),
        );
        write_table(
            &root,
            "era5.csv",
            &[
                format!("era5,reanalysis,raw,daily,native,u10,{root},CDS,2000,2001,u10"),
                format!("era5,reanalysis,raw,hourly,native,u10,{root},CDS,2000,2001,u10"),
                format!("era5,reanalysis,derived,daily,native,sfcwind,{root},{root},2000,2001,"),
                format!("era5,reanalysis,derived,daily,native,hurs,{root},{root},2000,2001,"),
            ],
        );

        let result = app.catalog(CatalogOptions::default(), &NullSink).unwrap();
        assert!(result.has_lineage_errors());
        assert_eq!(result.lineage_errors.len(), 1);
        assert_eq!(result.lineage_errors[0].variable, "sfcwind");
        assert!(result.lineage_errors[0].message.contains("matched 2 rows"));

        let merged = read_table(Utf8Path::new(&result.merged)).unwrap();
        let variables = merged
            .iter()
            .map(|entry| entry.variable.as_str())
            .collect::<Vec<_>>();
        assert_eq!(variables, vec!["u10", "u10", "hurs"]);
    }

    #[test]
    fn catalog_merges_only_this_run() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let app = app(&root);
        fs::create_dir_all(root.join("catalogues").as_std_path()).unwrap();
        fs::write(
            root.join("catalogues/retired_raw_catalogue.csv").as_std_path(),
            "variable,model,experiment,dataset,dataset_type,product_type,temporal_resolution,interpolation,data_path,origin_path,start_file_exists,final_file_exists,earliest_date,latest_date\n\
             tx,,,retired,observations,raw,daily,native,/old,/old,True,True,1950.0,2000.0\n",
        )
        .unwrap();
        write_table(
            &root,
            "era5.csv",
            &[format!("era5,reanalysis,raw,daily,native,t2m,{root},CDS,2000,2001,2m_temperature")],
        );

        let result = app.catalog(CatalogOptions::default(), &NullSink).unwrap();
        let merged = read_table(Utf8Path::new(&result.merged)).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].dataset, "era5");
    }
}
