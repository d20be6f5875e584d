use std::time::Instant;

use camino::Utf8PathBuf;
use crossbeam_channel::{bounded, unbounded};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::cds::{Retriever, build_request};
use crate::config::{DatasetProfile, RequestRow};
use crate::domain::FetchUnit;
use crate::error::CatalogError;
use crate::layout;

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    pub dry_run: bool,
}

/// A unit that was retrieved and moved into place.
#[derive(Debug, Clone, Serialize)]
pub struct FetchSuccess {
    pub dataset: String,
    pub variable: String,
    pub unit: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchFailure {
    pub dataset: String,
    pub variable: String,
    pub unit: String,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub dry_run: bool,
    pub planned: Vec<String>,
    pub skipped: usize,
    pub dispatched: usize,
    pub succeeded: Vec<FetchSuccess>,
    pub failed: Vec<FetchFailure>,
}

impl FetchReport {
    pub fn absorb(&mut self, other: FetchReport) {
        self.planned.extend(other.planned);
        self.skipped += other.skipped;
        self.dispatched += other.dispatched;
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}

struct FetchTask {
    dataset: String,
    variable: String,
    unit: FetchUnit,
    request: Value,
    target: Utf8PathBuf,
}

/// Runs fetch units on a fixed pool of worker threads.
///
/// Existing targets are skipped before dispatch, so a second run over a
/// complete archive performs no retrievals. A unit that fails is logged and
/// reported; it never aborts its siblings.
#[derive(Debug, Clone)]
pub struct FetchOrchestrator {
    workers: usize,
    extension: String,
}

impl FetchOrchestrator {
    pub fn new(workers: usize, extension: &str) -> Self {
        Self {
            workers: workers.max(1),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Fetch every row in turn, one pool per row.
    pub fn run_all<R: Retriever>(
        &self,
        rows: &[RequestRow],
        profile: &DatasetProfile,
        retriever: &R,
        options: FetchOptions,
    ) -> FetchReport {
        let mut report = FetchReport {
            dry_run: options.dry_run,
            ..FetchReport::default()
        };
        for row in rows {
            report.absorb(self.run(row, profile, retriever, options));
        }
        report
    }

    /// Fetch the missing units of one row. Returns once every dispatched
    /// unit has finished.
    pub fn run<R: Retriever>(
        &self,
        row: &RequestRow,
        profile: &DatasetProfile,
        retriever: &R,
        options: FetchOptions,
    ) -> FetchReport {
        let descriptor = &row.descriptor;
        let mut report = FetchReport {
            dry_run: options.dry_run,
            ..FetchReport::default()
        };

        let mut tasks = Vec::new();
        for unit in profile
            .cadence
            .units(descriptor.years_start, descriptor.years_end)
        {
            let target = layout::unit_path(descriptor, &unit, &self.extension);
            if target.as_std_path().exists() {
                info!("{target} already exists, skipping");
                report.skipped += 1;
                continue;
            }
            tasks.push(FetchTask {
                dataset: descriptor.dataset.clone(),
                variable: descriptor.variable.clone(),
                request: build_request(&row.params, &unit),
                unit,
                target,
            });
        }
        if tasks.is_empty() {
            return report;
        }

        if options.dry_run {
            for task in &tasks {
                info!("[dry-run] would fetch {}", task.target);
                report.planned.push(task.target.to_string());
            }
            return report;
        }

        let directory = descriptor.data_path();
        if let Err(err) = std::fs::create_dir_all(directory.as_std_path()) {
            let message = format!("create {directory}: {err}");
            error!("{message}");
            report
                .failed
                .extend(tasks.iter().map(|task| failure(task, &message)));
            return report;
        }

        report.dispatched = tasks.len();
        let (succeeded, failed) = self.dispatch(tasks, profile, retriever);
        report.succeeded = succeeded;
        report.failed = failed;
        report
    }

    fn dispatch<R: Retriever>(
        &self,
        tasks: Vec<FetchTask>,
        profile: &DatasetProfile,
        retriever: &R,
    ) -> (Vec<FetchSuccess>, Vec<FetchFailure>) {
        let (task_tx, task_rx) = bounded::<FetchTask>(self.workers);
        let (result_tx, result_rx) = unbounded::<Result<FetchSuccess, FetchFailure>>();

        std::thread::scope(|scope| {
            for _ in 0..self.workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for task in task_rx {
                        let outcome = execute(retriever, &profile.catalogue_id, &task)
                            .map(|()| success(&task))
                            .map_err(|err| {
                                let err = CatalogError::FetchUnit {
                                    dataset: task.dataset.clone(),
                                    variable: task.variable.clone(),
                                    unit: task.unit.to_string(),
                                    message: err.to_string(),
                                };
                                error!("{err}");
                                failure(&task, &err.to_string())
                            });
                        if result_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);
            drop(task_rx);

            for task in tasks {
                if task_tx.send(task).is_err() {
                    break;
                }
            }
            drop(task_tx);
        });

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for outcome in result_rx {
            match outcome {
                Ok(done) => succeeded.push(done),
                Err(failure) => failed.push(failure),
            }
        }
        (succeeded, failed)
    }
}

/// Retrieve into a temp file next to the target and move it into place.
fn execute<R: Retriever>(
    retriever: &R,
    catalogue_id: &str,
    task: &FetchTask,
) -> Result<(), CatalogError> {
    let started = Instant::now();
    let directory = task
        .target
        .parent()
        .ok_or_else(|| CatalogError::Filesystem(format!("no parent for {}", task.target)))?;
    let partial = tempfile::Builder::new()
        .prefix(".")
        .suffix(".part")
        .tempfile_in(directory.as_std_path())
        .map_err(|err| CatalogError::Filesystem(err.to_string()))?;

    info!(
        "fetching {}/{} {} from {catalogue_id}",
        task.dataset, task.variable, task.unit
    );
    retriever.retrieve(catalogue_id, &task.request, partial.path())?;
    partial
        .persist(task.target.as_std_path())
        .map_err(|err| CatalogError::Filesystem(err.error.to_string()))?;
    info!(
        "fetched {} in {:.1}s",
        task.target,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

fn success(task: &FetchTask) -> FetchSuccess {
    FetchSuccess {
        dataset: task.dataset.clone(),
        variable: task.variable.clone(),
        unit: task.unit.to_string(),
        target: task.target.to_string(),
    }
}

fn failure(task: &FetchTask, message: &str) -> FetchFailure {
    FetchFailure {
        dataset: task.dataset.clone(),
        variable: task.variable.clone(),
        unit: task.unit.to_string(),
        target: task.target.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;

    use super::*;
    use crate::domain::{Cadence, DatasetKind, Descriptor, Origin, ProductType};

    struct MockRetriever {
        calls: Mutex<Vec<String>>,
        fail_year: Option<&'static str>,
    }

    impl MockRetriever {
        fn new(fail_year: Option<&'static str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_year,
            }
        }
    }

    impl Retriever for MockRetriever {
        fn retrieve(
            &self,
            _catalogue_id: &str,
            request: &Value,
            target: &Path,
        ) -> Result<(), CatalogError> {
            let year = request["year"].as_str().unwrap_or_default().to_string();
            self.calls.lock().unwrap().push(year.clone());
            if self.fail_year == Some(year.as_str()) {
                std::fs::write(target, b"truncated").unwrap();
                return Err(CatalogError::CdsHttp("connection reset".to_string()));
            }
            std::fs::write(target, b"netcdf").unwrap();
            Ok(())
        }
    }

    fn row(root: &Utf8PathBuf) -> RequestRow {
        RequestRow {
            descriptor: Descriptor {
                dataset: "reanalysis-era5-single-levels".to_string(),
                dataset_type: DatasetKind::Reanalysis,
                product_type: ProductType::Raw,
                temporal_resolution: "hourly".to_string(),
                interpolation: "native".to_string(),
                variable: "t2m".to_string(),
                model: None,
                experiment: None,
                ensemble: None,
                years_start: 2000,
                years_end: 2004,
                base_path: root.clone(),
                origin: Origin::Remote,
            },
            params: BTreeMap::from([("variable".to_string(), "2m_temperature".to_string())]),
        }
    }

    fn profile() -> DatasetProfile {
        DatasetProfile {
            cadence: Cadence::Yearly,
            catalogue_id: "reanalysis-era5-single-levels".to_string(),
        }
    }

    #[test]
    fn failing_unit_does_not_stop_siblings() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let rows = vec![row(&root)];
        let retriever = MockRetriever::new(Some("2002"));

        let report = FetchOrchestrator::new(4, "nc").run(
            &rows[0],
            &profile(),
            &retriever,
            FetchOptions::default(),
        );
        assert_eq!(report.dispatched, 5);
        assert_eq!(report.succeeded.len(), 4);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].unit, "2002");
        assert_eq!(report.failed[0].dataset, "reanalysis-era5-single-levels");
        assert!(
            report
                .succeeded
                .iter()
                .all(|done| done.unit != "2002" && done.target.ends_with(".nc"))
        );

        let dir = rows[0].descriptor.data_path();
        assert!(!dir.join("t2m_reanalysis-era5-single-levels_2002.nc").exists());
        assert!(dir.join("t2m_reanalysis-era5-single-levels_2003.nc").exists());
        let leftovers = std::fs::read_dir(dir.as_std_path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".part")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn dry_run_plans_without_dispatch() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let rows = vec![row(&root)];
        let retriever = MockRetriever::new(None);

        let report = FetchOrchestrator::new(2, "nc").run_all(
            &rows,
            &profile(),
            &retriever,
            FetchOptions { dry_run: true },
        );
        assert_eq!(report.planned.len(), 5);
        assert_eq!(report.dispatched, 0);
        assert!(retriever.calls.lock().unwrap().is_empty());
        assert!(!rows[0].descriptor.data_path().exists());
    }

    #[test]
    fn monthly_cadence_names_units_by_month() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut monthly = row(&root);
        monthly.descriptor.years_end = 2000;
        let profile = DatasetProfile {
            cadence: Cadence::Monthly,
            catalogue_id: "reanalysis-cerra-land".to_string(),
        };
        let retriever = MockRetriever::new(None);

        let report = FetchOrchestrator::new(3, "nc").run(
            &monthly,
            &profile,
            &retriever,
            FetchOptions::default(),
        );
        assert_eq!(report.succeeded.len(), 12);
        let dir = monthly.descriptor.data_path();
        assert!(dir.join("t2m_reanalysis-era5-single-levels_200001.nc").exists());
        assert!(dir.join("t2m_reanalysis-era5-single-levels_200012.nc").exists());
    }
}
