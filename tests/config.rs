use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use climdata::config::{ConfigLoader, discover_request_tables, load_request_table};
use climdata::domain::{Cadence, DatasetKind, Origin, ProductType};
use climdata::error::CatalogError;

const HEADER: &str = "dataset,dataset_type,product_type,temporal_resolution,interpolation,filename_variable,output_path,input_path,cds_years_start,cds_years_end";

fn write(dir: &Utf8PathBuf, name: &str, content: &str) -> Utf8PathBuf {
    let path = dir.join(name);
    fs::write(path.as_std_path(), content).unwrap();
    path
}

fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, dir)
}

#[test]
fn loads_reanalysis_table() {
    let (_temp, dir) = tempdir();
    let path = write(
        &dir,
        "reanalysis-era5-single-levels.csv",
        &format!(
            "{HEADER},cds_variable,cds_day,cds_product_type\n\
             reanalysis-era5-single-levels, reanalysis ,raw,hourly,native,t2m,/archive,CDS,1990,2020,2m_temperature,all,reanalysis\n"
        ),
    );

    let table = load_request_table(&path).unwrap();
    assert_eq!(table.name, "reanalysis-era5-single-levels");
    assert_eq!(table.rows.len(), 1);

    let row = &table.rows[0];
    assert_eq!(row.descriptor.dataset_type, DatasetKind::Reanalysis);
    assert_eq!(row.descriptor.product_type, ProductType::Raw);
    assert_eq!(row.descriptor.years_start, 1990);
    assert_eq!(row.descriptor.origin, Origin::Remote);
    assert_eq!(row.descriptor.model, None);
    assert_eq!(row.params.get("variable").unwrap(), "2m_temperature");
    assert_eq!(row.params.get("day").unwrap(), "all");
    assert!(!row.params.contains_key("years_start"));
}

#[test]
fn missing_required_column_is_schema_error() {
    let (_temp, dir) = tempdir();
    let path = write(
        &dir,
        "broken.csv",
        "dataset,dataset_type,product_type\nera5,reanalysis,raw\n",
    );

    let err = load_request_table(&path).unwrap_err();
    assert_matches!(err, CatalogError::ConfigSchema { ref missing, .. } if missing.contains(&"interpolation".to_string()));
}

#[test]
fn projections_need_model_and_experiment() {
    let (_temp, dir) = tempdir();
    let path = write(
        &dir,
        "projections-cmip6.csv",
        &format!(
            "{HEADER}\nprojections-cmip6,projections,raw,daily,native,tas,/archive,CDS,2015,2100\n"
        ),
    );

    let err = load_request_table(&path).unwrap_err();
    assert_matches!(err, CatalogError::ConfigSchema { ref missing, .. } if missing == &vec!["model".to_string(), "experiment".to_string()]);
}

#[test]
fn projection_rows_keep_simulation_identity() {
    let (_temp, dir) = tempdir();
    let path = write(
        &dir,
        "projections-cmip6.csv",
        &format!(
            "{HEADER},model,experiment,ensemble\n\
             projections-cmip6,projections,raw,daily,native,tas,/archive,CDS,2015,2100,ec_earth3,ssp5_8_5,r1i1p1f1\n\
             projections-cmip6,projections,raw,daily,native,tas,/archive,CDS,1950,2014,ec_earth3,historical,\n"
        ),
    );

    let table = load_request_table(&path).unwrap();
    let first = &table.rows[0].descriptor;
    assert_eq!(first.simulation_id(), "ec_earth3_r1i1p1f1");
    assert_eq!(first.scenario(), "ssp5_8_5");
    let second = &table.rows[1].descriptor;
    assert_eq!(second.ensemble, None);
    assert_eq!(second.simulation_id(), "ec_earth3");
}

#[test]
fn inverted_year_range_is_rejected() {
    let (_temp, dir) = tempdir();
    let path = write(
        &dir,
        "era5.csv",
        &format!("{HEADER}\nera5,reanalysis,raw,daily,native,t2m,/archive,CDS,2020,1990\n"),
    );

    let err = load_request_table(&path).unwrap_err();
    assert_matches!(err, CatalogError::InvalidYearRange { start: 2020, end: 1990 });
}

#[test]
fn non_numeric_year_is_invalid_field() {
    let (_temp, dir) = tempdir();
    let path = write(
        &dir,
        "era5.csv",
        &format!("{HEADER}\nera5,reanalysis,raw,daily,native,t2m,/archive,CDS,nineteen,1990\n"),
    );

    let err = load_request_table(&path).unwrap_err();
    assert_matches!(err, CatalogError::InvalidField { column, .. } if column == "cds_years_start");
}

#[test]
fn discovers_only_csv_tables_in_order() {
    let (_temp, dir) = tempdir();
    write(&dir, "b.csv", HEADER);
    write(&dir, "a.csv", HEADER);
    write(&dir, "notes.txt", "");

    let files = discover_request_tables(&dir).unwrap();
    let names: Vec<_> = files.iter().filter_map(|path| path.file_name()).collect();
    assert_eq!(names, vec!["a.csv", "b.csv"]);
}

#[test]
fn resolves_config_file() {
    let (_temp, dir) = tempdir();
    let path = write(
        &dir,
        "climdata.json",
        r##"{
            "requests_dir": "tables",
            "workers": 0,
            "datasets": {
                "reanalysis-cerra-land": { "cadence": "monthly", "catalogue_id": "reanalysis-cerra-land" }
            },
            "export": { "palette": { "complete": "#00FF00", "partial": "#FFFF00", "missing": "#000000" } }
        }"##,
    );

    let resolved = ConfigLoader::resolve(Some(path.as_str())).unwrap();
    assert_eq!(resolved.requests_dir, "tables");
    assert_eq!(resolved.catalogue_dir, "catalogues");
    assert_eq!(resolved.provenance_dir, "provenance");
    assert_eq!(resolved.workers, 1);
    assert_eq!(resolved.profile("reanalysis-cerra-land").cadence, Cadence::Monthly);
    assert_eq!(resolved.export.palette.complete, "#00FF00");
    assert_eq!(resolved.export.labels.missing, "not_downloaded");
}

#[test]
fn unreadable_config_path() {
    let err = ConfigLoader::resolve(Some("/nonexistent/climdata.json")).unwrap_err();
    assert_matches!(err, CatalogError::ConfigRead(_));
}
