use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("missing config file climdata.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("request table {file} is missing required columns: {}", .missing.join(", "))]
    ConfigSchema { file: String, missing: Vec<String> },

    #[error("invalid value {value:?} in column {column}")]
    InvalidField { column: String, value: String },

    #[error("invalid year range: {start} > {end}")]
    InvalidYearRange { start: i32, end: i32 },

    #[error("no request table for dataset: {0}")]
    UnknownDataset(String),

    #[error("no request tables found in {0}")]
    NoRequestTables(Utf8PathBuf),

    #[error("cannot read archive directory {path}: {message}")]
    ScanIo { path: Utf8PathBuf, message: String },

    #[error("fetch failed for {dataset}/{variable} {unit}: {message}")]
    FetchUnit {
        dataset: String,
        variable: String,
        unit: String,
        message: String,
    },

    #[error("dependency lookup {lookup} matched {matches} rows, expected exactly one")]
    PathAmbiguity { lookup: String, matches: usize },

    #[error("no dependencies declared for derived variable: {0}")]
    MissingDependencies(String),

    #[error("CDS request failed: {0}")]
    CdsHttp(String),

    #[error("CDS returned status {status}: {message}")]
    CdsStatus { status: u16, message: String },

    #[error("CDS rejected request: {0}")]
    CdsRequest(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("catalogue export failed: {0}")]
    Export(String),
}
