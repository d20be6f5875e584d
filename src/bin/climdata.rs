use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use climdata::app::{App, CatalogOptions, ProgressSink, ProvenanceOptions};
use climdata::cds::CdsHttpClient;
use climdata::config::ConfigLoader;
use climdata::error::CatalogError;
use climdata::fetch::FetchOptions;
use climdata::output::{HumanOutput, JsonOutput, OutputMode, StderrProgress};
use climdata::provenance;

#[derive(Parser)]
#[command(name = "climdata")]
#[command(about = "Catalogue and fetch a climate data archive")]
#[command(version, author)]
struct Cli {
    /// Project config file (defaults to ./climdata.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build the catalogue, matrices and overview")]
    Catalog(CatalogArgs),
    #[command(about = "Fetch missing files of one dataset")]
    Fetch(FetchArgs),
    #[command(about = "Create the canonical directory structure")]
    Layout(LayoutArgs),
    #[command(about = "Check request tables against their provenance documents")]
    Provenance(ProvenanceArgs),
}

#[derive(Args)]
struct CatalogArgs {
    #[arg(long)]
    requests_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    out_dir: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct FetchArgs {
    dataset: String,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct LayoutArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct ProvenanceArgs {
    #[arg(long)]
    requests_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    provenance_dir: Option<Utf8PathBuf>,

    /// Also write the JSON report to this file
    #[arg(long)]
    report: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<CatalogError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &CatalogError) -> u8 {
    match error {
        CatalogError::MissingConfig
        | CatalogError::ConfigSchema { .. }
        | CatalogError::UnknownDataset(_)
        | CatalogError::NoRequestTables(_) => 2,
        CatalogError::CdsHttp(_) | CatalogError::CdsStatus { .. } | CatalogError::CdsRequest(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let sink: &dyn ProgressSink = match mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &StderrProgress,
    };

    let config = ConfigLoader::resolve_or_default(cli.config.as_deref())?;
    let retriever = CdsHttpClient::from_env()?;
    let app = App::new(config, retriever);

    match cli.command {
        Commands::Catalog(args) => {
            let result = app.catalog(
                CatalogOptions {
                    requests_dir: args.requests_dir,
                    out_dir: args.out_dir,
                },
                sink,
            )?;
            match mode {
                OutputMode::Json => JsonOutput::print_catalog(&result).into_diagnostic()?,
                OutputMode::Human => HumanOutput::print_catalog(&result),
            }
            if result.has_schema_errors() || result.has_lineage_errors() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Fetch(args) => {
            let result = app.fetch(
                &args.dataset,
                FetchOptions {
                    dry_run: args.dry_run,
                },
                sink,
            )?;
            match mode {
                OutputMode::Json => JsonOutput::print_fetch(&result).into_diagnostic()?,
                OutputMode::Human => HumanOutput::print_fetch(&result),
            }
        }
        Commands::Layout(args) => {
            let result = app.layout(args.dry_run, sink)?;
            match mode {
                OutputMode::Json => JsonOutput::print_layout(&result).into_diagnostic()?,
                OutputMode::Human => HumanOutput::print_layout(&result),
            }
            if result.has_schema_errors() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Provenance(args) => {
            let report = app.provenance(
                ProvenanceOptions {
                    requests_dir: args.requests_dir,
                    provenance_dir: args.provenance_dir,
                },
                sink,
            )?;
            match mode {
                OutputMode::Json => JsonOutput::print_provenance(&report).into_diagnostic()?,
                OutputMode::Human => HumanOutput::print_provenance(&report),
            }
            if let Some(path) = args.report {
                provenance::write_report(&report, &path)?;
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
