use std::io::{self, Write};

use serde::Serialize;

use crate::app::{CatalogResult, FetchResult, LayoutResult, ProgressEvent, ProgressSink};
use crate::provenance::{ProvenanceReport, ProvenanceStatus};

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_catalog(result: &CatalogResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_layout(result: &LayoutResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_provenance(report: &ProvenanceReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress lines on stderr; stdout stays reserved for results.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_catalog(result: &CatalogResult) {
        println!("{CYAN}catalogue summary{RESET}");
        for run in &result.runs {
            println!(
                "  {} {} ({}): {GREEN}{} complete{RESET}, {YELLOW}{} partial{RESET}, {RED}{} missing{RESET}",
                run.dataset,
                run.product_type,
                run.kind,
                run.summary.complete,
                run.summary.partial,
                run.summary.missing
            );
        }
        println!(
            "{GREEN}complete: {}{RESET}  {YELLOW}partial: {}{RESET}  {RED}missing: {}{RESET}",
            result.summary.complete, result.summary.partial, result.summary.missing
        );
        println!("merged table: {}", result.merged);
        println!("overview: {}", result.overview);
        for lineage in &result.lineage_errors {
            println!(
                "{RED}lineage: dropped {}/{} ({}, {}): {}{RESET}",
                lineage.dataset,
                lineage.variable,
                lineage.temporal_resolution,
                lineage.interpolation,
                lineage.message
            );
        }
        for error in &result.errors {
            println!("{RED}schema error in {}: {}{RESET}", error.file, error.message);
        }
    }

    pub fn print_fetch(result: &FetchResult) {
        let report = &result.report;
        println!(
            "{CYAN}{} ({}, {} rows, {} workers){RESET}",
            result.dataset, result.catalogue_id, result.rows, result.workers
        );
        if report.dry_run {
            println!("{YELLOW}dry run: {} units planned{RESET}", report.planned.len());
            for target in &report.planned {
                println!("  {target}");
            }
        } else {
            println!("{GREEN}fetched: {}{RESET}", report.succeeded.len());
            for done in &report.succeeded {
                println!("  {}", done.target);
            }
        }
        println!("skipped (present): {}", report.skipped);
        println!("{RED}failed: {}{RESET}", report.failed.len());
        for failure in &report.failed {
            println!(
                "{RED}  {}/{} {} -> {}: {}{RESET}",
                failure.dataset, failure.variable, failure.unit, failure.target, failure.message
            );
        }
        for table in &result.skipped_tables {
            println!("{YELLOW}ignored {}: {}{RESET}", table.file, table.message);
        }
    }

    pub fn print_layout(result: &LayoutResult) {
        let report = &result.report;
        let verb = if report.dry_run { "would create" } else { "created" };
        for directory in &report.directories {
            println!("{verb} {directory}");
        }
        println!(
            "{CYAN}{} tables: {} raw, {} derived directories{RESET}",
            result.tables, report.raw, report.derived
        );
        for error in &result.errors {
            println!("{RED}schema error in {}: {}{RESET}", error.file, error.message);
        }
    }

    pub fn print_provenance(report: &ProvenanceReport) {
        for check in &report.results {
            match check.status {
                ProvenanceStatus::Ok => println!(
                    "{GREEN}[ok]{RESET} {} ({})",
                    check.dataset,
                    check.provenance.as_deref().unwrap_or_default()
                ),
                ProvenanceStatus::ExtraVarsInJson => println!(
                    "{CYAN}[{}]{RESET} {}: {}",
                    check.status.as_str(),
                    check.dataset,
                    check.extra.join(", ")
                ),
                ProvenanceStatus::VarsMissingInJson => println!(
                    "{YELLOW}[{}]{RESET} {}: {}",
                    check.status.as_str(),
                    check.dataset,
                    check.undocumented.join(", ")
                ),
                ProvenanceStatus::MissingProvenance
                | ProvenanceStatus::InvalidJson
                | ProvenanceStatus::InvalidTable => println!(
                    "{RED}[{}]{RESET} {}: {}",
                    check.status.as_str(),
                    check.dataset,
                    check.message.as_deref().unwrap_or_default()
                ),
            }
        }
        println!(
            "{CYAN}{} datasets checked, {} without provenance, {} undocumented variables{RESET}",
            report.datasets_checked, report.missing_provenance, report.undocumented_variables
        );
    }
}
