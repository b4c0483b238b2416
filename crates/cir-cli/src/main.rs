use std::path::PathBuf;

use anyhow::Result;
use cir_backend::HttpBackend;
use cir_merge::{ImportPipeline, LinkOverrides, MergeRunReport, PipelineConfig, SheetPaths};
use cir_sheets::SheetConfig;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cir")]
#[command(about = "CRM import reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct SheetArgs {
    /// Contacts export file (CSV/TSV/XLSX)
    #[arg(long)]
    contacts: PathBuf,
    /// Leads list file
    #[arg(long)]
    leads: PathBuf,
    /// Estimates list file
    #[arg(long)]
    estimates: PathBuf,
    /// Jobsite export file
    #[arg(long)]
    jobsites: PathBuf,
    /// Column-map overrides (YAML), overlaid on the built-in defaults
    #[arg(long)]
    config: Option<PathBuf>,
}

impl SheetArgs {
    fn paths(&self) -> SheetPaths {
        SheetPaths {
            contacts: self.contacts.clone(),
            leads: self.leads.clone(),
            estimates: self.estimates.clone(),
            jobsites: self.jobsites.clone(),
        }
    }

    fn sheet_config(&self) -> Result<SheetConfig> {
        match &self.config {
            Some(path) => SheetConfig::from_yaml_file(path),
            None => Ok(SheetConfig::default()),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse the four sheets, merge them and write reports/snapshots
    Merge(SheetArgs),
    /// Merge, then diff the result against the live backend
    Compare(SheetArgs),
    /// Merge and push the confirmed data through the bulk-upsert endpoints
    Import {
        #[command(flatten)]
        sheets: SheetArgs,
        /// Actually push; without this flag the import is a dry run
        #[arg(long)]
        yes: bool,
    },
    /// Run the review/linking API
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Merge(args) => {
            let (_pipeline, report) = run_merge(&args).await?;
            print_merge_summary(&report);
        }
        Commands::Compare(args) => {
            let (pipeline, report) = run_merge(&args).await?;
            let backend = HttpBackend::from_env()?;
            let comparison = pipeline
                .compare(&backend, &report.merged, &report.valid_ids)
                .await?;
            for (label, entity) in [
                ("accounts", &comparison.accounts),
                ("contacts", &comparison.contacts),
                ("estimates", &comparison.estimates),
                ("jobsites", &comparison.jobsites),
            ] {
                println!(
                    "{label}: new={} updated={} unchanged={} orphaned={}",
                    entity.new.len(),
                    entity.updated.len(),
                    entity.unchanged,
                    entity.orphaned.len()
                );
            }
        }
        Commands::Import { sheets, yes } => {
            let (pipeline, report) = run_merge(&sheets).await?;
            print_merge_summary(&report);
            for issue in &report.reference_report.errors {
                eprintln!(
                    "reference error: {} {}: {}",
                    issue.record_type, issue.record_id, issue.message
                );
            }
            if !yes {
                println!(
                    "dry run: would push {} accounts, {} contacts, {} estimates, {} jobsites (re-run with --yes)",
                    report.merged.accounts.len(),
                    report.merged.contacts.len(),
                    report.merged.estimates.len(),
                    report.merged.jobsites.len()
                );
                return Ok(());
            }
            let backend = HttpBackend::from_env()?;
            let outcome = pipeline
                .commit(&backend, &report.merged, &report.valid_ids)
                .await;
            for (entity, push) in &outcome.entities {
                println!(
                    "{entity}: pushed={} created={} updated={} failed={}",
                    push.pushed, push.created, push.updated, push.failed_records
                );
            }
            for error in &outcome.errors {
                eprintln!("import error: {error}");
            }
        }
        Commands::Serve => cir_web::serve_from_env().await?,
    }

    Ok(())
}

async fn run_merge(args: &SheetArgs) -> Result<(ImportPipeline, MergeRunReport)> {
    let pipeline = ImportPipeline::new(PipelineConfig::from_env());
    let report = pipeline
        .merge_once(&args.paths(), &args.sheet_config()?, &LinkOverrides::default())
        .await?;
    Ok((pipeline, report))
}

fn print_merge_summary(report: &MergeRunReport) {
    let stats = &report.merged.stats;
    println!(
        "merge complete: run_id={} accounts={} contacts={} estimates={} jobsites={} reports={}",
        report.run_id,
        stats.total_accounts,
        stats.total_contacts,
        stats.estimate_linking.total,
        stats.jobsite_linking.total,
        report.reports_dir
    );
    println!(
        "estimate linking: {}/{} linked ({:.1}%), {} orphaned",
        stats.estimate_linking.linked,
        stats.estimate_linking.total,
        stats.estimate_linking.link_rate,
        stats.estimate_linking.orphaned
    );
    println!(
        "jobsite linking: {}/{} linked ({:.1}%), {} orphaned",
        stats.jobsite_linking.linked,
        stats.jobsite_linking.total,
        stats.jobsite_linking.link_rate,
        stats.jobsite_linking.orphaned
    );
    if !report.merged.warnings.is_empty() {
        println!("warnings: {}", report.merged.warnings.len());
    }
}
