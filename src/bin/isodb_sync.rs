use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use isodb_sync::app::{App, AuditResult, ProgressSink, RunDetail, StatusReport, SyncOptions, SyncReport};
use isodb_sync::campaign::{CampaignResult, DEFAULT_CAMPAIGN};
use isodb_sync::config::{ConfigLoader, ResolvedConfig};
use isodb_sync::domain::{RecordKey, ResourceKind};
use isodb_sync::error::SyncError;
use isodb_sync::fetch::{IsodbHttpClient, RateGate};
use isodb_sync::normalize::{NormalizationStats, Normalizer};
use isodb_sync::output::{JsonOutput, OutputMode, StderrProgress};
use isodb_sync::store::Store;
use isodb_sync::units::{Conversion, ConversionRegistry};

#[derive(Parser)]
#[command(name = "isodb-sync")]
#[command(about = "Incremental, audited mirror of the NIST ISODB adsorption database")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./isodb-sync.json when present)
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
    #[command(about = "Fetch a resource kind (or all kinds) and apply the changes")]
    Sync(SyncArgs),
    #[command(about = "Show record counts, last syncs and campaign checkpoints")]
    Status(StatusArgs),
    #[command(about = "Query the change history")]
    Audit(AuditArgs),
    #[command(about = "Fetch per-isotherm detail in resumable batches")]
    Campaign(CampaignArgs),
    #[command(about = "Recompute normalized points from stored raw points")]
    Normalize(NormalizeArgs),
    #[command(about = "List the active unit conversion table")]
    Units(UnitsArgs),
}

#[derive(Args)]
struct SyncArgs {
    /// Resource kind; all kinds when omitted
    kind: Option<ResourceKind>,

    #[arg(long)]
    dry_run: bool,

    /// Apply a plan even when it deletes more than the configured share
    #[arg(long)]
    confirm_deletions: bool,

    #[arg(long)]
    skip_isotherm_counts: bool,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args)]
struct AuditArgs {
    #[command(subcommand)]
    command: AuditCommand,
}

#[derive(Subcommand)]
enum AuditCommand {
    #[command(about = "All changes to one record, oldest first")]
    History { kind: ResourceKind, key: String },
    #[command(about = "Changes recorded between two times (RFC 3339 or YYYY-MM-DD)")]
    Range { from: String, to: String },
    #[command(about = "One sync run and its changes")]
    Run { id: i64 },
}

#[derive(Args)]
struct CampaignArgs {
    #[arg(long, default_value = DEFAULT_CAMPAIGN)]
    name: String,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Re-fetch stored isotherms and ignore the checkpoint
    #[arg(long)]
    force: bool,

    /// Explicit isotherm keys; defaults to every stored isotherm
    #[arg(long, value_delimiter = ',')]
    keys: Vec<String>,
}

#[derive(Args)]
struct NormalizeArgs {
    /// Conversion table overriding the configured one
    #[arg(long)]
    conversions: Option<String>,

    /// Only report coverage of the current normalized table
    #[arg(long)]
    stats_only: bool,
}

#[derive(Args)]
struct UnitsArgs {
    #[arg(long)]
    conversions: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::ReconciliationFlagged { .. } => 2,
        SyncError::Fetch(_) => 3,
        SyncError::CampaignAborted { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
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
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Units(args) => {
            let registry = load_registry(&config, args.conversions.as_deref())?;
            print_units(&registry, mode)
        }
        Commands::Sync(args) => {
            let app = build_app(&config, None)?;
            let options = SyncOptions {
                dry_run: args.dry_run,
                confirm_deletions: args.confirm_deletions,
                skip_isotherm_counts: args.skip_isotherm_counts,
            };
            let reports = match args.kind {
                Some(kind) => vec![app.sync(kind, options, sink(mode))?],
                None => app.sync_all(options, sink(mode))?,
            };
            emit(mode, &reports, |reports| reports.iter().for_each(print_sync_report))
        }
        Commands::Status(args) => {
            let app = build_app(&config, None)?;
            let report = app.status(args.verbose)?;
            emit(mode, &report, print_status)
        }
        Commands::Audit(args) => {
            let app = build_app(&config, None)?;
            match args.command {
                AuditCommand::History { kind, key } => {
                    let key = key.parse::<RecordKey>()?;
                    let result = app.history(kind, &key)?;
                    emit(mode, &result, print_changes)
                }
                AuditCommand::Range { from, to } => {
                    let result = app.changes_between(&from, &to)?;
                    emit(mode, &result, print_changes)
                }
                AuditCommand::Run { id } => {
                    let detail = app.run_detail(id)?;
                    emit(mode, &detail, print_run_detail)
                }
            }
        }
        Commands::Campaign(args) => {
            let app = build_app(&config, None)?;
            let keys = if args.keys.is_empty() {
                None
            } else {
                Some(
                    args.keys
                        .iter()
                        .map(|key| key.parse::<RecordKey>())
                        .collect::<Result<Vec<_>, _>>()?,
                )
            };
            let options = app.campaign_options(args.batch_size, args.force);
            let result = app.run_campaign(&args.name, keys, options, sink(mode))?;
            emit(mode, &result, print_campaign)
        }
        Commands::Normalize(args) => {
            let app = build_app(&config, args.conversions.as_deref())?;
            let stats = if args.stats_only {
                app.normalization_stats()?
            } else {
                app.normalize(sink(mode))?
            };
            emit(mode, &stats, print_stats)
        }
    }
}

fn build_app(
    config: &ResolvedConfig,
    conversions: Option<&str>,
) -> miette::Result<App<IsodbHttpClient>> {
    let store = Store::open(&config.database)?;
    let gate = RateGate::new(config.api.min_request_interval);
    let client = IsodbHttpClient::new(&config.api, gate)?;
    let normalizer = Normalizer::new(load_registry(config, conversions)?);
    Ok(App::from_config(store, client, config, normalizer))
}

fn load_registry(
    config: &ResolvedConfig,
    conversions: Option<&str>,
) -> Result<ConversionRegistry, SyncError> {
    let path = conversions
        .map(camino::Utf8PathBuf::from)
        .or_else(|| config.conversions.clone());
    match path {
        Some(path) => ConversionRegistry::load(&path),
        None => Ok(ConversionRegistry::builtin()),
    }
}

fn sink(mode: OutputMode) -> &'static dyn ProgressSink {
    match mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &StderrProgress,
    }
}

fn emit<T: serde::Serialize>(
    mode: OutputMode,
    value: &T,
    human: impl FnOnce(&T),
) -> miette::Result<()> {
    match mode {
        OutputMode::Json => JsonOutput::print(value)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?,
        OutputMode::Human => human(value),
    }
    Ok(())
}

fn print_sync_report(report: &SyncReport) {
    let run = report
        .run_id
        .map(|id| format!(" (run {id})"))
        .unwrap_or_default();
    println!(
        "{} [{}] {}{run}",
        report.kind,
        report.mode.as_str(),
        report.outcome.as_str()
    );
    println!("  {}", report.counts);
    println!(
        "  deletion ratio {:.3} of {} stored (threshold {:.2})",
        report.deletion_ratio, report.previous_total, report.threshold
    );
    for change in &report.changes {
        println!("  {:<7} {}", change.change.as_str(), change.key);
    }
}

fn print_status(report: &StatusReport) {
    if let Some(database) = &report.database {
        println!("database: {database}");
    }
    for kind in &report.kinds {
        println!(
            "{:<13} {:>8} records  last sync {}",
            kind.kind.as_str(),
            kind.records,
            kind.last_sync.as_deref().unwrap_or("never")
        );
    }
    println!(
        "isotherm detail: {} isotherms, {} raw points",
        report.isotherm_details, report.raw_points
    );
    for checkpoint in &report.checkpoints {
        println!(
            "campaign {}: after {} ({} attempted, {} succeeded, {} failed)",
            checkpoint.campaign,
            checkpoint
                .last_key
                .as_ref()
                .map(RecordKey::as_str)
                .unwrap_or("-"),
            checkpoint.attempted,
            checkpoint.succeeded,
            checkpoint.failed
        );
    }
    if !report.recent_runs.is_empty() {
        println!("recent runs:");
        for run in &report.recent_runs {
            println!(
                "  #{} {} {} {} {}",
                run.id.unwrap_or_default(),
                run.started_at,
                run.kind,
                run.outcome.as_str(),
                run.counts
            );
        }
    }
    if !report.recent_changes.is_empty() {
        println!("recent changes:");
        print_change_lines(&report.recent_changes);
    }
}

fn print_changes(result: &AuditResult) {
    if result.changes.is_empty() {
        println!("no changes recorded");
        return;
    }
    print_change_lines(&result.changes);
}

fn print_change_lines(changes: &[isodb_sync::audit::ChangeRecord]) {
    for change in changes {
        println!(
            "  {} run {} {:<7} {} {}",
            change.recorded_at,
            change.run_id,
            change.change.as_str(),
            change.kind,
            change.subject_key
        );
    }
}

fn print_run_detail(detail: &RunDetail) {
    let run = &detail.run;
    println!(
        "run {} {} {} {}",
        run.id.unwrap_or_default(),
        run.kind,
        run.mode.as_str(),
        run.outcome.as_str()
    );
    println!(
        "  started {} finished {}",
        run.started_at,
        run.finished_at.as_deref().unwrap_or("-")
    );
    println!("  {}", run.counts);
    if let Some(reason) = &run.reason {
        println!("  reason: {reason}");
    }
    print_change_lines(&detail.changes);
}

fn print_campaign(result: &CampaignResult) {
    println!(
        "campaign {}: {} candidates, {} behind checkpoint, {} already stored",
        result.campaign, result.candidates, result.skipped_checkpoint, result.skipped_fresh
    );
    println!(
        "  {} attempted, {} succeeded, {} failed in {} batches",
        result.attempted, result.succeeded, result.failed, result.batches
    );
    for failure in &result.failures {
        println!("  failed {} ({}): {}", failure.key, failure.kind, failure.message);
    }
}

fn print_stats(stats: &NormalizationStats) {
    println!(
        "{} points: {} pressure converted, {} adsorption converted, {} complete",
        stats.total_points,
        stats.pressure_converted,
        stats.adsorption_converted,
        stats.fully_normalized
    );
    for (reason, count) in &stats.pressure_reasons {
        println!("  pressure null   {reason}: {count}");
    }
    for (reason, count) in &stats.adsorption_reasons {
        println!("  adsorption null {reason}: {count}");
    }
    for (unit, count) in &stats.pressure_units {
        println!("  pressure unit   {unit}: {count} isotherms");
    }
    for (unit, count) in &stats.adsorption_units {
        println!("  adsorption unit {unit}: {count} isotherms");
    }
}

fn print_units(registry: &ConversionRegistry, mode: OutputMode) -> miette::Result<()> {
    if mode == OutputMode::Json {
        let entries = registry.entries().collect::<Vec<_>>();
        let value = serde_json::json!({
            "conversions": entries,
            "molar_masses": registry.molar_masses(),
        });
        JsonOutput::print(&value).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        return Ok(());
    }
    for entry in registry.entries() {
        let rule = match entry.conversion {
            Conversion::Linear { factor, offset } if offset == 0.0 => format!("x {factor}"),
            Conversion::Linear { factor, offset } => format!("x {factor} + {offset}"),
            Conversion::PerMolarMass { factor } => format!("x {factor} / M"),
        };
        println!(
            "{:<10} {:<12} -> {:<7} {:<16} {}",
            entry.axis.to_string(),
            entry.from,
            entry.to,
            rule,
            entry.description
        );
    }
    for (gas, mass) in registry.molar_masses() {
        println!("M({gas}) = {mass} g/mol");
    }
    Ok(())
}
