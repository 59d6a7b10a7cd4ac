use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fshuttle::{
    Shuttle,
    catalog::EdmCatalog,
    config::ShuttleConfig,
    errors::{Result as ShuttleResult, ShuttleError},
    mapping::MappingEngine,
    models::{IntegrationReport, Row, StorageDestination},
    plan::ExtractionPlan,
    resolver::StableKeyResolver,
};
use log::LevelFilter;
use url::Url;

/// Runs the command line interface for the shuttle integrator.
pub async fn run_cli() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default());
    logger.filter_level(LevelFilter::from(cli.log_level));
    let _ = logger.try_init();

    execute(cli).await
}

#[derive(Parser, Debug)]
#[command(
    name = "shuttle",
    about = "Map tabular rows into entities and associations and integrate them into storage."
)]
pub struct Cli {
    /// Minimum log level to display.
    #[arg(long, default_value_t = LogLevelArg::Info, value_enum, global = true)]
    log_level: LogLevelArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Integrate a CSV or NDJSON source with an extraction plan.
    Run(RunArgs),
    /// Check an extraction plan against a catalog and the configured destinations
    /// without reading any rows.
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
struct PlanArgs {
    /// Extraction plan (JSON).
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    plan: PathBuf,
    /// Catalog snapshot with property types and entity sets (JSON).
    #[arg(long, env = "SHUTTLE_CATALOG", value_hint = clap::ValueHint::FilePath)]
    catalog: PathBuf,
}

#[derive(Args, Debug)]
struct RoutingArgs {
    /// Destination for properties the plan does not route explicitly.
    #[arg(long, value_enum, default_value_t = DestinationArg::Relational)]
    default_destination: DestinationArg,
    /// Base URL of the remote data API.
    #[arg(long, env = "SHUTTLE_REMOTE_URL")]
    remote_url: Option<Url>,
}

impl RoutingArgs {
    /// Destinations a run with these flags has a handler for.
    fn is_registered(&self, destination: StorageDestination) -> bool {
        match destination {
            StorageDestination::RemoteApi => self.remote_url.is_some(),
            _ => true,
        }
    }
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[command(flatten)]
    plan: PlanArgs,
    #[command(flatten)]
    routing: RoutingArgs,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    plan: PlanArgs,
    #[command(flatten)]
    routing: RoutingArgs,
    /// CSV source with a header row.
    #[arg(long, conflicts_with = "ndjson", required_unless_present = "ndjson")]
    csv: Option<PathBuf>,
    /// Newline-delimited JSON source, one object per line.
    #[arg(long)]
    ndjson: Option<PathBuf>,
    /// Directory holding the relational store and the blob store.
    #[arg(long, env = "SHUTTLE_BASE_PATH", default_value = ".")]
    base_path: PathBuf,
    /// Flush once a destination holds more than this many entities or associations.
    #[arg(long, env = "SHUTTLE_BATCH_SIZE")]
    batch_size: Option<usize>,
    /// Number of mapping workers.
    #[arg(long, env = "SHUTTLE_PARALLELISM")]
    parallelism: Option<usize>,
    /// Bearer token for the remote data API.
    #[arg(long, env = "SHUTTLE_REMOTE_TOKEN", hide_env_values = true)]
    remote_token: Option<String>,
    /// Webhook notified with the run report.
    #[arg(long, env = "SHUTTLE_NOTIFY_URL")]
    notify_url: Option<Url>,
    /// How natural keys become surrogate ids.
    #[arg(long, value_enum, default_value_t = ResolverArg::Store)]
    resolver: ResolverArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LevelFilter {
    fn from(value: LogLevelArg) -> Self {
        match value {
            LogLevelArg::Error => LevelFilter::Error,
            LogLevelArg::Warn => LevelFilter::Warn,
            LogLevelArg::Info => LevelFilter::Info,
            LogLevelArg::Debug => LevelFilter::Debug,
            LogLevelArg::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DestinationArg {
    Relational,
    Blob,
    RemoteApi,
    None,
}

impl From<DestinationArg> for StorageDestination {
    fn from(value: DestinationArg) -> Self {
        match value {
            DestinationArg::Relational => StorageDestination::Relational,
            DestinationArg::Blob => StorageDestination::Blob,
            DestinationArg::RemoteApi => StorageDestination::RemoteApi,
            DestinationArg::None => StorageDestination::None,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ResolverArg {
    /// Persist the key map in the relational store.
    Store,
    /// Derive ids from the keys; nothing is stored.
    Stable,
}

pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Validate(args) => handle_validate(args),
        Command::Run(args) => {
            let report = handle_run(args).await?;
            print_report(&report);
            Ok(())
        }
    }
}

fn load_inputs(args: &PlanArgs) -> anyhow::Result<(EdmCatalog, ExtractionPlan)> {
    let catalog = EdmCatalog::load(&args.catalog)
        .with_context(|| format!("failed to load catalog '{}'", args.catalog.display()))?;
    let plan = ExtractionPlan::load(&args.plan)
        .with_context(|| format!("failed to load plan '{}'", args.plan.display()))?;
    Ok((catalog, plan))
}

fn handle_validate(args: ValidateArgs) -> anyhow::Result<()> {
    let (catalog, plan) = load_inputs(&args.plan)?;
    let default_destination = args.routing.default_destination.into();
    let engine = MappingEngine::new(&plan, &catalog, default_destination)
        .with_context(|| format!("plan '{}' is invalid", plan.name))?;
    engine
        .ensure_routable(|destination| args.routing.is_registered(destination))
        .with_context(|| format!("plan '{}' cannot be routed", plan.name))?;
    println!(
        "Plan '{}' is valid: {} entities, {} associations.",
        plan.name,
        plan.entities.len(),
        plan.associations.len()
    );
    Ok(())
}

async fn handle_run(args: RunArgs) -> anyhow::Result<IntegrationReport> {
    let (catalog, plan) = load_inputs(&args.plan)?;

    if !args.base_path.exists() {
        bail!("Base path '{}' does not exist", args.base_path.display());
    }
    let mut config = ShuttleConfig::new(&args.base_path);
    if let Some(size) = args.batch_size {
        config = config.with_upload_batch_size(size);
    }
    if let Some(parallelism) = args.parallelism {
        config = config.with_parallelism(parallelism);
    }
    config.default_destination = args.routing.default_destination.into();
    config.remote_api_url = args.routing.remote_url;
    config.remote_api_token = args.remote_token;
    config.notification_url = args.notify_url;

    let mut shuttle = Shuttle::new(config, catalog)
        .await
        .context("failed to open shuttle storage")?;
    if let ResolverArg::Stable = args.resolver {
        shuttle = shuttle.with_resolver(Arc::new(StableKeyResolver));
    }

    let report = match (&args.csv, &args.ndjson) {
        (Some(path), _) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open CSV source '{}'", path.display()))?;
            shuttle.integrate(&plan, csv_rows(file)?).await?
        }
        (None, Some(path)) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open NDJSON source '{}'", path.display()))?;
            shuttle.integrate(&plan, ndjson_rows(BufReader::new(file))).await?
        }
        (None, None) => bail!("one of --csv or --ndjson is required"),
    };
    Ok(report)
}

fn print_report(report: &IntegrationReport) {
    println!(
        "Plan '{}': {} rows read, {} flushes.",
        report.plan, report.rows_read, report.flushes
    );
    println!("{:<12} {:>10} {:>14}", "DESTINATION", "ENTITIES", "ASSOCIATIONS");
    for (destination, counts) in &report.destinations {
        println!(
            "{:<12} {:>10} {:>14}",
            destination.to_string(),
            counts.entities,
            counts.associations
        );
    }
}

/// Rows of a CSV file with a header row; every cell is a string.
pub struct CsvRows<R: Read> {
    reader: csv::Reader<R>,
    headers: Vec<String>,
    record: csv::StringRecord,
}

pub fn csv_rows<R: Read>(input: R) -> ShuttleResult<CsvRows<R>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(input);
    let headers = reader
        .headers()
        .map_err(|e| ShuttleError::Source(format!("failed to read CSV headers: {e}")))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    Ok(CsvRows {
        reader,
        headers,
        record: csv::StringRecord::new(),
    })
}

impl<R: Read> Iterator for CsvRows<R> {
    type Item = ShuttleResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_record(&mut self.record) {
            Ok(true) => Some(Ok(self
                .headers
                .iter()
                .zip(self.record.iter())
                .map(|(h, v)| (h.clone(), serde_json::Value::String(v.to_string())))
                .collect())),
            Ok(false) => None,
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or_default();
                Some(Err(ShuttleError::Source(format!("CSV line {line}: {e}"))))
            }
        }
    }
}

/// Rows of a newline-delimited JSON file. Blank lines are skipped.
pub fn ndjson_rows<R: BufRead>(input: R) -> impl Iterator<Item = ShuttleResult<Row>> {
    input
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let line_number = index + 1;
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    return Some(Err(ShuttleError::Source(format!(
                        "NDJSON line {line_number}: {e}"
                    ))));
                }
            };
            if line.trim().is_empty() {
                return None;
            }
            Some(match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(serde_json::Value::Object(row)) => Ok(row),
                Ok(_) => Err(ShuttleError::Source(format!(
                    "NDJSON line {line_number}: expected a JSON object"
                ))),
                Err(e) => Err(ShuttleError::Source(format!("NDJSON line {line_number}: {e}"))),
            })
        })
}
