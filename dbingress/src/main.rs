//! Referentially consistent database subsetting tool.
//!
//! This binary derives an ingress descriptor from a database's foreign keys,
//! shows the extraction plan built from it, and pulls nested rows as JSON
//! lines.
//!
//! # Guarantees
//! - Read-only database operations only
//! - Database URLs are redacted before being logged

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use dbingress_core::{
    Filter, JsonFileStorage, JsonLinesExporter, ParallelPuller, Puller, PullerConfig, RowExporter,
    SequentialPuller, SourceConfig, SqliteSource, error::redact_database_url, ingress,
    logging::init_logging,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "dbingress")]
#[command(about = "Referentially consistent database subsetting tool")]
#[command(version)]
#[command(long_about = "
DBIngress - Pull related rows out of a database

Starting from the rows of one table, DBIngress follows the foreign keys an
ingress descriptor flags as active and writes every start row with its related
rows nested under the relation names, one JSON document per line.

WORKFLOW:
  1. create  derive a descriptor from the database's foreign keys
  2. edit    enable look_up_parent / look_up_child flags as needed
  3. plan    review the extraction plan
  4. pull    extract rows

EXAMPLES:
  dbingress --database-url sqlite://shop.db create customers
  dbingress plan
  dbingress --database-url sqlite://shop.db pull --where id=1 --output out.jsonl
  dbingress --database-url sqlite://shop.db pull --workers 8 --limit 1000
")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Derive and store the default descriptor for a start table
    Create(CreateArgs),
    /// Show the extraction plan of the stored descriptor
    Plan(PlanArgs),
    /// Pull rows following the stored descriptor
    Pull(PullArgs),
}

#[derive(Args)]
struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all output except errors")]
    quiet: bool,

    /// Database connection URL
    #[arg(
        long,
        global = true,
        env = "DATABASE_URL",
        help = "Database connection string (credentials will be sanitized in logs)"
    )]
    database_url: Option<String>,

    /// Ingress descriptor file
    #[arg(
        short,
        long,
        global = true,
        default_value = "ingress.json",
        help = "Ingress descriptor file"
    )]
    descriptor: PathBuf,
}

#[derive(Args)]
struct CreateArgs {
    /// Start table
    #[arg(help = "Table whose rows are pulled first")]
    start_table: String,
}

#[derive(Args)]
struct PlanArgs {
    /// Print the plan as JSON
    #[arg(long, help = "Print the plan as JSON instead of a tree")]
    json: bool,
}

#[derive(Args)]
struct PullArgs {
    /// Number of parallel workers
    #[arg(long, help = "Expand start rows on N parallel workers (output order not kept)")]
    workers: Option<usize>,

    /// Maximum number of start rows
    #[arg(long, help = "Maximum number of start rows to pull")]
    limit: Option<u64>,

    /// Equality constraints on the start table
    #[arg(
        long = "where",
        value_name = "COLUMN=VALUE",
        help = "Only pull start rows where COLUMN equals VALUE (repeatable)"
    )]
    conditions: Vec<String>,

    /// Free-form predicate on the start table
    #[arg(long, help = "SQL predicate appended to the start table read")]
    predicate: Option<String>,

    /// Read distinct start rows only
    #[arg(long, help = "Read distinct start rows only")]
    distinct: bool,

    /// Keep going after a worker error
    #[arg(long, help = "With --workers, finish every row before reporting errors")]
    no_fail_fast: bool,

    /// Output file path
    #[arg(short, long, help = "Output file path (standard output if omitted)")]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.global.verbose, cli.global.quiet)?;

    match &cli.command {
        Command::Create(args) => create_descriptor(&cli.global, args).await,
        Command::Plan(args) => show_plan(&cli.global, args).await,
        Command::Pull(args) => pull_rows(&cli.global, args).await,
    }
}

/// Connects to the database named by `--database-url`.
async fn connect(global: &GlobalArgs, max_connections: u32) -> anyhow::Result<SqliteSource> {
    let Some(database_url) = global.database_url.as_deref() else {
        bail!("A database URL is required (--database-url or DATABASE_URL)");
    };

    info!("Target: {}", redact_database_url(database_url));
    let config = SourceConfig::default().with_max_connections(max_connections);
    SqliteSource::connect(database_url, config)
        .await
        .with_context(|| format!("Failed to connect to {}", redact_database_url(database_url)))
}

async fn create_descriptor(global: &GlobalArgs, args: &CreateArgs) -> anyhow::Result<()> {
    let source = connect(global, 1).await?;
    let storage = JsonFileStorage::new(&global.descriptor);

    let descriptor = ingress::create(&args.start_table, &source, &storage)
        .await
        .with_context(|| format!("Failed to create descriptor for '{}'", args.start_table))?;

    println!("Descriptor written to {}", global.descriptor.display());
    println!("Start table: {}", descriptor.start_table);
    println!("Relations: {}", descriptor.relations.len());
    println!(
        "Child lookups enabled: {}",
        descriptor.active_relations().count()
    );
    Ok(())
}

async fn show_plan(global: &GlobalArgs, args: &PlanArgs) -> anyhow::Result<()> {
    let storage = JsonFileStorage::new(&global.descriptor);

    // Metadata is optional here; without a database the plan is shown unresolved.
    let plan = if global.database_url.is_some() {
        let source = connect(global, 1).await?;
        ingress::get_resolved_plan(&storage, &source).await?
    } else {
        ingress::get_puller_plan(&storage).await?
    };

    if args.json {
        let json = serde_json::to_string_pretty(&plan).context("Failed to serialize plan")?;
        println!("{json}");
    } else {
        print!("{plan}");
    }
    Ok(())
}

/// Parses `COLUMN=VALUE`; values that are valid JSON keep their type.
fn parse_condition(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let Some((column, value)) = raw.split_once('=') else {
        bail!("Invalid --where '{}', expected COLUMN=VALUE", raw);
    };
    let column = column.trim();
    if column.is_empty() {
        bail!("Invalid --where '{}', the column name is empty", raw);
    }

    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((column.to_string(), value))
}

fn build_filter(args: &PullArgs) -> anyhow::Result<Filter> {
    let mut filter = Filter::new().with_distinct(args.distinct);
    for raw in &args.conditions {
        let (column, value) = parse_condition(raw)?;
        filter = filter.with_value(column, value);
    }
    if let Some(limit) = args.limit {
        filter = filter.with_limit(limit);
    }
    if let Some(predicate) = &args.predicate {
        filter = filter.with_predicate(predicate.clone());
    }
    Ok(filter)
}

async fn pull_rows(global: &GlobalArgs, args: &PullArgs) -> anyhow::Result<()> {
    let filter = build_filter(args)?;
    let workers = args.workers.unwrap_or(1);
    let max_connections = u32::try_from(workers).unwrap_or(u32::MAX).clamp(1, 100);

    let source = Arc::new(connect(global, max_connections).await?);
    let storage = JsonFileStorage::new(&global.descriptor);
    let plan = ingress::get_resolved_plan(&storage, source.as_ref())
        .await
        .context("Failed to build extraction plan")?;

    let exporter: Box<dyn RowExporter> = match &args.output {
        Some(path) => Box::new(JsonLinesExporter::create(path).await?),
        None => Box::new(JsonLinesExporter::stdout()),
    };

    let plan = Arc::new(plan);
    let mut puller: Box<dyn Puller> = match args.workers {
        Some(workers) => {
            let config = PullerConfig::default()
                .with_workers(workers)
                .with_fail_fast(!args.no_fail_fast);
            Box::new(ParallelPuller::new(plan, source, exporter, config)?)
        }
        None => Box::new(SequentialPuller::new(plan, source, exporter)),
    };
    let stats = puller.pull(&filter).await?;

    info!(
        "✓ Pulled {} row(s) ({} row(s) read, {} quer(ies)) in {} ms",
        stats.rows_exported, stats.rows_read, stats.queries, stats.duration_ms
    );
    if let Some(path) = &args.output {
        info!("✓ Output written to {}", path.display());
    }
    Ok(())
}
