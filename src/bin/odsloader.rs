//! odsloader CLI - load CSV extracts into the fitness-center ODS
//!
//! Reads one CSV file per entity, loads them in dependency order, verifies
//! referential integrity and writes a JSON summary report.

use anyhow::{bail, Context};
use clap::Parser;
use dialoguer::{Confirm, Password};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use odsloader::destination::connection::{
    DEFAULT_DATABASE, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_USER,
};
use odsloader::error::display_chain;
use odsloader::plan::DEFAULT_PAGE_SIZE;
use odsloader::{
    BulkLoader, CancelFlag, ConnectionDescriptor, EventSink, LoadError, LoadEvent, LoadPlan,
    PartialLoad, PgDestination, RunMode, SourceInventory, StrategyKind, SummaryReport, TracingSink,
};

/// Exit status after an operator interrupt.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "odsloader")]
#[command(version, about = "Dependency-ordered CSV loader for the fitness-center ODS", long_about = None)]
struct Cli {
    /// Directory containing one <entity>.csv file per table
    #[arg(short = 'd', long, default_value = "data")]
    data_dir: PathBuf,

    /// Load plan YAML (defaults to the built-in fitness-center plan)
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Connection URL; overrides the individual connection options
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "PGHOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, env = "PGPORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, env = "PGDATABASE", default_value = DEFAULT_DATABASE)]
    database: String,

    #[arg(short, long, env = "PGUSER", default_value = DEFAULT_USER)]
    user: String,

    /// Prompted for when omitted and attached to a terminal
    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Seconds to wait for the server to accept a connection [default: 10]
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Seconds a statement may wait for a table lock before failing
    #[arg(long)]
    lock_timeout: Option<u64>,

    /// Delete all rows from every planned relation before loading
    #[arg(long, alias = "truncate")]
    clear: bool,

    /// Do not ask for confirmation before clearing
    #[arg(short, long)]
    yes: bool,

    /// Skip loading; only count rows and run integrity checks
    #[arg(long, conflicts_with = "clear")]
    verify_only: bool,

    /// Force one submission strategy for every entity (bulk-copy, batched-insert)
    #[arg(long)]
    strategy: Option<StrategyKind>,

    /// Rows per statement when --strategy batched-insert is forced
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Abort before loading if any source file is missing
    #[arg(long)]
    strict_sources: bool,

    /// Directory for the JSON summary report
    #[arg(long, default_value = ".")]
    report_dir: PathBuf,

    /// Print the computed load order and exit
    #[arg(long)]
    print_plan: bool,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", display_chain(&*e));
            1
        }
    };

    process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut plan = match cli.plan {
        Some(ref path) => LoadPlan::load_from_file(path)
            .with_context(|| format!("Failed to load plan from {}", path.display()))?,
        None => LoadPlan::builtin().context("Built-in plan is invalid")?,
    };

    if let Some(kind) = cli.strategy {
        if cli.page_size == 0 {
            bail!("--page-size must be greater than zero");
        }
        plan.override_strategy(kind, cli.page_size);
    }
    if cli.strict_sources {
        plan.strict_sources = true;
    }

    if cli.print_plan {
        print_plan(&plan, &cli.data_dir);
        return Ok(0);
    }

    if !cli.verify_only && plan.strict_sources {
        let inventory = SourceInventory::discover(&plan, &cli.data_dir);
        if !inventory.is_complete() {
            for (entity, path) in &inventory.missing {
                tracing::error!("Missing source for {}: {}", entity, path.display());
            }
            bail!(
                "{} of {} source files missing in {}",
                inventory.missing.len(),
                plan.len(),
                cli.data_dir.display()
            );
        }
    }

    let descriptor = resolve_descriptor(&cli)?;

    if cli.clear && !cli.yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "This will delete ALL rows from {} relations in {}. Continue?",
                plan.len(),
                descriptor.redacted()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            tracing::info!("Clear declined; nothing was changed");
            return Ok(0);
        }
    }

    // The first interrupt stops at the next safe point; a second one exits
    // at once, leaving the server to roll back the open transaction.
    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("Interrupt received; stopping at the next safe point (interrupt again to exit now)");
        on_interrupt.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::error!("Second interrupt received; exiting");
            process::exit(EXIT_INTERRUPTED);
        }
    });

    let options = RunOptions {
        data_dir: cli.data_dir,
        report_dir: cli.report_dir,
        clear: cli.clear,
        verify_only: cli.verify_only,
    };

    tokio::task::spawn_blocking(move || execute(plan, descriptor, options, cancel))
        .await
        .context("Load task failed")?
}

struct RunOptions {
    data_dir: PathBuf,
    report_dir: PathBuf,
    clear: bool,
    verify_only: bool,
}

/// Connect, load, verify and report. Runs on a blocking thread.
fn execute(
    plan: LoadPlan,
    descriptor: ConnectionDescriptor,
    options: RunOptions,
    cancel: CancelFlag,
) -> anyhow::Result<i32> {
    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);

    let mut dest = PgDestination::connect(&descriptor).map_err(|source| LoadError::Connection {
        target: descriptor.redacted(),
        source,
    })?;
    dest.test_connection().map_err(|source| LoadError::Connection {
        target: descriptor.redacted(),
        source,
    })?;
    sink.emit(&LoadEvent::Connected {
        target: descriptor.redacted(),
    });
    sink.emit(&LoadEvent::PlanResolved {
        entities: plan.order().iter().map(|e| e.name.clone()).collect(),
        levels: plan.graph().num_levels(),
    });

    let mut loader = BulkLoader::new(dest, sink).with_cancel_flag(cancel.clone());
    let mut failure = None;

    let (mode, results) = if options.verify_only {
        (RunMode::VerifyOnly, Vec::new())
    } else {
        if options.clear {
            if let Err(e) = loader.clear_all(&plan) {
                if cancel.is_cancelled() {
                    tracing::error!("{}", e);
                    return Ok(EXIT_INTERRUPTED);
                }
                return Err(e.into());
            }
        }

        match loader.load_all(&plan, &options.data_dir) {
            Ok(results) => (RunMode::Load, results),
            Err(partial) => {
                tracing::error!("{}", partial);
                let PartialLoad { results, source } = partial;
                failure = Some(source);
                (RunMode::Load, results)
            }
        }
    };

    let table_counts = loader.census(&plan);
    let (date_ranges, integrity) = if cancel.is_cancelled() {
        (Vec::new(), None)
    } else {
        (loader.date_spans(&plan), Some(loader.verify(&plan)))
    };
    drop(loader);

    let report = SummaryReport::summarize(&descriptor, mode, results, table_counts, integrity)
        .with_date_ranges(date_ranges);
    let path = report
        .persist(&options.report_dir)
        .with_context(|| format!("Failed to write report to {}", options.report_dir.display()))?;

    println!("{}", report);
    tracing::info!("Summary report saved to {}", path.display());

    if !report.integrity_passed() {
        tracing::warn!("Some integrity checks did not pass; see the report for details");
    }

    Ok(exit_code(failure.as_ref(), cancel.is_cancelled()))
}

/// 130 whenever the operator interrupted the run, even if loading finished.
fn exit_code(failure: Option<&LoadError>, interrupted: bool) -> i32 {
    match failure {
        _ if interrupted => EXIT_INTERRUPTED,
        Some(LoadError::Cancelled { .. }) => EXIT_INTERRUPTED,
        Some(_) => 1,
        None => 0,
    }
}

fn resolve_descriptor(cli: &Cli) -> anyhow::Result<ConnectionDescriptor> {
    let mut descriptor = match cli.database_url {
        Some(ref url) => ConnectionDescriptor::from_url(url)?,
        None => ConnectionDescriptor::new(&cli.host, cli.port, &cli.database, &cli.user),
    };
    if let Some(seconds) = cli.connect_timeout {
        descriptor.connect_timeout = Some(Duration::from_secs(seconds));
    }
    if let Some(seconds) = cli.lock_timeout {
        descriptor = descriptor.with_lock_timeout(Duration::from_secs(seconds));
    }

    if let Some(ref password) = cli.password {
        if !descriptor.has_password() {
            descriptor = descriptor.with_password(password.clone());
        }
    }

    if !descriptor.has_password() && std::io::stdin().is_terminal() {
        let password = Password::new()
            .with_prompt(format!("Password for {}", descriptor.redacted()))
            .allow_empty_password(true)
            .interact()?;
        if !password.is_empty() {
            descriptor = descriptor.with_password(password);
        }
    }

    Ok(descriptor)
}

fn print_plan(plan: &LoadPlan, data_dir: &Path) {
    let graph = plan.graph();

    println!("Load order ({} entities, {} levels):", plan.len(), graph.num_levels());
    for (level, names) in graph.levels.iter().enumerate() {
        println!("  Level {}:", level);
        for name in names {
            if let Some(entity) = plan.entity(name) {
                let deps = if entity.depends_on.is_empty() {
                    String::new()
                } else {
                    format!(" <- {}", entity.depends_on.join(", "))
                };
                println!("    {} -> {} [{}]{}", entity.name, entity.relation, entity.strategy, deps);
            }
        }
    }

    if !plan.checks().is_empty() {
        println!("Integrity checks:");
        for check in plan.checks() {
            println!("  {}", check.name);
        }
    }

    println!(
        "Sources are read from {}/<entity>.{}",
        data_dir.display(),
        plan.source.extension
    );
}
