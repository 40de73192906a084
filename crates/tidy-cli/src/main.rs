use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tidy_core::{CleanupReport, Operation, EXIT_NO_REPORT};
use tidy_engine::{
    maybe_build_scheduler, run_exclusive, CancelFlag, CleanupConfig, Confirm, RunError,
    RunOptions, ScheduledCleanup, SchemaCatalog,
};
use tidy_storage::{FsReportArchive, PgMetadataStore, ReportSink};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tidy-cli", version)]
#[command(about = "Database cleanup & integrity repair")]
struct Cli {
    /// YAML schema catalog replacing the built-in one.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every cleanup phase once (the default).
    Cleanup(CleanupArgs),
    /// Serve the admin HTTP endpoints.
    Serve,
    /// Run cleanups on the configured cron schedule until interrupted.
    Schedule,
    /// Print the latest stored reports.
    Status {
        /// Read from the filesystem archive instead of the metadata table.
        #[arg(long)]
        archive: bool,
    },
}

#[derive(Debug, Default, Args)]
struct CleanupArgs {
    /// Analyse only; no statement mutates the database.
    #[arg(long)]
    dry_run: bool,
    /// Skip the confirmation prompt.
    #[arg(long)]
    yes: bool,
    /// Archive the report under TIDY_REPORTS_DIR.
    #[arg(long)]
    persist: bool,
}

struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, catalog: &SchemaCatalog) -> bool {
        eprintln!(
            "About to delete duplicates in {} tables, run {} repairs, \
             {} standardization rules and add up to {} constraints.",
            catalog.tables.len(),
            catalog.repairs.len(),
            catalog.standardization.len(),
            catalog.constraints.len()
        );
        eprint!("Proceed? [y/N] ");
        let _ = std::io::stderr().flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes" | "YES")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();

    let cli = Cli::parse();
    let mut config = CleanupConfig::from_env();
    if let Some(path) = cli.catalog {
        config.catalog_path = Some(path);
    }
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command.unwrap_or(Commands::Cleanup(CleanupArgs::default())) {
        Commands::Cleanup(args) => cleanup(&config, args).await,
        Commands::Serve => tidy_web::serve(&config).await,
        Commands::Schedule => schedule(&config).await,
        Commands::Status { archive } => status(&config, archive).await,
    }
}

fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current table");
            flag.cancel();
        }
    });
    cancel
}

async fn cleanup(config: &CleanupConfig, args: CleanupArgs) -> Result<()> {
    let catalog = config.load_catalog().context("loading schema catalog")?;
    let pool = config.connect().await?;
    let options = RunOptions {
        dry_run: args.dry_run,
        interactive: !args.yes && std::io::stdin().is_terminal(),
    };
    let cancel = cancel_on_ctrl_c();

    let outcome = run_exclusive(
        &pool,
        &catalog,
        options,
        &StdinConfirm,
        &cancel,
        config.advisory_lock_key,
    )
    .await;
    let report = match outcome {
        Ok(Some(report)) => report,
        Ok(None) => {
            eprintln!("another cleanup run is in progress; nothing was done");
            pool.close().await;
            std::process::exit(exit_code_for(&Ok(None)));
        }
        Err(err) => {
            error!(error = %err, "cleanup run failed");
            eprintln!("cleanup failed: {err}");
            let code = exit_code_for(&Err(err));
            pool.close().await;
            std::process::exit(code);
        }
    };

    println!("{}", report.summary_text());

    if args.persist && !report.skipped {
        let archive = FsReportArchive::new(&config.reports_dir);
        let stored = archive
            .persist(Operation::for_dry_run(report.dry_run), &report)
            .await?;
        info!(
            dir = %config.reports_dir.display(),
            recorded_at = %stored.recorded_at,
            "report archived"
        );
    }

    pool.close().await;
    std::process::exit(exit_code_for(&Ok(Some(report))));
}

/// Exit code for one invocation; `EXIT_NO_REPORT` whenever no report was produced.
fn exit_code_for(outcome: &Result<Option<CleanupReport>, RunError>) -> i32 {
    match outcome {
        Ok(Some(report)) => report.exit_code(),
        Ok(None) | Err(_) => EXIT_NO_REPORT,
    }
}

async fn schedule(config: &CleanupConfig) -> Result<()> {
    let catalog = config.load_catalog().context("loading schema catalog")?;
    let pool = config.connect().await?;
    let sink = PgMetadataStore::new(pool.clone());
    sink.ensure_table().await?;

    let cleanup = Arc::new(ScheduledCleanup {
        pool,
        catalog: Arc::new(catalog),
        sink: Arc::new(sink),
        dry_run: config.scheduled_dry_run,
        lock_key: config.advisory_lock_key,
        cancel: CancelFlag::new(),
    });
    let Some(mut sched) = maybe_build_scheduler(config, Arc::clone(&cleanup)).await? else {
        bail!("scheduler disabled; set TIDY_SCHEDULER_ENABLED=true");
    };
    sched.start().await.context("starting scheduler")?;
    info!(
        cron = %config.cleanup_cron,
        dry_run = config.scheduled_dry_run,
        "cleanup scheduler running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    cleanup.cancel.cancel();
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

async fn status(config: &CleanupConfig, archive: bool) -> Result<()> {
    let sink: Box<dyn ReportSink> = if archive {
        Box::new(FsReportArchive::new(&config.reports_dir))
    } else {
        let store = PgMetadataStore::new(config.connect().await?);
        store.ensure_table().await?;
        Box::new(store)
    };

    for operation in [Operation::Cleanup, Operation::DryRun] {
        match sink.latest(operation).await? {
            Some(stored) => {
                println!("{operation}: recorded {}", stored.recorded_at.to_rfc3339());
                println!("{}\n", stored.report.summary_text());
            }
            None => println!("{operation}: no report yet\n"),
        }
    }
    Ok(())
}
