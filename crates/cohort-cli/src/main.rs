use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cohort_pipeline::{JoinBuilder, Mode, ReconcilePipeline, RunOptions};
use cohort_store::PgTableStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cohort-cli")]
#[command(about = "Classify spreadsheet paths and reconcile course tables")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Update new_course rows in place from classified paths
    Update(ReconcileArgs),
    /// Copy matched course_old rows and their children into the _taas clones
    Copy(ReconcileArgs),
    /// Build *_join tables by merging base tables with their _taas overrides
    BuildJoins {
        /// Do not drop existing *_join tables before inserting
        #[arg(long)]
        no_recreate: bool,
    },
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    /// Input file with one path per line
    #[arg(long, default_value = "b2b_paths.cleaned.csv")]
    input: PathBuf,

    /// Do not write to the database, only log actions
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
    let store = PgTableStore::connect(&database_url)
        .await
        .context("connecting to database")?;

    match cli.command {
        Commands::Update(args) => run_reconcile(&store, Mode::Update, args).await?,
        Commands::Copy(args) => run_reconcile(&store, Mode::Copy, args).await?,
        Commands::BuildJoins { no_recreate } => {
            let mut builder = JoinBuilder::new(&store);
            if no_recreate {
                builder = builder.no_recreate();
            }
            let summary = builder.run().await?;
            for table in &summary.tables {
                info!(
                    dest = %table.dest,
                    from_base = table.inserted_from_base,
                    from_override = table.inserted_from_override,
                    "join table built"
                );
            }
        }
    }

    Ok(())
}

async fn run_reconcile(store: &PgTableStore, mode: Mode, args: ReconcileArgs) -> Result<()> {
    let pipeline = ReconcilePipeline::new(store);
    let summary = pipeline
        .run(
            mode,
            &RunOptions {
                input: args.input,
                dry_run: args.dry_run,
            },
        )
        .await?;

    info!(
        run_id = %summary.run_id,
        mode = summary.mode.as_str(),
        dry_run = summary.dry_run,
        paths_processed = summary.paths_processed,
        unparsable = summary.unparsable_skipped,
        unmatched = summary.unmatched_paths,
        rows_matched = summary.rows_matched,
        rows_updated = summary.rows_updated,
        skipped_no_type = summary.skipped_no_type,
        courses_copied = summary.courses_copied,
        classes_copied = summary.classes_copied,
        students_copied = summary.students_copied,
        "done"
    );
    Ok(())
}
