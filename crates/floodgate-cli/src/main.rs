//! Floodgate command-line interface.
//!
//! Exit codes: 0 full success, 1 hard failure (halted), 2 success with
//! soft warnings.

mod shell;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use floodgate_core::{
    prune_backups, ArtifactKind, MigrationRegistry, Pipeline, PipelineConfig, ResourceThreshold,
    RetryPolicy,
};
use shell::{ShellCloudProvisioner, ShellContainerRuntime, ShellDatabaseClient};

/// Floodgate migration pipeline
#[derive(Parser, Debug)]
#[command(name = "floodgate")]
#[command(version, about = "Forward-only schema migration pipeline")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full migration pipeline against a target environment
    Run(RunArgs),
    /// Show the migration registry
    Status {
        /// Registry database path
        #[arg(long, default_value = "./floodgate_registry")]
        registry_path: PathBuf,
    },
    /// Prune backup run directories older than the retention age
    Prune {
        /// Backup directory
        #[arg(long, default_value = "./backups")]
        backup_dir: PathBuf,

        /// Maximum age in days
        #[arg(long, default_value_t = 14)]
        max_age_days: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackupKindArg {
    FullDump,
    SchemaOnly,
    DataOnly,
    VolumeSnapshot,
}

impl From<BackupKindArg> for ArtifactKind {
    fn from(kind: BackupKindArg) -> Self {
        match kind {
            BackupKindArg::FullDump => ArtifactKind::FullDump,
            BackupKindArg::SchemaOnly => ArtifactKind::SchemaOnly,
            BackupKindArg::DataOnly => ArtifactKind::DataOnly,
            BackupKindArg::VolumeSnapshot => ArtifactKind::VolumeSnapshot,
        }
    }
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Target environment name (informational; appears in reports)
    #[arg(long)]
    environment: String,

    /// Directory containing migration source files
    #[arg(long, default_value = "./migrations")]
    migrations_dir: PathBuf,

    /// Explicit migration order file (defaults to <migrations-dir>/order.txt)
    #[arg(long)]
    order_file: Option<PathBuf>,

    /// Registry database path
    #[arg(long, default_value = "./floodgate_registry")]
    registry_path: PathBuf,

    /// Backup directory
    #[arg(long, default_value = "./backups")]
    backup_dir: PathBuf,

    /// Artifact kinds to produce before EXECUTE
    #[arg(long = "backup-kind", value_enum, default_value = "full-dump")]
    backup_kinds: Vec<BackupKindArg>,

    /// Backup retention in days
    #[arg(long, default_value_t = 14)]
    backup_retention_days: u64,

    /// Database connection URL
    #[arg(long, default_value = "postgres://localhost:5432/postgres")]
    database_url: String,

    /// psql binary
    #[arg(long, default_value = "psql")]
    psql_bin: String,

    /// pg_dump binary
    #[arg(long, default_value = "pg_dump")]
    pg_dump_bin: String,

    /// docker binary
    #[arg(long, default_value = "docker")]
    docker_bin: String,

    /// Container service that must be running and healthy
    #[arg(long, default_value = "database")]
    database_service: String,

    /// Volume snapshotted for volume-snapshot backups
    #[arg(long, default_value = "db-data")]
    database_volume: String,

    /// Filesystem path whose headroom is checked
    #[arg(long, default_value = "/")]
    database_data_dir: PathBuf,

    /// Database capability that must be present (e.g. timescaledb)
    #[arg(long)]
    required_capability: Option<String>,

    /// Schema object expected to exist after EXECUTE (repeatable)
    #[arg(long = "expected-object")]
    expected_objects: Vec<String>,

    /// Query returning the count of orphaned references
    #[arg(long)]
    integrity_query: Option<String>,

    /// Provisioner availability probe command, e.g. "az postgres show ..."
    #[arg(long)]
    provisioner_check: Option<String>,

    /// Minimum free disk in MB (hard)
    #[arg(long, default_value_t = 1024)]
    min_disk_mb: u64,

    /// Minimum free memory in MB (soft)
    #[arg(long, default_value_t = 512)]
    min_memory_mb: u64,

    /// Soft latency ceiling in ms for the post-validation probe
    #[arg(long, default_value_t = 250)]
    latency_threshold_ms: u64,

    /// Per-attempt connectivity timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Maximum connectivity attempts
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Attempt remaining migrations after a failure (default: fail fast)
    #[arg(long)]
    continue_on_error: bool,

    /// Write the run report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("floodgate_core=info".parse().unwrap())
                .add_directive("floodgate=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let code = match args.command {
        Command::Run(run_args) => run_pipeline(run_args).await,
        Command::Status { registry_path } => status(&registry_path),
        Command::Prune {
            backup_dir,
            max_age_days,
        } => prune(&backup_dir, max_age_days),
    };
    std::process::exit(code);
}

async fn run_pipeline(args: RunArgs) -> i32 {
    let order_file = args
        .order_file
        .clone()
        .unwrap_or_else(|| args.migrations_dir.join("order.txt"));

    let mut config = PipelineConfig::new(
        &args.environment,
        &args.migrations_dir,
        order_file,
        &args.backup_dir,
    )
    .with_backup_kinds(args.backup_kinds.iter().map(|k| (*k).into()).collect())
    .with_backup_retention(Duration::from_secs(args.backup_retention_days * 86_400))
    .with_database_service(&args.database_service)
    .with_database_volume(&args.database_volume)
    .with_disk_threshold(ResourceThreshold::hard(args.min_disk_mb * 1024 * 1024))
    .with_memory_threshold(ResourceThreshold::soft(args.min_memory_mb * 1024 * 1024))
    .with_latency_soft_threshold(Duration::from_millis(args.latency_threshold_ms))
    .with_connect_timeout(Duration::from_secs(args.connect_timeout_secs))
    .with_retry(RetryPolicy {
        max_attempts: args.max_retries,
        ..RetryPolicy::default()
    })
    .with_continue_on_error(args.continue_on_error);

    if let Some(capability) = &args.required_capability {
        config = config.with_required_capability(capability);
    }
    if !args.expected_objects.is_empty() {
        config = config.with_expected_objects(args.expected_objects.clone());
    }

    let sled_db = match sled::open(&args.registry_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("cannot open registry at {}: {e}", args.registry_path.display());
            return 1;
        }
    };
    let registry = match MigrationRegistry::open(&sled_db) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("cannot open registry ledger: {e}");
            return 1;
        }
    };

    let mut database = ShellDatabaseClient::new(&args.database_url)
        .with_psql_bin(&args.psql_bin)
        .with_pg_dump_bin(&args.pg_dump_bin)
        .with_data_dir(&args.database_data_dir);
    if let Some(query) = &args.integrity_query {
        database = database.with_integrity_query(query);
    }

    let provisioner_argv = args
        .provisioner_check
        .as_deref()
        .map(|command| command.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let pipeline = Pipeline::new(
        config,
        registry,
        Arc::new(database),
        Arc::new(ShellContainerRuntime::new(&args.docker_bin)),
        Arc::new(ShellCloudProvisioner::new(provisioner_argv)),
    );

    // Ctrl-C cancels between stages and between migrations; an in-flight
    // transaction still commits or rolls back atomically.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let run = pipeline.run(&cancel).await;

    for warning in &run.soft_warnings {
        eprintln!("warning: {warning}");
    }
    if let Some(advisory) = &run.advisory {
        eprintln!("{advisory}");
    }
    if let Some(path) = &args.report {
        match run.to_json() {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    eprintln!("cannot write report to {}: {e}", path.display());
                }
            }
            Err(e) => eprintln!("cannot serialize report: {e}"),
        }
    }
    run.exit_code()
}

fn status(registry_path: &Path) -> i32 {
    let sled_db = match sled::open(registry_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("cannot open registry at {}: {e}", registry_path.display());
            return 1;
        }
    };
    let records = match MigrationRegistry::open(&sled_db).and_then(|r| r.list()) {
        Ok(records) => records,
        Err(e) => {
            eprintln!("cannot read registry: {e}");
            return 1;
        }
    };
    if records.is_empty() {
        println!("registry is empty");
        return 0;
    }
    println!(
        "{:<32} {:<10} {:>10} {:>18}  {}",
        "NAME", "STATUS", "MS", "APPLIED_AT", "ERROR"
    );
    for record in records {
        println!(
            "{:<32} {:<10} {:>10} {:>18}  {}",
            record.name,
            record.status.to_string(),
            record.duration_ms,
            record.applied_at,
            record.error_message.unwrap_or_default()
        );
    }
    0
}

fn prune(backup_dir: &Path, max_age_days: u64) -> i32 {
    match prune_backups(backup_dir, Duration::from_secs(max_age_days * 86_400)) {
        Ok(pruned) => {
            println!("pruned {} backup run(s)", pruned.len());
            0
        }
        Err(e) => {
            eprintln!("prune failed: {e}");
            1
        }
    }
}
