use std::path::PathBuf;

use clap::Parser;
use retention_cascade::{
    config::{AppConfig, PlanDefinition},
    db::DbPool,
    observability::{self, metrics},
    retention::{self, RunOptions},
};
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_FILE: &str = "retention.toml";

/// CLI arguments for the retention job
#[derive(Parser, Debug)]
#[command(version, about = "Retention cascade job", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./retention.toml if it exists,
    /// otherwise built-in defaults are used)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the plan once over the whole population and exit (default)
    Run {
        /// Process only the entity with this identifier
        #[arg(long)]
        entity: Option<String>,
        /// Plan and report without writing, overriding the config file
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the plan every `retention.interval_hours` until interrupted
    Schedule,
    /// Run database migrations and create missing plan collections, then exit
    ///
    /// Useful for init containers or CI/CD pipelines.
    Migrate,
    /// Verify the datastore is reachable and every plan collection exists
    Check,
    /// Export the JSON schema for the configuration file
    Schema {
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args.config.as_deref();

    match args.command {
        Some(Command::Schema { output }) => {
            #[cfg(feature = "json-schema")]
            run_schema_export(output);
            #[cfg(not(feature = "json-schema"))]
            {
                let _ = output;
                eprintln!("Error: JSON schema export requires the 'json-schema' feature");
                std::process::exit(1);
            }
        }
        Some(Command::Schedule) => run_schedule(config_path).await,
        Some(Command::Migrate) => run_migrate(config_path).await,
        Some(Command::Check) => run_check(config_path).await,
        Some(Command::Run { entity, dry_run }) => run(config_path, entity, dry_run).await,
        None => run(config_path, None, false).await,
    }
}

/// Resolve the config file path.
///
/// An explicit path must exist. Without one, `./retention.toml` is used when
/// present; otherwise `None` selects the built-in defaults.
fn resolve_config_path(explicit: Option<&str>) -> Result<Option<PathBuf>, String> {
    match explicit {
        Some(path) => {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(format!("Config file not found: {}", path.display()));
            }
            Ok(Some(path))
        }
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            Ok(default.exists().then_some(default))
        }
    }
}

/// Load config and initialize logging and metrics. Exits with code 1 on error.
fn load_config(explicit_config_path: Option<&str>) -> AppConfig {
    let config_path = match resolve_config_path(explicit_config_path) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let config = match &config_path {
        Some(path) => match AppConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => AppConfig::default(),
    };

    if let Err(e) = observability::init_tracing(&config.observability.logging) {
        eprintln!("Failed to initialize tracing: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = metrics::init_metrics(&config.observability.metrics) {
        tracing::error!(error = %e, "Failed to initialize metrics");
        std::process::exit(1);
    }

    match &config_path {
        Some(path) => tracing::info!(config_file = %path.display(), "Loaded configuration"),
        None => tracing::warn!(
            "No config file found at ./{}, using built-in defaults",
            DEFAULT_CONFIG_FILE
        ),
    }

    config
}

/// Connect to the configured datastore. Exits with code 1 on error.
async fn connect(config: &AppConfig) -> DbPool {
    match DbPool::from_config(&config.database).await {
        Ok(pool) => {
            tracing::info!(backend = pool.backend_name(), "Datastore connected");
            pool
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to datastore");
            std::process::exit(1);
        }
    }
}

fn plan_definition(config: &AppConfig) -> PlanDefinition {
    match config.plan_definition() {
        Ok(plan) => plan,
        Err(e) => {
            tracing::error!(error = %e, "Invalid cascade plan");
            std::process::exit(1);
        }
    }
}

/// Run the plan once.
///
/// Exits with code 0 when the run completes (entity-level failures included),
/// 1 when it aborts.
async fn run(explicit_config_path: Option<&str>, entity: Option<String>, dry_run: bool) {
    let mut config = load_config(explicit_config_path);
    if dry_run {
        config.retention.safety.dry_run = true;
    }
    let plan = plan_definition(&config);
    let pool = connect(&config).await;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let options = RunOptions {
        entity,
        cancel,
        ..Default::default()
    };
    match retention::run_and_log(pool.documents(), &config.retention, &plan, options).await {
        Ok(_) => std::process::exit(0),
        Err(_) => std::process::exit(1),
    }
}

/// Run the plan on a fixed interval until SIGINT/SIGTERM.
async fn run_schedule(explicit_config_path: Option<&str>) {
    let config = load_config(explicit_config_path);
    let plan = plan_definition(&config);
    let pool = connect(&config).await;

    let cancel = CancellationToken::new();
    let mut worker = tokio::spawn(retention::start_retention_worker(
        pool.documents(),
        config.retention.clone(),
        plan,
        cancel.clone(),
    ));

    // A disabled worker returns immediately.
    tokio::select! {
        result = &mut worker => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Retention worker task failed");
                std::process::exit(1);
            }
            return;
        }
        _ = shutdown_signal(cancel) => {}
    }
    if let Err(e) = worker.await {
        tracing::error!(error = %e, "Retention worker task failed");
        std::process::exit(1);
    }
}

/// Run migrations and create any plan collections that do not exist yet.
///
/// Exits with code 0 on success, 1 on failure.
async fn run_migrate(explicit_config_path: Option<&str>) {
    let config = load_config(explicit_config_path);
    let plan = plan_definition(&config);

    if config.database.is_memory() {
        eprintln!("Error: Database is not configured. Nothing to migrate.");
        std::process::exit(1);
    }

    let pool = connect(&config).await;
    if let Err(e) = pool.run_migrations().await {
        tracing::error!(error = %e, "Database migration failed");
        std::process::exit(1);
    }

    match retention::create_plan_collections(pool.documents().as_ref(), &plan).await {
        Ok(created) => {
            for name in &created {
                tracing::info!(collection = %name, "Created collection");
            }
            tracing::info!(created = created.len(), "Database migrations completed successfully");
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to create plan collections");
            std::process::exit(1);
        }
    }
}

/// Verify connectivity and that every plan collection resolves.
///
/// Exits with code 0 when the plan can run, 1 otherwise.
async fn run_check(explicit_config_path: Option<&str>) {
    let config = load_config(explicit_config_path);
    let plan = plan_definition(&config);
    let pool = connect(&config).await;

    if let Err(e) = pool.health_check().await {
        tracing::error!(error = %e, "Datastore health check failed");
        std::process::exit(1);
    }

    let store = pool.documents();
    match retention::verify_collections(store.as_ref(), &plan).await {
        Ok(resolved) => {
            for (reference, physical) in &resolved {
                println!("{reference} -> {physical}");
            }
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!(error = %e, "Plan collections are not ready");
            std::process::exit(1);
        }
    }
}

/// Export JSON schema for the configuration file to file or stdout
#[cfg(feature = "json-schema")]
fn run_schema_export(output: Option<String>) {
    let schema = AppConfig::json_schema();
    let content = match serde_json::to_string_pretty(&schema) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Failed to serialize config schema: {}", e);
            std::process::exit(1);
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &content) {
                eprintln!("Failed to write to {}: {}", path, e);
                std::process::exit(1);
            }
            eprintln!("Config JSON schema written to {}", path);
        }
        None => {
            println!("{}", content);
        }
    }
}

/// Wait for SIGINT/SIGTERM, then cancel `cancel`.
///
/// A run in progress stops before its next entity; the entity being
/// processed finishes its transaction first.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel.cancelled() => return,
    }

    tracing::info!("Shutdown signal received, stopping after the current entity");
    cancel.cancel();
}
