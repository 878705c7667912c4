//! `panelctl`: inspect background tasks and panel configuration.
//!
//! Usage:
//!   panelctl -c /etc/panel/panel.toml --user 1 tasks
//!   panelctl -c /etc/panel/panel.toml logs 12 --since 2026-01-01T00:00:00Z
//!
//! Reads the same TOML configuration and SQLite database as the panel
//! services.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use panel_core::{Caller, ServiceConfig};
use panel_task::TaskService;

/// Panel background task tool.
#[derive(Parser, Debug)]
#[command(name = "panelctl", about = "Panel background task tool")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long = "data-dir", global = true)]
    data_dir: Option<PathBuf>,

    /// Override the SQLite database path.
    #[arg(long = "sqlite", global = true)]
    sqlite: Option<PathBuf>,

    /// Panel user id the queries run as.
    #[arg(long = "user", global = true, default_value_t = 1)]
    user: i64,

    /// Output format: table or json.
    #[arg(long = "output", short = 'o', global = true, default_value = "table")]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List tasks visible to the user.
    Tasks {
        /// Only tasks started by this schedule.
        #[arg(long)]
        schedule: Option<i64>,
        /// Only tasks of this group.
        #[arg(long)]
        group: Option<uuid::Uuid>,
        /// Only tasks in this status (run, abort, stopping).
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one task with its parameters.
    Task {
        /// Task key.
        task_id: String,
    },

    /// Show the log of a task.
    Logs {
        /// Numeric task id.
        id: i64,
        /// Only lines at or after this RFC 3339 timestamp.
        #[arg(long)]
        since: Option<String>,
    },

    /// Delete the stack record of a task.
    Retire {
        /// Numeric task id.
        id: i64,
    },

    /// List ignorable file names, or test one name.
    Ignored {
        /// Name to test.
        name: Option<String>,
    },

    /// Show version.
    Version,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_output = cli.output == "json";

    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    let mut overrides = Vec::new();
    if let Some(dir) = &cli.data_dir {
        overrides.push(format!("--data-dir={}", dir.display()));
    }
    if let Some(path) = &cli.sqlite {
        overrides.push(format!("--sqlite={}", path.display()));
    }
    config.apply_args(&overrides);

    let caller = Caller::new(cli.user);

    match cli.command {
        Commands::Tasks {
            schedule,
            group,
            status,
        } => {
            let filter = commands::tasks::TaskFilter {
                schedule,
                group,
                status: status
                    .as_deref()
                    .map(commands::tasks::parse_status)
                    .transpose()?,
            };
            let service = open_service(&config)?;
            commands::tasks::list(&service, &caller, &filter, json_output)?;
        }

        Commands::Task { task_id } => {
            let service = open_service(&config)?;
            commands::tasks::show(&service, &caller, &task_id, json_output)?;
        }

        Commands::Logs { id, since } => {
            let service = open_service(&config)?;
            commands::tasks::logs(&service, id, since.as_deref(), json_output)?;
        }

        Commands::Retire { id } => {
            let service = open_service(&config)?;
            service.delete_task_stack(id)?;
            println!("Task #{id} stack record removed.");
        }

        Commands::Ignored { name } => {
            commands::ignored::run(&config, name.as_deref(), json_output)?;
        }

        Commands::Version => {
            println!("panelctl v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn open_service(config: &ServiceConfig) -> anyhow::Result<TaskService> {
    let path = config.resolve_sqlite_path();
    info!("Opening task database {}", path.display());
    let db: Arc<dyn panel_sql::SQLStore> = Arc::new(
        panel_sql::SqliteStore::open(&path)
            .map_err(|e| anyhow::anyhow!("failed to open SQL store: {}", e))?,
    );
    Ok(TaskService::sqlite(db)?)
}
