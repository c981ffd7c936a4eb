use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use homebills_lib::config::AppConfig;
use homebills_lib::{logging, migrate, open_sqlite_pool, AppError, AppState};

const EXIT_FAILURE: i32 = 1;
const EXIT_NOT_FOUND: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "homebills", about = "Household bills pivotals", version)]
struct Cli {
    /// SQLite database file. Falls back to HOMEBILLS_DB_PATH, then the
    /// platform data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending schema migrations.
    Migrate,
    /// Compute or read pivotals.
    #[command(subcommand)]
    Pivotal(PivotalCommand),
}

#[derive(Debug, Subcommand)]
enum PivotalCommand {
    /// Rebuild a house's pivotal and the pivotals of its groups.
    Calculate { house_id: String },
    /// Read a house pivotal, refreshing it from new records.
    House { house_id: String },
    /// Read a group pivotal, refreshing it from new records.
    Group { group_id: String },
}

#[tokio::main]
async fn main() {
    let guard = logging::init();
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            let app_error = AppError::from(err);
            match serde_json::to_string(&app_error) {
                Ok(body) => eprintln!("{body}"),
                Err(_) => eprintln!("Error: {app_error}"),
            }
            if app_error.is_not_found() {
                EXIT_NOT_FOUND
            } else {
                EXIT_FAILURE
            }
        }
    };

    drop(guard);
    process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = Some(db);
    }
    let db_path = config
        .resolve_db_path()
        .context("determine database path")?;

    let pool = open_sqlite_pool(&db_path).await?;
    migrate::apply_migrations(&pool).await?;

    let outcome = match cli.command {
        Commands::Migrate => print_json(&json!({
            "status": "ok",
            "db": db_path.display().to_string(),
            "versions": migrate::known_versions().collect::<Vec<_>>(),
        })),
        Commands::Pivotal(command) => {
            let state = AppState::new(pool.clone(), config);
            run_pivotal(&state, command).await
        }
    };

    pool.close().await;
    outcome
}

async fn run_pivotal(state: &AppState, command: PivotalCommand) -> Result<()> {
    match command {
        PivotalCommand::Calculate { house_id } => {
            let response = state.calculator.calculate(&house_id).await?;
            print_json(&response)
        }
        PivotalCommand::House { house_id } => {
            let pivotal = state.pivotals.find_by_house_id(&house_id).await?;
            print_json(&pivotal)
        }
        PivotalCommand::Group { group_id } => {
            let pivotal = state.pivotals.find_by_group_id(&group_id).await?;
            print_json(&pivotal)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{body}");
    Ok(())
}
