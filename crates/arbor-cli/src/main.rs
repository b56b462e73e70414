mod api;
mod config;
mod events_cmd;
mod queue_cmd;
mod run_cmd;
mod serve_cmd;
mod status_cmd;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

use arbor_core::adapter::{AdapterRegistry, EchoAdapter};
use arbor_core::engine::Engine;
use arbor_core::safety::SafetyLimits;
use arbor_db::pool;

use config::ArborConfig;

#[derive(Parser)]
#[command(name = "arbor", about = "Durable DAG orchestration engine for AI-agent pipelines")]
struct Cli {
    /// Database URL (overrides ARBOR_DATABASE_URL and the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database (and a config file) and apply migrations
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the HTTP control plane
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Execute a DAG from a file (or a bundled example) to completion
    Run {
        /// Path to a DAG definition (JSON)
        dag_file: Option<PathBuf>,
        /// Bundled example name instead of a file
        #[arg(long)]
        example: Option<String>,
        /// Context entries as key=value pairs
        #[arg(long = "set", value_name = "KEY=VALUE")]
        context: Vec<String>,
        /// Dispatch through the dev echo adapter
        #[arg(long)]
        dev: bool,
    },
    /// Show run status (omit run_id to list recent runs)
    Status {
        run_id: Option<String>,
    },
    /// Print a run's event log
    Events {
        run_id: String,
        /// Only events with sequence greater than this
        #[arg(long, default_value_t = 0)]
        since: i64,
    },
    /// Show the admission queue
    Queue,
    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

async fn open_engine(cli_db_url: Option<&str>) -> Result<Engine> {
    let config = ArborConfig::load()?;
    let db_config = config.db_config(cli_db_url);
    let db_pool = pool::create_pool(&db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let mut adapters = AdapterRegistry::new();
    adapters.register(std::sync::Arc::new(EchoAdapter));

    Ok(Engine::new(
        db_pool,
        SafetyLimits::from_env(),
        adapters,
        None,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let mut config = ArborConfig::load().unwrap_or_default();
            let config_path = ArborConfig::default_path();
            if !config_path.exists() || force {
                if config.database_url.is_none() {
                    config.database_url = Some(arbor_db::DbConfig::default_url());
                }
                let written = config.save()?;
                println!("wrote config to {}", written.display());
            }

            let db_config = config.db_config(cli.database_url.as_deref());
            let db_pool = pool::create_pool(&db_config)
                .await
                .context("failed to open database")?;
            pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

            println!("database ready at {}", db_config.database_url);
            for (table, count) in pool::table_counts(&db_pool).await? {
                println!("  {table}: {count} rows");
            }
            Ok(())
        }
        Commands::Serve { bind, port } => {
            let config = ArborConfig::load()?;
            let bind = bind
                .or(config.bind.clone())
                .unwrap_or_else(|| "127.0.0.1".to_owned());
            let port = port.or(config.port).unwrap_or(7410);
            let engine = open_engine(cli.database_url.as_deref()).await?;
            serve_cmd::run_serve(engine, &bind, port).await
        }
        Commands::Run {
            dag_file,
            example,
            context,
            dev,
        } => {
            let engine = open_engine(cli.database_url.as_deref()).await?;
            run_cmd::run_dag(&engine, dag_file.as_deref(), example.as_deref(), &context, dev)
                .await
        }
        Commands::Status { run_id } => {
            let engine = open_engine(cli.database_url.as_deref()).await?;
            status_cmd::show_status(&engine, run_id.as_deref()).await
        }
        Commands::Events { run_id, since } => {
            let engine = open_engine(cli.database_url.as_deref()).await?;
            events_cmd::show_events(&engine, &run_id, since).await
        }
        Commands::Queue => {
            let engine = open_engine(cli.database_url.as_deref()).await?;
            queue_cmd::show_queue(&engine).await
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}
