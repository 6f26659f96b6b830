use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use devbox::db::Database;
use devbox::dispatch::Dispatcher;
use devbox::engine::CliEngine;
use devbox::vm::Orchestrator;

const APP_NAME: &str = "devbox";

#[derive(Debug, Parser)]
#[command(name = APP_NAME, about = "Chat-driven dev container manager", version)]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control plane with a local console as the chat transport.
    Serve,
}

#[derive(Debug, Deserialize)]
struct AppConfig {
    /// Directory for the sqlite database.
    data_dir: PathBuf,
    /// Base image for new containers.
    image: String,
    /// Engine binary; auto-detected when unset.
    engine_binary: Option<String>,
    /// Build the image from this context instead of pulling it.
    build_context: Option<PathBuf>,
    /// Chat user ID with admin rights.
    admin_id: i64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let default_path = default_data_dir().join("config.toml");
    let path = path.cloned().unwrap_or(default_path);

    let config = Config::builder()
        .set_default("data_dir", default_data_dir().display().to_string())?
        .set_default("image", "ubuntu:22.04")?
        .set_default("admin_id", 0)?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix("DEVBOX"))
        .build()
        .context("loading configuration")?;

    config
        .try_deserialize()
        .context("parsing configuration")
}

fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| anyhow::anyhow!("initializing logging: {e}"))?;
    Ok(())
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(std::io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let config = load_config(cli.config.as_ref())?;

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    match cli.command {
        Command::Serve => runtime.block_on(serve(config)),
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let db = Database::open(&config.data_dir.join("devbox.db")).await?;

    let engine = match &config.engine_binary {
        Some(binary) => CliEngine::with_binary(binary, config.build_context.clone()),
        None => CliEngine::detect(config.build_context.clone()),
    };

    let orchestrator = Orchestrator::new(&db, Arc::new(engine), config.image.clone());
    let dispatcher = Dispatcher::new(orchestrator, config.admin_id);

    info!(image = %config.image, admin_id = config.admin_id, "control plane ready");
    println!("devbox console: `<user_id> /command [args]`, Ctrl-D to exit");

    // Local console loop standing in for the chat transport: each line is
    // a caller ID followed by the command, as the chat front end would
    // deliver after authenticating the sender.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((caller, command)) = line.split_once(char::is_whitespace) else {
            println!("expected: <user_id> /command [args]");
            continue;
        };
        let Ok(caller) = caller.parse::<i64>() else {
            println!("expected a numeric user ID, got '{caller}'");
            continue;
        };

        let reply = dispatcher.handle(caller, command).await;
        println!("{reply}");
    }

    Ok(())
}
