//! CLI interface for voice-agent

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "voice-agent")]
#[command(about = "Real-time conversational voice agent server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default when no command given)
    Serve {
        /// Bind host
        #[arg(long)]
        host: Option<String>,
        /// Bind port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the effective configuration
    Config,
    /// Archive inactive usage session rows older than the configured window
    Sweep,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        None => serve(None, None).await,
        Some(Commands::Serve { host, port }) => serve(host, port).await,
        Some(Commands::Config) => {
            let config = Config::load()?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Sweep) => sweep().await,
    }
}

async fn serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    println!("{}", crate::info());
    println!(
        "listening on {}:{} (limits: {}m session / {}m daily / {}m monthly)",
        config.server.host,
        config.server.port,
        config.limits.session_minutes,
        config.limits.daily_minutes,
        config.limits.monthly_minutes,
    );

    crate::server::start(config).await
}

async fn sweep() -> Result<()> {
    use crate::usage::{SqliteUsageStore, UsageStore};

    let config = Config::load()?;
    let store = SqliteUsageStore::new(config.db_path()?).await?;
    let archived = store
        .archive_sessions_older_than(config.storage.archive_after_days)
        .await
        .map_err(anyhow::Error::from)?;
    println!(
        "archived {} session rows older than {} days",
        archived, config.storage.archive_after_days
    );
    Ok(())
}
