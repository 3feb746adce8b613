mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tabbridge")]
#[command(about = "Bridge browser tools to MCP callers over WebSocket", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (JSON)
    #[arg(short, long, global = true, default_value = "tabbridge.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge server (long-running daemon)
    Bridge {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// List the registered browser tool pack
    Tools,

    /// Show configuration status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Bridge { port, host } => {
            commands::bridge::run(&cli.config, host, port).await?;
        }
        Commands::Tools => {
            commands::tools_cmd::run()?;
        }
        Commands::Status => {
            commands::status::run(&cli.config)?;
        }
    }

    Ok(())
}
