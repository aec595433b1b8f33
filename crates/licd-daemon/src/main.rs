//! licd - local license trust daemon.
//!
//! `licd serve` runs the daemon; `licd healthcheck` and `licd reload`
//! talk to a running instance over its Unix socket.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use licd_daemon::config::{
    Config, EnvOverrides, ServeArgs, DEFAULT_LICENSE_ROOTS_PEM, DEFAULT_LISTEN_PATH,
};
use licd_daemon::{client, daemon};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

/// licd - local license trust daemon
#[derive(Parser, Debug)]
#[command(name = "licd")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the daemon
    Serve(ServeArgs),

    /// Probe a running daemon's health endpoint
    Healthcheck {
        /// Path to the Unix socket for API requests
        #[arg(long, default_value = DEFAULT_LISTEN_PATH)]
        listen_path: PathBuf,

        /// URL path of the health-check endpoint
        #[arg(long, default_value = "/health-check")]
        path: String,
    },

    /// Trigger a license rescan on a running daemon
    Reload {
        /// Path to the Unix socket for API requests
        #[arg(long, default_value = DEFAULT_LISTEN_PATH)]
        listen_path: PathBuf,
    },
}

fn init_logging(level: &str, timestamps: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    if timestamps {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().without_time())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            init_logging(&args.log_level, !args.no_log_timestamp);
            let config = Config::build(&args, &EnvOverrides::capture(), DEFAULT_LICENSE_ROOTS_PEM)?;
            daemon::serve(config).await
        }
        Commands::Healthcheck { listen_path, path } => {
            client::healthcheck(&listen_path, &path).await?;
            println!("healthcheck successful");
            Ok(())
        }
        Commands::Reload { listen_path } => {
            client::reload(&listen_path).await?;
            println!("reload successful");
            Ok(())
        }
    }
}
