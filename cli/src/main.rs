use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tidemark::app::{Application, Command, Request};
use tidemark::config::{LogFormat, TidemarkConfig};
use tidemark::protocol;
use tidemark::server::Server;

/// Tidemark table service
#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(about = "Transactional commits, checkpoints and rollback for snapshot tables", long_about = None)]
struct Cli {
    /// Path to config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Warehouse directory, overriding the config
    #[arg(long, global = true)]
    warehouse: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve requests over TCP until interrupted.
    Serve {
        /// Address to bind, overriding the config
        #[arg(long)]
        bind: Option<String>,
    },

    /// Send one command line to a running server.
    Send {
        #[arg(long, default_value = "127.0.0.1:1234")]
        address: String,

        /// The command, quoted as one argument
        command: String,
    },

    #[command(flatten)]
    Table(Command),
}

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ----------------------------
    // Load config
    // ----------------------------
    let mut config = TidemarkConfig::load(cli.config.as_deref())?;
    if let Some(warehouse) = cli.warehouse {
        config.warehouse = warehouse;
    }
    init_logging(config.log_format);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .max_blocking_threads(config.server.worker_threads())
                .build()?;
            runtime.block_on(async {
                let server = Server::bind(Application::new(config)).await?;
                server.run(shutdown_signal()).await
            })?;
        }
        Commands::Send { address, command } => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let response = runtime.block_on(protocol::send(&address, &command))?;
            if response.is_error {
                bail!("{}", response.payload);
            }
            println!("{}", response.payload);
        }
        Commands::Table(command) => {
            let app = Application::new(config);
            let output = app.execute(&Request {
                warehouse: None,
                command,
            })?;
            println!("{output}");
        }
    }

    Ok(())
}
