use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use virtpool::config;
use virtpool::transport::LibvirtTransport;
use virtpool::Core;

mod cli;

#[derive(Parser)]
#[command(name = "virtpool")]
#[command(version, about = "Pooled, self-healing connections to virtualization hosts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe whether hosts accept connections on the management port
    Check {
        /// Hosts to probe (host or host:port)
        #[arg(required = true)]
        hosts: Vec<String>,
    },

    /// Open a pooled connection to a host
    Connect {
        /// Host to connect to
        host: String,

        /// Connection kind
        #[arg(long, default_value = "tcp")]
        kind: String,

        /// Seconds to hold the connection open (0 = return immediately)
        #[arg(long, default_value = "0")]
        hold: u64,
    },

    /// Keep connections to hosts alive, reconnecting as they fail
    Watch {
        /// Hosts to watch
        #[arg(required = true)]
        hosts: Vec<String>,

        /// Seconds between rounds
        #[arg(long, default_value = "5")]
        interval: u64,

        /// Number of rounds (0 = until interrupted)
        #[arg(long, default_value = "0")]
        count: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Connection setup blocks, so it runs on the blocking pool
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;
    let core: Core<LibvirtTransport> = Core::new(config)?;

    let result = match cli.command {
        Commands::Check { hosts } => cli::commands::cmd_check(&core, &hosts).await,
        Commands::Connect { host, kind, hold } => {
            cli::commands::cmd_connect(&core, &host, &kind, hold).await
        }
        Commands::Watch {
            hosts,
            interval,
            count,
        } => cli::commands::cmd_watch(&core, &hosts, interval, count).await,
    };

    core.shutdown();
    result
}
