use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use apex_redact_proxy::config::{save_config, Config};
use apex_redact_proxy::server::run_server;

#[derive(Parser)]
#[command(name = "apex-redact-proxy", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy.
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        bind: Option<String>,
    },
    /// Write a default config file to `path`.
    InitConfig { path: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::InitConfig { path } => {
            let config = Config::default();
            save_config(&path, &config).context("failed to write config")?;
            println!("wrote default config to {}", path.display());
            Ok(())
        }
        Commands::Serve { config, port, bind } => {
            let mut loaded = match &config {
                Some(path) => apex_redact_proxy::config::load_config(path)?,
                None => Config::default(),
            };
            if let Some(port) = port {
                loaded.port = port;
            }
            if let Some(bind) = bind {
                loaded.bind_host = bind;
            }

            let _guard = init_logging(&loaded);
            run_server(loaded).await
        }
    }
}

fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("apex_redact_proxy={},tower_http=info", config.logging.level).into());

    match &config.logging.dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "proxy.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}
