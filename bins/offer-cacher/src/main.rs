//! offer-cacher: durable consumer JetStream → файл на offer → `GET /get-offers`.
//!
//! Код выхода 1 означает, что `serve` или `publish` завершились ошибкой,
//! в том числе когда consumer или HTTP остановились без сигнала.

mod cmd;
mod config;
mod error;

use clap::Parser;
use config::{Cli, Commands};

/// Фильтр логов, если `RUST_LOG` не задан. Доставки пишутся на debug.
const DEFAULT_LOG_FILTER: &str = "info,offer_consumer=info,storage_file=info";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let cli = Cli::parse();
    let (command, result) = match cli.command {
        Commands::Serve(args) => ("serve", cmd::serve::run(args).await),
        Commands::Publish(args) => ("publish", cmd::publish::run(args).await),
    };
    if let Err(e) = result {
        tracing::error!(command, error = %e, "offer-cacher failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
