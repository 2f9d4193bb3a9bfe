//! polyroute - adaptive multi-provider request router
//!
//! A routing service that decides, per inference request, which upstream
//! AI provider should serve it, continuously adapting to provider health,
//! latency, cost, and geography.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polyroute::Config;

#[derive(Parser)]
#[command(name = "polyroute")]
#[command(about = "Adaptive multi-provider request router")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the routing server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured providers and their declarations
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn init_tracing(level: &str) {
    let default_filter = format!("polyroute={},tower_http=info", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let mut loaded = Config::from_file(&config)?;
            init_tracing(&loaded.logging.level);
            tracing::info!(config = %config, "Loaded configuration");

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                loaded.server.listen = addr;
            }

            polyroute::server::run_server(loaded).await
        }

        Commands::Check { config } => {
            init_tracing("info");
            match Config::from_file(&config) {
                Ok(loaded) => {
                    println!(
                        "{}: OK ({} providers, {} routing rules)",
                        config,
                        loaded.providers.len(),
                        loaded.geo.rules.len()
                    );
                    Ok(())
                }
                Err(e) => {
                    eprintln!("{}: INVALID\n{}", config, e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Providers { config } => {
            init_tracing("warn");
            let loaded = Config::from_file(&config)?;
            if loaded.providers.is_empty() {
                println!("No providers configured");
                return Ok(());
            }
            for provider in &loaded.providers {
                let regions = if provider.regions.is_empty() {
                    "-".to_string()
                } else {
                    provider.regions.join(",")
                };
                println!(
                    "{:<20} {:<40} weight={:<5} cost/1k={:<8} regions={}",
                    provider.name,
                    provider.url,
                    provider.base_weight,
                    provider.cost_per_1k_tokens,
                    regions
                );
            }
            Ok(())
        }
    }
}
