//! gemrelay - OpenAI-compatible gateway for Gemini
//!
//! Serves `/v1/chat/completions` backed by a rotating pool of Gemini keys,
//! with optional healing of interrupted streams.

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gemrelay::config::{Config, KeySource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "gemrelay.toml";

#[derive(Parser)]
#[command(name = "gemrelay")]
#[command(about = "OpenAI-compatible gateway for Gemini with key rotation and self-healing streams")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },

    /// Show configured upstream keys (suffixes only) and where they came from
    Keys {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
}

/// Load the config file, or fall back to the environment when the default
/// file is absent.
fn load_config(path: &str) -> anyhow::Result<(Config, Vec<(String, KeySource)>)> {
    if path == DEFAULT_CONFIG && !Path::new(path).exists() {
        return Config::from_env().context("Failed to build configuration from environment");
    }
    Config::from_file_with_env(path).with_context(|| format!("Failed to load config '{}'", path))
}

fn init_tracing(level: &str) {
    let fallback = format!("gemrelay={},tower_http=info", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut cfg, key_sources) = load_config(&config)?;
            init_tracing(&cfg.logging.level);

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            tracing::info!(
                config = %config,
                keys = cfg.upstream.api_keys.len(),
                auth = cfg.auth.secret.is_some(),
                max_attempts = cfg.upstream.max_attempts,
                self_healing = cfg.healing.enabled,
                max_retries = cfg.healing.effective_retries(),
                chat_rate_limit = %cfg.server.chat_rate_limit,
                check_keys_rate_limit = %cfg.server.check_keys_rate_limit,
                "Configuration loaded"
            );
            for (suffix, source) in &key_sources {
                tracing::debug!(key = %suffix, source = %source, "Upstream key");
            }
            if cfg.auth.secret.is_none() {
                tracing::warn!("No operator secret configured - chat and check-keys are open");
            }

            gemrelay::proxy::run_server(cfg).await
        }

        Commands::Check { config } => {
            let (cfg, _) = load_config(&config)?;
            init_tracing(&cfg.logging.level);

            println!("Configuration OK");
            println!("  listen:        {}", cfg.server.listen);
            println!("  upstream:      {}", cfg.upstream.base_url);
            println!("  keys:          {}", cfg.upstream.api_keys.len());
            println!("  max_attempts:  {}", cfg.upstream.max_attempts);
            println!(
                "  self_healing:  {} (max_retries {})",
                cfg.healing.enabled,
                cfg.healing.effective_retries()
            );
            println!("  chat limit:    {}", cfg.server.chat_rate_limit);
            println!("  check limit:   {}", cfg.server.check_keys_rate_limit);
            println!(
                "  auth:          {}",
                if cfg.auth.secret.is_some() { "enabled" } else { "disabled" }
            );
            Ok(())
        }

        Commands::Keys { config } => {
            let (cfg, key_sources) = load_config(&config)?;
            init_tracing(&cfg.logging.level);

            if key_sources.is_empty() {
                println!("No upstream keys configured");
            }
            for (suffix, source) in &key_sources {
                println!("{:<10} {}", suffix, source);
            }
            Ok(())
        }
    }
}
