//! huddle - Real-time meeting session coordinator
//!
//! WebSocket coordinator for multi-party meetings: room registry, signaling
//! relay, broadcast fanout, and an audio insight pipeline trigger, plus a
//! headless reference client.

mod auth;
mod client;
mod config;
mod error;
mod mesh;
mod pipeline;
mod protocol;
mod registry;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Real-time meeting session coordinator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator server
    Serve {
        /// Listen address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Transcription/insight service endpoint (overrides config)
        #[arg(long)]
        inference_url: Option<String>,

        /// Shared token secret (overrides config)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Join a room as a headless client
    Join {
        /// Room to join
        room: String,

        /// User ID to join as
        #[arg(short, long)]
        user: String,

        /// Display name (defaults to the user ID)
        #[arg(short, long)]
        name: Option<String>,

        /// Server URL (overrides config)
        #[arg(long)]
        server: Option<String>,

        /// Shared token secret (overrides config)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Mint a connect token for a user
    Token {
        /// User ID the token is bound to
        user: String,

        /// Shared token secret (overrides config)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Write the config file with current defaults
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            inference_url,
            secret,
        } => {
            let mut config = Config::load().context("Failed to load config")?;
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(url) = inference_url {
                config.inference_url = Some(url);
            }
            if let Some(secret) = secret {
                config.shared_secret = secret;
            }
            server::run(config).await?;
        }
        Commands::Join {
            room,
            user,
            name,
            server,
            secret,
        } => {
            let mut config = Config::load().context("Failed to load config")?;
            if let Some(server) = server {
                config.server_url = server;
            }
            if let Some(secret) = secret {
                config.shared_secret = secret;
            }
            let name = name.unwrap_or_else(|| user.clone());
            let engine: client::EngineFactory =
                Arc::new(|remote| Box::new(client::HeadlessEngine::new(remote)));
            client::connect_and_run(&config, &room, &user, &name, engine).await?;
        }
        Commands::Token { user, secret } => {
            let config = Config::load().context("Failed to load config")?;
            let secret = secret.unwrap_or(config.shared_secret);
            println!("{}", auth::mint_token(&secret, &user));
        }
        Commands::Init => {
            let config = Config::load().context("Failed to load config")?;
            config.save().context("Failed to write config")?;
            println!("Config written.");
        }
    }

    Ok(())
}
