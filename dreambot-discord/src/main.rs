mod handler;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dreambot_core::config::DEFAULT_CONFIG_PATH;
use dreambot_core::{load_backend, Config, DreamBot, Gateway};
use serenity::prelude::*;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handler::Handler;

#[derive(Parser, Debug)]
#[command(author, version, about = "Discord bot for a local text-to-image model")]
struct Args {
    /// Configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Model backend: flux-schnell, flux-dev, or the URL of a generation server
    #[arg(long)]
    backend: Option<String>,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Command prefix, overriding the config file
    #[arg(long)]
    prefix: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(backend) = &self.backend {
            config.model.backend = backend.clone();
        }
        if self.cpu {
            config.model.cpu = true;
        }
        if let Some(prefix) = &self.prefix {
            config.options.command_prefix = prefix.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dreambot=info,dreambot_core=info,serenity=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    args.apply(&mut config);
    config.check()?;
    let token = config.token()?.to_string();

    info!(
        "Starting bot using command prefix {}",
        config.options.command_prefix
    );

    let model = load_backend(&config.model).await?;
    let gateway = Gateway::new(model, &config.limits);
    let bot = Arc::new(DreamBot::new(&config, gateway));

    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;
    let mut client = Client::builder(&token, intents)
        .event_handler(Handler::new(bot))
        .await
        .context("failed to create Discord client")?;

    client.start().await.context("Discord client stopped")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "dreambot",
            "--backend",
            "http://localhost:8000",
            "--cpu",
            "--prefix",
            "/",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.model.backend, "http://localhost:8000");
        assert!(config.model.cpu);
        assert_eq!(config.options.command_prefix, "/");
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_empty_prefix_override_rejected() {
        let args = Args::parse_from(["dreambot", "--prefix", ""]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert!(config.check().is_err());
    }
}
