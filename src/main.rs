use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wirefeed::app::AppContext;
use wirefeed::cli::{commands, Cli, Commands};
use wirefeed::config::{parse_interval, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(endpoint) = cli.endpoint {
        config.transport.endpoint = endpoint;
    }

    if let Commands::Run {
        poll_interval: Some(ref interval),
        ..
    } = cli.command
    {
        config.feed.poll_interval_secs = parse_interval(interval).map_err(anyhow::Error::msg)?;
    }

    let ctx = AppContext::new(config, cli.db)?;

    match cli.command {
        Commands::Run { user, .. } => {
            commands::run(Arc::new(ctx), &user).await?;
        }
        Commands::Articles => {
            commands::list_articles(&ctx).await?;
        }
        Commands::Sweep { user } => {
            commands::sweep(&ctx, &user).await?;
        }
        Commands::Session => {
            commands::show_session(&ctx)?;
        }
        Commands::Logout => {
            commands::logout(&ctx).await?;
        }
    }

    Ok(())
}
