use std::process::ExitCode;

use tapestry::config::{CONFIG_ENV, Config, DEFAULT_CONFIG_PATH};
use tapestry::{Server, fragments};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());

    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path, error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(path = %path, templates = config.templates.len(), "configuration loaded");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let app = config.composition_server()?;
    let layout = Server::bind(&config.layout.listen).await?;

    let fragment_server = match (&config.fragment_server, config.fragment_router()?) {
        (Some(settings), Some(router)) => Some((Server::bind(&settings.listen).await?, router)),
        _ => None,
    };

    match fragment_server {
        Some((server, router)) => {
            tokio::try_join!(app.run(layout), fragments::serve(router, server))?;
        }
        None => app.run(layout).await?,
    }
    Ok(())
}
