//! Iris RESTful Server - streams slide tiles to deep-zoom viewers.
//!
//! This binary parses the configuration, starts the server, and shuts down
//! cleanly on SIGINT/SIGTERM/SIGQUIT.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iris_restful::{Config, RestServer};

#[tokio::main]
async fn main() {
    let config = Config::parse();

    init_logging(config.verbose);

    let server = match RestServer::bind(&config).await {
        Ok(server) => server,
        Err(error) => {
            error!("failed to create the Iris RESTful server: {error}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.serve() => {
            if let Err(error) = result {
                error!("server error: {error}");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("shutting down...");
        }
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "iris_restful=debug"
    } else {
        "iris_restful=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves when the process receives a termination signal.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
            (Ok(mut terminate), Ok(mut quit)) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                    _ = quit.recv() => {}
                }
            }
            _ => {
                error!("failed to install signal handlers; falling back to Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
