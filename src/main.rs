use std::net::TcpListener;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use oml_collector::config::CollectorConfig;
use oml_collector::db::psql;
use oml_collector::server::Collector;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(code) = run() {
        std::process::exit(code);
    }
}

fn run() -> Result<(), i32> {
    let config = CollectorConfig::load().map_err(|error| {
        error!(message = "Invalid configuration.", %error);
        -1
    })?;

    // When persisting, connection or privilege problems are fatal now
    // rather than at the first session.
    if config.forward.is_none() {
        psql::backend_setup(&config.backend).map_err(|error| {
            error!(message = "Backend start-up check failed.", %error);
            -1
        })?;
    }

    let listener = TcpListener::bind(&config.listen).map_err(|error| {
        error!(message = "Could not bind collection listener.", listen = %config.listen, %error);
        -1
    })?;
    info!(
        message = "Collector listening.",
        listen = %config.listen,
        started_at = %chrono::Utc::now().to_rfc3339(),
    );

    let collector = Arc::new(Collector::new(config).map_err(|error| {
        error!(message = "Invalid forward destination.", %error);
        -1
    })?);

    // SIGTERM/SIGINT: writers are per-session and close when their
    // connections drop; the databases commit and close here, in that
    // order, before the process exits.
    let shutdown = Arc::clone(&collector);
    ctrlc::set_handler(move || {
        info!(message = "Termination signal received; shutting down.");
        shutdown.shutdown();
        std::process::exit(0);
    })
    .map_err(|error| {
        error!(message = "Could not install the termination handler.", %error);
        -1
    })?;

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let collector = Arc::clone(&collector);
                let spawned = std::thread::Builder::new()
                    .name("session".into())
                    .spawn(move || collector.serve(stream));
                if let Err(error) = spawned {
                    error!(message = "Could not spawn session thread.", %error);
                }
            }
            Err(error) => {
                error!(message = "Accept failed.", %error);
            }
        }
    }

    collector.shutdown();
    Ok(())
}
