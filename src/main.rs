use std::sync::Arc;

use clap::Parser;
use tracing::info;

use stashd::auth::Credentials;
use stashd::config::Config;
use stashd::events;
use stashd::http::{self, AppState};
use stashd::metrics::Metrics;
use stashd::replicator::Replicator;
use stashd::stash::Stash;
use stashd::store::Store;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stashd=info".into()),
        )
        .init();

    let config = Config::parse();

    if config.user.is_empty() || config.pass.is_empty() {
        eprintln!("You need to provide a username and a password!");
        std::process::exit(1);
    }

    let frontend = config.frontend.clone().unwrap_or_else(|| {
        eprintln!("You need to provide a front-facing URL, e.g. http://localhost:8080");
        std::process::exit(1);
    });
    if let Err(e) = url::Url::parse(&frontend) {
        eprintln!("Invalid front-facing URL: {e}");
        std::process::exit(1);
    }

    let store = Store::open(&config.datafile).unwrap_or_else(|e| {
        eprintln!("Opening {} failed: {e}", config.datafile.display());
        std::process::exit(1);
    });
    let store = Arc::new(store);

    let bus = events::spawn_dispatcher();
    let metrics = Metrics::new();
    let credentials = Arc::new(Credentials::new(&config.user, &config.pass));
    let stash = Stash::new(store.clone(), bus.clone());

    // Replicate from the parent server when one is configured.
    if let Some(parent) = config.parent.clone() {
        info!("starting replication from {parent}");
        Replicator::new(parent, stash.clone(), credentials.clone(), metrics.clone()).spawn();
    }

    // Only parents and forced parents accept mutations.
    let accept_uploads = config.parent.is_none() || config.forceparent;
    let child_mode = config.parent.is_some() && !config.forceparent;

    let state = AppState {
        stash,
        store,
        bus,
        credentials,
        frontend,
        child_mode,
        metrics,
        http: reqwest::Client::new(),
    };
    let app = http::router(state, accept_uploads);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Listening on {} failed: {e}", config.listen);
            std::process::exit(1);
        });
    info!("listening on {}", config.listen);

    axum::serve(listener, app).await.unwrap_or_else(|e| {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    });
}
