//! kiln-server – entry point.
//!
//! Startup order:
//! 1. Load configuration (config.json seeds the environment; env wins).
//! 2. Initialise structured tracing.
//! 3. Build the serving root (worker pool, scheduler, sessions, engines).
//! 4. Warm up the default model so the first request skips engine load.
//! 5. Build the Axum router and serve.

use std::net::SocketAddr;

use tracing::info;

use kiln_server::config::Config;
use kiln_server::{build_root, build_state, routes, warmup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_level.parse().unwrap_or_default()),
        )
        .with_target(true);
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "kiln-server starting");

    let root = build_root(&cfg)?;
    info!(
        worker_threads = cfg.worker_threads,
        default_model = %cfg.default_model,
        "serving pipeline ready"
    );

    let port = cfg.http_port;
    let state = build_state(cfg, root);

    warmup(&state).await;

    let app = routes::build(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
