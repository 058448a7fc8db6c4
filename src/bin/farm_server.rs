//! Render farm node server.
//!
//! Starts discovery, the failure monitor, the control-channel manager and
//! the HTTP API. Every node in the cluster runs this same binary.
//!
//! ## Usage
//!
//! ```bash
//! # Start a node (ports and paths come from flags or the environment)
//! BLENDER_PATH=/usr/bin/blender cargo run --bin farm_server
//!
//! # Kick off an election
//! curl -X POST http://localhost:5050/api/election/start
//!
//! # Submit a render job
//! curl -X POST http://localhost:5050/api/jobs/upload \
//!   -F file=@scene.blend -F frame_start=1 -F frame_end=120 -F fps=24
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use renderfarm::api::create_router;
use renderfarm::{Config, Node};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env first so clap's env-backed flags see it.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::parse();
    tracing::info!(
        blender = %config.blender_path.display(),
        jobs_dir = %config.jobs_dir.display(),
        "starting render farm node"
    );

    let node = Node::new(config.clone()).await?;
    let _tasks = node.start();

    let app = create_router(Arc::clone(&node))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!(%addr, "HTTP API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
