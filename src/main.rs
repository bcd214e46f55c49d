//! Music catalog server binary.
//!
//! Groups, albums and standalone tracks are stored as plain directories
//! under the static root; this binary exposes the upload, listing and
//! delete API over them and serves the files themselves.

mod albums;
mod app;
mod atomic;
mod background;
mod catalog;
mod config;
mod error;
mod etag;
mod groups;
mod http;
mod locking;
mod logging;
mod naming;
mod staging;
mod tls;
mod tracks;
mod url;
mod version;

use axum::extract::Extension;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::app::{AppState, build_router};
use crate::background::spawn_background_tasks;
use crate::catalog::CatalogStore;
use crate::config::{Args, SHUTDOWN_GRACE_SECS};
use crate::http::RequestScheme;
use crate::locking::EntityLocks;
use crate::staging::StagingArea;

shadow!(build);

/// Starts the catalog server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let catalog = Arc::new(CatalogStore::new(PathBuf::from(&args.static_dir)));
    let staging = Arc::new(StagingArea::new(
        PathBuf::from(&args.staging_dir),
        Duration::from_secs(args.staging_ttl_secs),
    ));
    catalog.ensure_root().await?;
    staging.ensure_root().await?;
    info!(
        catalog = ?catalog.root_path(),
        staging = ?staging.root_path(),
        "catalog directories ready"
    );

    let state = AppState {
        catalog,
        staging: staging.clone(),
        locks: Arc::new(EntityLocks::new(Duration::from_secs(args.lock_wait_secs))),
        upload_max_size: args.upload_max_size,
        cors_origins: args.cors_origins.clone(),
    };
    let app = build_router(&state);

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let https = tls::build_https_listener(&args, host).await?;
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr).handle(handle.clone()).serve(
        app.clone()
            .layer(Extension(RequestScheme::Http))
            .into_make_service_with_connect_info::<SocketAddr>(),
    );
    let https_server = async {
        match https {
            Some((https_addr, tls_config)) => {
                info!("🔒 Starting HTTPS server at {}", https_addr);
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(
                        app.layer(Extension(RequestScheme::Https))
                            .into_make_service_with_connect_info::<SocketAddr>(),
                    )
                    .await
            }
            None => std::future::pending().await,
        }
    };

    spawn_background_tasks(staging);
    tokio::spawn(shutdown_signal(handle.clone()));
    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
