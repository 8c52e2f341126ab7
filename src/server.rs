//! HTTP endpoint for scrapes.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse},
    routing::get,
};
use color_eyre::Result;
use log::*;
use tokio::net::TcpListener;

use crate::metrics::{Registry, registry::content_type};

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/metrics", get(scrape))
        .with_state(registry)
}

async fn index() -> Html<&'static str> {
    Html(
        "<html><head><title>Ethereum Exporter</title></head>\
         <body><h1>Ethereum Exporter</h1><p><a href=\"/metrics\">Metrics</a></p></body></html>",
    )
}

/// Serve whatever could be gathered; problems are logged, not returned.
async fn scrape(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let gathered = registry.gather().await;
    for err in &gathered.errors {
        warn!(target: "Scrape", "{}", err);
    }
    debug!(
        target: "Scrape",
        "Gathered {} families, {} errors",
        gathered.families.len(),
        gathered.errors.len()
    );
    match gathered.encode() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, content_type())], body),
        Err(err) => {
            error!(target: "Scrape", "Cannot encode metrics: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string())],
                err.to_string(),
            )
        }
    }
}

pub async fn serve(addr: SocketAddr, registry: Arc<Registry>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(target: "Server", "Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!(target: "Server", "Stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target: "Server", "Cannot listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
}
