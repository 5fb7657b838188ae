use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, http::StatusCode, routing::get, routing::post};
use tracing::info;

use crate::controller::{ControllerHandle, Status};

pub fn router(handle: ControllerHandle) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/trigger", post(trigger))
        .with_state(handle)
}

/// Loopback admin endpoint backing the `status` and `trigger` subcommands.
pub async fn serve(bind: SocketAddr, handle: ControllerHandle) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding admin endpoint {bind}"))?;
    info!(%bind, "admin endpoint listening");
    axum::serve(listener, router(handle)).await.context("admin endpoint")
}

async fn status(State(handle): State<ControllerHandle>) -> Json<Status> {
    Json(handle.status())
}

async fn trigger(State(handle): State<ControllerHandle>) -> StatusCode {
    handle.trigger_evaluation().await;
    StatusCode::ACCEPTED
}
