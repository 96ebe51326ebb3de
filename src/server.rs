use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::service::{ChatRequest, ChatService};

pub fn router(service: ChatService) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/health", get(|| async { "OK" }))
        .with_state(service)
}

/// Serves the API on `addr` until Ctrl-C.
pub async fn serve(addr: SocketAddr, service: ChatService) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    let local_addr = listener.local_addr().context("failed to read listener address")?;
    info!(addr = %local_addr, "chat server listening");

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("chat server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn chat(
    State(service): State<ChatService>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match service.reply(request).await {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => bad_request(err.to_string()),
    }
}

async fn chat_stream(
    State(service): State<ChatService>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match service.reply_stream(request) {
        Ok(chunks) => {
            let body = Body::from_stream(chunks.map(Ok::<_, Infallible>));
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
        }
        Err(err) => bad_request(err.to_string()),
    }
}

/// Every rejected body, malformed JSON included, gets the same 400 shape.
fn bad_request(message: String) -> Response {
    warn!(error = %message, "rejected chat request");
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
