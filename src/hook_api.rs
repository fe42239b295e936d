//! Loopback HTTP listener for assistant lifecycle hooks.
//!
//! `POST /hook` turns a hook payload into a [`Session`] and hands it to the
//! dispatcher over a channel; `GET /health` answers liveness checks.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tokio::{net::TcpListener, sync::mpsc};

use crate::session::Session;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub hook_event_name: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub transcript_path: String,
}

impl HookPayload {
    /// A session, or `None` when the resumable id or working directory is missing.
    pub fn into_session(self) -> Option<Session> {
        if self.session_id.trim().is_empty() || self.cwd.trim().is_empty() {
            return None;
        }
        Some(Session::new(
            self.hook_event_name,
            self.session_id,
            self.cwd,
            &self.transcript_path,
        ))
    }
}

#[derive(Clone)]
struct HookState {
    sessions_tx: mpsc::Sender<Session>,
}

pub fn hook_router(sessions_tx: mpsc::Sender<Session>) -> Router {
    Router::new()
        .route("/hook", post(receive_hook))
        .route("/health", get(health))
        .with_state(HookState { sessions_tx })
}

/// Bind the loopback listener. Only `127.0.0.1` is ever used.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind hook listener on {addr}"))
}

pub async fn serve(listener: TcpListener, sessions_tx: mpsc::Sender<Session>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(target = "session_relay::hook_api", %addr, "hook listener ready");
    }
    axum::serve(listener, hook_router(sessions_tx))
        .await
        .context("hook listener failed")
}

async fn health() -> &'static str {
    "ok"
}

async fn receive_hook(State(state): State<HookState>, body: Bytes) -> (StatusCode, &'static str) {
    let payload: HookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(target = "session_relay::hook_api", error = %error, "malformed hook payload");
            return (StatusCode::BAD_REQUEST, "bad request");
        }
    };

    let event = payload.hook_event_name.clone();
    let Some(session) = payload.into_session() else {
        tracing::warn!(
            target = "session_relay::hook_api",
            event = %event,
            "hook payload missing session_id or cwd"
        );
        return (StatusCode::BAD_REQUEST, "invalid payload");
    };

    tracing::info!(
        target = "session_relay::hook_api",
        event = %session.hook_event,
        session_id = %session.session_id,
        project = %session.project_name,
        "hook received"
    );

    if state.sessions_tx.send(session).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }
    (StatusCode::OK, "ok")
}
