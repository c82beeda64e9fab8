//! Local HTTP trigger API.
//!
//! `POST|GET /start_motion` and `/stop_motion` synthesize a raw signal
//! (`?kind=person` for person detections); `GET /health` reports relay and
//! control-channel state.

use std::net::SocketAddr;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{EventKind, EventSource, RawSignal, SignalSender};
use crate::bridge::AdapterStatus;
use crate::error::CoreError;

/// Shared handler state.
#[derive(Clone)]
pub struct TriggerState {
    signals: SignalSender,
    status: watch::Receiver<AdapterStatus>,
}

impl TriggerState {
    pub fn new(signals: SignalSender, status: watch::Receiver<AdapterStatus>) -> Self {
        Self { signals, status }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerQuery {
    #[serde(default)]
    kind: Option<EventKind>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    status: &'static str,
    kind: EventKind,
    active: bool,
}

pub fn router(state: TriggerState) -> Router {
    Router::new()
        .route("/start_motion", get(start_motion).post(start_motion))
        .route("/stop_motion", get(stop_motion).post(stop_motion))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, CoreError> {
    TcpListener::bind(addr).await.map_err(|e| CoreError::EventSourceTimeout {
        source_name: format!("http trigger {addr}"),
        reason: e.to_string(),
    })
}

/// Serve until `cancel` fires, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: TriggerState,
    cancel: CancellationToken,
) -> Result<(), CoreError> {
    let addr = listener.local_addr().ok();
    info!(addr = ?addr, "HTTP trigger listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| CoreError::EventSourceTimeout {
            source_name: "http trigger".into(),
            reason: e.to_string(),
        })
}

pub async fn start_motion(
    State(state): State<TriggerState>,
    Query(query): Query<TriggerQuery>,
) -> Result<Json<TriggerResponse>, (StatusCode, String)> {
    emit(&state, query.kind.unwrap_or_default(), true).await
}

pub async fn stop_motion(
    State(state): State<TriggerState>,
    Query(query): Query<TriggerQuery>,
) -> Result<Json<TriggerResponse>, (StatusCode, String)> {
    emit(&state, query.kind.unwrap_or_default(), false).await
}

async fn emit(
    state: &TriggerState,
    kind: EventKind,
    active: bool,
) -> Result<Json<TriggerResponse>, (StatusCode, String)> {
    state
        .signals
        .send(RawSignal::new(EventSource::Http, kind, active))
        .await
        .map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "event engine is shutting down".to_owned(),
            )
        })?;
    Ok(Json(TriggerResponse {
        status: "ok",
        kind,
        active,
    }))
}

async fn health(State(state): State<TriggerState>) -> Json<AdapterStatus> {
    Json(state.status.borrow().clone())
}
