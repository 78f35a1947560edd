//! HTTP snapshot endpoint.
//!
//! Dashboards poll these routes and re-render the whole timeline each time;
//! there is no delta protocol.
//!
//! | Route | Body |
//! |-------|------|
//! | `GET /api/events` | the recording, as nested JSON records |
//! | `GET /api/timeline` | projected geometry at the current time |

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::config::InspectorConfig;
use crate::error::InspectorError;
use crate::projector::Projector;
use crate::recorder::Recorder;

#[derive(Clone)]
struct InspectorState {
    recorder: Arc<Recorder>,
    projector: Projector,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for InspectorError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Snapshot request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Build the router. Nest it wherever the host application wants it, e.g.
/// `app.nest("/inspector", sea_orm_inspector::server::router(recorder, &config))`.
pub fn router(recorder: Arc<Recorder>, config: &InspectorConfig) -> Router {
    Router::new()
        .route("/api/events", get(events))
        .route("/api/timeline", get(timeline))
        .with_state(InspectorState {
            recorder,
            projector: Projector::new(config),
        })
}

async fn events(State(state): State<InspectorState>) -> Result<Response, InspectorError> {
    let body = state.recorder.snapshot_json()?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

async fn timeline(State(state): State<InspectorState>) -> Result<Response, InspectorError> {
    let snapshot = state.recorder.snapshot();
    let timeline = state.projector.project(&snapshot, state.recorder.now());
    let body = serde_json::to_string(&timeline)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}
