//! REST surface for experiment sessions.
//!
//! A client opens a session here, then drives it over `/ws/experiments/{id}`.
//! The read endpoints return the same JSON the store holds, with invalid numbers as
//! `null`.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateExperimentRequest {
    /// Ambient temperature, °C
    pub temperature: f64,
}

/// `POST /api/v1/experiments`
pub async fn create_experiment(
    state: web::Data<AppState>,
    body: web::Json<CreateExperimentRequest>,
) -> Result<HttpResponse, AppError> {
    let session = state.store.create_session(body.temperature)?;
    info!(session_id = %session.id, temperature = session.temperature, "Experiment session opened");

    Ok(HttpResponse::Created().json(json!({
        "session": session,
        "websocket_path": format!("/ws/experiments/{}", session.id)
    })))
}

/// `GET /api/v1/experiments/{id}`
pub async fn get_experiment(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let session = state.store.load_session(path.into_inner())?;
    Ok(HttpResponse::Ok().json(session))
}

/// `GET /api/v1/experiments/{id}/result`
pub async fn get_experiment_result(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let record = state.store.get_result(path.into_inner())?;
    Ok(HttpResponse::Ok().json(record))
}
