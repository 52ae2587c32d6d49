use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

fn config_body(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "processing": config.processing,
        "physics": config.physics,
        "performance": config.performance
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_body(&config)
    })))
}

/// Apply a partial update such as `{"processing": {"min_prominence": 0.1}}`.
///
/// The merged configuration is validated before it replaces the current one; a rejected
/// update leaves the running configuration untouched.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;
    state.update_config(updated.clone()).map_err(AppError::ValidationError)?;

    tracing::info!(
        min_prominence = updated.processing.min_prominence,
        carriage_speed = updated.physics.carriage_speed_m_per_s,
        "Configuration updated at runtime"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_body(&updated)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_partial_update_and_rejection() {
        let state = AppState::new(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"processing": {"min_prominence": 0.1}}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["updated_config"]["processing"]["min_prominence"], 0.1);
        assert_eq!(state.get_config().processing.min_prominence, 0.1);

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"physics": {"carriage_speed_m_per_s": -1.0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().physics.carriage_speed_m_per_s, 0.01);

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["processing"]["filter_order"], 4);
    }
}
