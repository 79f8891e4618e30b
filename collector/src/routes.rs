use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use wastecam_common::prediction::PredictionReport;

use crate::error::CollectorError;
use crate::store::PredictionStore;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub store: PredictionStore,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/prediction
async fn receive_prediction(
    State(state): State<Arc<AppState>>,
    body: Result<Json<PredictionReport>, JsonRejection>,
) -> Result<Response, CollectorError> {
    let Json(report) = body.map_err(|e| CollectorError::Invalid(e.body_text()))?;
    let received_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

    let stored = tokio::task::spawn_blocking(move || state.store.insert(&report, &received_at)).await??;
    info!(
        id = stored.id,
        category = stored.category,
        confidence = stored.confidence,
        device_id = stored.device_id,
        "prediction received"
    );

    Ok((
        StatusCode::OK,
        Json(json!({ "status": "success", "message": "Prediction received" })),
    )
        .into_response())
}

/// GET /api/predictions: the in-memory history, oldest first
async fn list_predictions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "success", "predictions": state.store.recent_predictions() }))
}

/// GET /api/stats
async fn get_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "success", "stats": state.store.stats() }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/prediction", post(receive_prediction))
        .route("/api/predictions", get(list_predictions))
        .route("/api/stats", get(get_stats))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn spawn_collector() -> String {
        let state = Arc::new(AppState {
            store: PredictionStore::open_in_memory(50).unwrap(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn post(base: &str, body: &str) -> (u16, Value) {
        let response = reqwest::Client::new()
            .post(format!("{base}/api/prediction"))
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        let text = response.text().await.unwrap();
        (status, serde_json::from_str(&text).unwrap())
    }

    async fn get(base: &str, path: &str) -> Value {
        let text = reqwest::get(format!("{base}{path}"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn accepts_report_and_lists_it() {
        let base = spawn_collector().await;
        let (status, body) = post(
            &base,
            r#"{"category":"glass","confidence":0.82,"device_id":"ESP32-CAM-001","timestamp":1700000000000}"#,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "success");

        let list = get(&base, "/api/predictions").await;
        let predictions = list["predictions"].as_array().unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0]["category"], "glass");
        assert_eq!(predictions[0]["device_id"], "ESP32-CAM-001");
        assert!(predictions[0]["received_at"].is_string());
    }

    #[tokio::test]
    async fn malformed_body_is_a_400_with_message() {
        let base = spawn_collector().await;

        let (status, body) = post(&base, r#"{"category":"glass"}"#).await;
        assert_eq!(status, 400);
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().starts_with("invalid prediction"));

        let (status, _) = post(&base, "not json").await;
        assert_eq!(status, 400);

        let stats = get(&base, "/api/stats").await;
        assert_eq!(stats["stats"]["total_classifications"], 0);
    }

    #[tokio::test]
    async fn stats_reflect_received_reports() {
        let base = spawn_collector().await;
        for (category, confidence) in [("paper", 0.7), ("paper", 0.9), ("metal", 0.8)] {
            let body = format!(
                r#"{{"category":"{category}","confidence":{confidence},"device_id":"d","timestamp":1}}"#
            );
            assert_eq!(post(&base, &body).await.0, 200);
        }

        let stats = &get(&base, "/api/stats").await["stats"];
        assert_eq!(stats["total_classifications"], 3);
        assert_eq!(stats["category_counts"]["paper"], 2);
        assert_eq!(stats["most_common_category"], "paper");
        let avg = stats["average_confidence_per_category"]["paper"].as_f64().unwrap();
        assert!((avg - 0.8).abs() < 1e-3);
    }
}
