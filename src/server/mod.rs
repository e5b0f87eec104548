//! HTTP surface: job submission and identity status.
//!
//! Handlers talk to the pipeline through [`JobRunner`] and [`IdentityStatus`]
//! so routes can be exercised without a browser.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error::PipelineError;
use crate::orchestrator::{Job, KeywordMode};

/// Accepts a job and runs it in the background.
pub trait JobRunner: Send + Sync {
    fn submit(&self, job: Job);
}

/// Reports how many identities currently pass the credential check.
#[async_trait]
pub trait IdentityStatus: Send + Sync {
    async fn active_identities(&self) -> Result<usize, PipelineError>;
}

/// Shared state for the API routes.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<dyn JobRunner>,
    pub status: Arc<dyn IdentityStatus>,
}

/// Build the API router with permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/submit", post(submit))
        .route("/api/check-status", get(check_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `0.0.0.0:port` and serve until the listener fails.
pub async fn serve(port: u16, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port, "API server started");
    axum::serve(listener, router(state)).await
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "listing-harvester"
    }))
}

// ── Submit ──────────────────────────────────────────────────────────────

/// Body of `POST /api/submit`. Every field is optional on the wire so a
/// partial form gets the validation message rather than a 422.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub search_url: Option<String>,
    pub base_url: Option<String>,
    #[serde(rename = "baseMURL")]
    pub base_murl: Option<String>,
    #[serde(rename = "baseYURL")]
    pub base_yurl: Option<String>,
    pub item_specific: Option<String>,
    pub ai_helper: Option<bool>,
    pub email: Option<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl SubmitRequest {
    /// The job this request describes, or `None` when a required field
    /// is missing or no keyword mode was chosen.
    pub fn into_job(self) -> Option<Job> {
        let required = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mode = match required(self.item_specific) {
            Some(field) => KeywordMode::Field(field),
            None if self.ai_helper == Some(true) => KeywordMode::Ai,
            None => return None,
        };

        Some(Job {
            search_url: required(self.search_url)?,
            base_url: required(self.base_url)?,
            mercari_url: required(self.base_murl)?,
            yahoo_url: required(self.base_yurl)?,
            mode,
            recipient: required(self.email)?,
            blacklist: self.blacklist,
        })
    }
}

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> impl IntoResponse {
    let Some(job) = request.into_job() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"message": "Complete all fields", "success": false})),
        );
    };

    info!(
        search_url = %job.search_url,
        mode = ?job.mode,
        recipient = %job.recipient,
        blacklist = job.blacklist.len(),
        "Job accepted"
    );
    state.runner.submit(job);

    (
        StatusCode::OK,
        Json(serde_json::json!({"message": "Data received successfully", "success": true})),
    )
}

// ── Status ──────────────────────────────────────────────────────────────

async fn check_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.status.active_identities().await {
        Ok(active) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "success",
                "message": "Cookie status checked successfully",
                "activeUsers": active
            })),
        ),
        Err(e) => {
            error!(error = %e, "Status check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "status": "error",
                    "message": e.to_string(),
                    "activeUsers": 0
                })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> SubmitRequest {
        SubmitRequest {
            search_url: Some("https://www.ebay.com/sch/i.html?_nkw=driver".into()),
            base_url: Some("https://www.ebay.com/sh/research".into()),
            base_murl: Some("https://jp.mercari.com/".into()),
            base_yurl: Some("https://auctions.yahoo.co.jp/".into()),
            item_specific: None,
            ai_helper: Some(true),
            email: Some("ops@example.com".into()),
            blacklist: vec!["junk".into()],
        }
    }

    #[test]
    fn field_mode_wins_over_ai() {
        let job = SubmitRequest {
            item_specific: Some("Model".into()),
            ..complete()
        }
        .into_job()
        .unwrap();
        assert_eq!(job.mode, KeywordMode::Field("Model".into()));
        assert_eq!(job.blacklist, vec!["junk".to_string()]);
    }

    #[test]
    fn ai_mode_when_no_field() {
        assert_eq!(complete().into_job().unwrap().mode, KeywordMode::Ai);
    }

    #[test]
    fn incomplete_requests_are_rejected() {
        let no_mode = SubmitRequest {
            ai_helper: Some(false),
            ..complete()
        };
        assert!(no_mode.into_job().is_none());

        let blank_email = SubmitRequest {
            email: Some("  ".into()),
            ..complete()
        };
        assert!(blank_email.into_job().is_none());

        assert!(SubmitRequest::default().into_job().is_none());
    }

    #[test]
    fn wire_names_match_the_form() {
        let request: SubmitRequest = serde_json::from_str(
            r#"{"searchUrl":"s","baseUrl":"b","baseMURL":"m","baseYURL":"y",
                "itemSpecific":"","aiHelper":true,"email":"e"}"#,
        )
        .unwrap();
        let job = request.into_job().unwrap();
        assert_eq!(job.mercari_url, "m");
        assert_eq!(job.yahoo_url, "y");
        assert_eq!(job.mode, KeywordMode::Ai);
        assert!(job.blacklist.is_empty());
    }
}
