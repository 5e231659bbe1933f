//! Image generation route

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiError, generation::NewProject, state::AppState};

pub const MAX_PROMPT_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub image_url: String,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub project_id: Uuid,
    pub output_image_url: String,
    pub quota_used: i32,
    pub quota_limit: i32,
    pub remaining: i32,
}

/// Trimmed prompt and image URL, or the reason they are unusable
fn validate_request(req: &GenerateRequest) -> Result<(String, String), ApiError> {
    let prompt = req.prompt.trim();
    if prompt.is_empty() {
        return Err(ApiError::Validation("A prompt is required".to_string()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(ApiError::Validation(format!(
            "Prompt must be at most {} characters",
            MAX_PROMPT_CHARS
        )));
    }

    let image_url = req.image_url.trim();
    if !(image_url.starts_with("https://") || image_url.starts_with("http://")) {
        return Err(ApiError::Validation("image_url must be an http(s) URL".to_string()));
    }

    Ok((prompt.to_string(), image_url.to_string()))
}

/// Run one generation against the caller's quota.
///
/// Usage is only counted after the image is produced and the project stored.
pub async fn generate(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let (prompt, image_url) = validate_request(&req)?;
    let generator = state.generator.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let user_id = auth_user.user_id;

    state
        .reconciler
        .record_generation_attempt(user_id)
        .await?
        .require_allowed()?;

    let output_image_url = generator.generate(&prompt, &image_url).await.map_err(|e| {
        tracing::error!(user_id = %user_id, error = %e, "Image generation failed");
        ApiError::Upstream(e.to_string())
    })?;

    let project_id = state
        .projects
        .record_project(NewProject {
            user_id,
            prompt,
            input_image_url: image_url,
            output_image_url: output_image_url.clone(),
        })
        .await?;

    let record = state.reconciler.record_generation_success(user_id).await?;

    tracing::info!(
        user_id = %user_id,
        project_id = %project_id,
        quota_used = record.quota_used,
        quota_limit = record.quota_limit,
        "Generation completed"
    );

    Ok(Json(GenerateResponse {
        project_id,
        output_image_url,
        quota_used: record.quota_used,
        quota_limit: record.quota_limit,
        remaining: record.remaining_quota(),
    }))
}
