//! Image generation collaborators
//!
//! The API hands a prompt and a source image URL to an [`ImageGenerator`] and
//! records the finished job in the `projects` table.

use std::time::Duration;

use async_trait::async_trait;
use retouch_shared::UserId;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

pub const REPLICATE_API_URL: &str = "https://api.replicate.com/v1";

/// Generation errors
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Generation request failed: {0}")]
    Request(String),
    #[error("Generation failed: {0}")]
    Failed(String),
    #[error("Generation did not finish after {0} polls")]
    Timeout(u32),
    #[error("Generation returned no usable output")]
    EmptyOutput,
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        GenerationError::Request(err.to_string())
    }
}

/// Runs an image-to-image model
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Returns the URL of the generated image
    async fn generate(&self, prompt: &str, image_url: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl Prediction {
    fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "succeeded" | "failed" | "canceled")
    }
}

/// First URL in a prediction output. Models return either a single URL or a list.
fn output_url(output: &Value) -> Option<String> {
    match output {
        Value::String(url) if !url.is_empty() => Some(url.clone()),
        Value::Array(entries) => entries.iter().find_map(output_url),
        _ => None,
    }
}

/// Endpoint and body for a model reference, either `owner/name` or `owner/name:version`
fn prediction_request(base_url: &str, model: &str, input: Value) -> (String, Value) {
    match model.split_once(':') {
        Some((_, version)) => (
            format!("{}/predictions", base_url),
            json!({ "version": version, "input": input }),
        ),
        None => (
            format!("{}/models/{}/predictions", base_url, model),
            json!({ "input": input }),
        ),
    }
}

/// [`ImageGenerator`] backed by the Replicate predictions API
#[derive(Clone)]
pub struct ReplicateClient {
    http: reqwest::Client,
    api_token: String,
    model: String,
    base_url: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl ReplicateClient {
    pub fn new(api_token: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(90))
                .build()
                .unwrap_or_default(),
            api_token: api_token.into(),
            model: model.into(),
            base_url: REPLICATE_API_URL.to_string(),
            poll_interval: Duration::from_secs(2),
            max_polls: 60,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn read_prediction(response: reqwest::Response) -> Result<Prediction, GenerationError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Request(format!("{}: {}", status, body)));
        }
        Ok(response.json::<Prediction>().await?)
    }

    async fn poll(&self, mut prediction: Prediction) -> Result<Prediction, GenerationError> {
        let mut polls = 0;
        while !prediction.is_terminal() {
            if polls >= self.max_polls {
                return Err(GenerationError::Timeout(polls));
            }
            polls += 1;
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .http
                .get(format!("{}/predictions/{}", self.base_url, prediction.id))
                .bearer_auth(&self.api_token)
                .send()
                .await?;
            prediction = Self::read_prediction(response).await?;
        }
        Ok(prediction)
    }
}

#[async_trait]
impl ImageGenerator for ReplicateClient {
    async fn generate(&self, prompt: &str, image_url: &str) -> Result<String, GenerationError> {
        let input = json!({
            "prompt": prompt,
            "image_input": [image_url],
        });
        let (endpoint, body) = prediction_request(&self.base_url, &self.model, input);

        let response = self
            .http
            .post(endpoint)
            .bearer_auth(&self.api_token)
            .header("Prefer", "wait")
            .json(&body)
            .send()
            .await?;

        let prediction = Self::read_prediction(response).await?;
        tracing::debug!(prediction_id = %prediction.id, status = %prediction.status, "Prediction created");

        let prediction = self.poll(prediction).await?;
        if prediction.status != "succeeded" {
            let reason = prediction
                .error
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                .unwrap_or_else(|| prediction.status.clone());
            return Err(GenerationError::Failed(reason));
        }

        prediction
            .output
            .as_ref()
            .and_then(output_url)
            .ok_or(GenerationError::EmptyOutput)
    }
}

/// A finished generation job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProject {
    pub user_id: UserId,
    pub prompt: String,
    pub input_image_url: String,
    pub output_image_url: String,
}

/// Persistence for finished generation jobs
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn record_project(&self, project: NewProject) -> Result<Uuid, sqlx::Error>;
}

/// [`ProjectStore`] backed by the `projects` table
#[derive(Clone)]
pub struct PgProjectStore {
    pool: PgPool,
}

impl PgProjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectStore for PgProjectStore {
    async fn record_project(&self, project: NewProject) -> Result<Uuid, sqlx::Error> {
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO projects (user_id, prompt, input_image_url, output_image_url, status)
            VALUES ($1, $2, $3, $4, 'completed')
            RETURNING id
            "#,
        )
        .bind(project.user_id.as_uuid())
        .bind(&project.prompt)
        .bind(&project.input_image_url)
        .bind(&project.output_image_url)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }
}
