//! Router harness backed by in-memory collaborators

#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use hmac::{Hmac, Mac};
use jsonwebtoken::{encode, EncodingKey, Header};
use retouch_api::{
    auth::{AuthState, SupabaseJwtVerifier},
    create_router,
    generation::GenerationError,
    AppState, Config, ImageGenerator, NewProject, ProjectStore,
};
use retouch_billing::memory::{
    InMemoryIdentityProvider, InMemoryReferralCodeStore, InMemorySubscriptionStore, RecordingNotifier,
    StaticCustomerDirectory,
};
use retouch_billing::{
    BillingEventProcessor, CreditLedger, PlanCatalog, PriceIds, QuotaReconciler, ReferralCodeBackend,
    ReferralService, WebhookHandler,
};
use retouch_shared::UserId;
use serde_json::{json, Value};
use sha2::Sha256;
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test-jwt-secret-with-enough-entropy";
pub const WEBHOOK_SECRET: &str = "whsec_router_tests";
pub const ADMIN_EMAIL: &str = "ops@retouch.test";

/// Generator that returns a fixed URL, or fails on demand
#[derive(Default)]
pub struct FakeGenerator {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl ImageGenerator for FakeGenerator {
    async fn generate(&self, _prompt: &str, _image_url: &str) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(GenerationError::Failed("model crashed".to_string()));
        }
        Ok("https://cdn.retouch.test/out.png".to_string())
    }
}

#[derive(Default)]
pub struct RecordingProjectStore {
    pub projects: Mutex<Vec<NewProject>>,
}

#[async_trait]
impl ProjectStore for RecordingProjectStore {
    async fn record_project(&self, project: NewProject) -> Result<Uuid, sqlx::Error> {
        self.projects.lock().unwrap().push(project);
        Ok(Uuid::new_v4())
    }
}

pub struct Harness {
    pub router: Router,
    pub store: Arc<InMemorySubscriptionStore>,
    pub identity: Arc<InMemoryIdentityProvider>,
    pub codes: Arc<InMemoryReferralCodeStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub generator: Arc<FakeGenerator>,
    pub projects: Arc<RecordingProjectStore>,
}

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        public_url: "http://localhost:3000".to_string(),
        database_url: "postgres://unused".to_string(),
        database_max_connections: 1,
        supabase_url: "http://localhost:54321".to_string(),
        supabase_service_role_key: "service-role".to_string(),
        supabase_jwt_secret: JWT_SECRET.to_string(),
        admin_emails: vec![ADMIN_EMAIL.to_string()],
        enable_billing: true,
        replicate_api_token: None,
        replicate_model: "google/nano-banana".to_string(),
    }
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let identity = Arc::new(InMemoryIdentityProvider::new());
        let codes = Arc::new(InMemoryReferralCodeStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let generator = Arc::new(FakeGenerator::default());
        let projects = Arc::new(RecordingProjectStore::default());

        let plans = PlanCatalog::from_price_ids(PriceIds {
            basic: "price_basic".to_string(),
            pro: "price_pro".to_string(),
        });
        let reconciler = QuotaReconciler::new(store.clone(), plans);
        let ledger = CreditLedger::new(identity.clone());
        let referrals = ReferralService::new(
            ReferralCodeBackend::Table(codes.clone()),
            identity.clone(),
            ledger.clone(),
            reconciler.clone(),
            None,
        );
        let processor = BillingEventProcessor::new(
            reconciler.clone(),
            Arc::new(StaticCustomerDirectory::new()),
            identity.clone(),
            notifier.clone(),
        );

        let dyn_generator: Arc<dyn ImageGenerator> = generator.clone();
        let state = AppState {
            config: Arc::new(test_config()),
            pool: None,
            auth: AuthState {
                verifier: Arc::new(SupabaseJwtVerifier::new(JWT_SECRET)),
            },
            identity: identity.clone(),
            reconciler,
            ledger,
            referrals,
            projects: projects.clone(),
            generator: Some(dyn_generator),
            webhooks: Some(WebhookHandler::new(WEBHOOK_SECRET, processor)),
            billing: None,
        };

        Self {
            router: create_router(state),
            store,
            identity,
            codes,
            notifier,
            generator,
            projects,
        }
    }

    /// Register a user with the identity provider and return a bearer token for them
    pub fn user(&self, email: &str, metadata: Value) -> (UserId, String) {
        let user_id = UserId::new();
        self.identity.add_user(user_id, Some(email), metadata);
        (user_id, token_for(user_id, email))
    }

    /// Register a user whose provider-managed `app_metadata` carries `roles`
    pub fn user_with_roles(&self, email: &str, roles: Value) -> (UserId, String) {
        let (user_id, token) = self.user(email, json!({}));
        self.identity.set_app_metadata(user_id, json!({ "roles": roles }));
        (user_id, token)
    }

    pub async fn get(&self, path: &str, token: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn post(&self, path: &str, token: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// Deliver a webhook payload with the given `stripe-signature` header
    pub async fn webhook(&self, payload: &str, signature: Option<String>) -> StatusCode {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/billing/webhook")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        let request = builder.body(Body::from(payload.to_string())).unwrap();
        self.send(request).await.0
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }
}

pub fn token_for(user_id: UserId, email: &str) -> String {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let claims = json!({
        "sub": user_id.to_string(),
        "email": email,
        "role": "authenticated",
        "aud": "authenticated",
        "iat": now,
        "exp": now + 3600,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

pub fn sign(payload: &str, secret: &str) -> String {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

pub fn event(event_type: &str, object: Value) -> String {
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": { "object": object },
    })
    .to_string()
}
