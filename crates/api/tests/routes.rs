//! End-to-end router tests against in-memory collaborators

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::atomic::Ordering;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use common::{event, sign, Harness, ADMIN_EMAIL, WEBHOOK_SECRET};
use retouch_billing::{BASIC_PLAN_QUOTA, FREE_TIER_QUOTA, REFERRAL_REWARD_BONUS};
use retouch_shared::SubscriptionStatus;
use serde_json::json;
use time::OffsetDateTime;

fn generate_body() -> serde_json::Value {
    json!({ "prompt": "put a party hat on the cat", "image_url": "https://cdn.retouch.test/cat.png" })
}

#[tokio::test]
async fn health_reports_without_database() {
    let harness = Harness::new();
    let request = Request::builder()
        .method(Method::GET)
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let (status, body) = harness.send(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "not_configured");
    assert_eq!(body["generation"], true);
    assert_eq!(body["billing"], false);
}

#[tokio::test]
async fn protected_routes_require_a_valid_token() {
    let harness = Harness::new();

    let request = Request::builder()
        .method(Method::GET)
        .uri("/api/v1/subscription")
        .body(Body::empty())
        .unwrap();
    let (status, body) = harness.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, body) = harness.get("/api/v1/subscription", "not-a-jwt").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn new_user_sees_free_tier_without_a_row() {
    let harness = Harness::new();
    let (user_id, token) = harness.user("new@retouch.test", json!({}));

    let (status, body) = harness.get("/api/v1/subscription", &token).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "free");
    assert_eq!(body["quota_limit"], FREE_TIER_QUOTA);
    assert_eq!(body["remaining"], FREE_TIER_QUOTA);
    assert!(harness.store.get(user_id).is_none());

    let (status, _) = harness.post("/api/v1/subscription/ensure", &token, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(harness.store.get(user_id).is_some());
}

#[tokio::test]
async fn generation_is_gated_on_free_quota() {
    let harness = Harness::new();
    let (user_id, token) = harness.user("free@retouch.test", json!({}));

    for expected_used in 1..=FREE_TIER_QUOTA {
        let (status, body) = harness.post("/api/v1/generate", &token, generate_body()).await;
        assert_eq!(status, StatusCode::OK, "generation {}", expected_used);
        assert_eq!(body["quota_used"], expected_used);
        assert_eq!(body["output_image_url"], "https://cdn.retouch.test/out.png");
    }

    let (status, body) = harness.post("/api/v1/generate", &token, generate_body()).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");
    assert_eq!(body["error"]["quota_used"], FREE_TIER_QUOTA);
    assert_eq!(body["error"]["quota_limit"], FREE_TIER_QUOTA);

    assert_eq!(harness.generator.calls.load(Ordering::SeqCst), FREE_TIER_QUOTA as usize);
    assert_eq!(harness.projects.projects.lock().unwrap().len(), FREE_TIER_QUOTA as usize);
    assert_eq!(harness.store.get(user_id).unwrap().quota_used, FREE_TIER_QUOTA);
}

#[tokio::test]
async fn failed_generation_does_not_count() {
    let harness = Harness::new();
    let (user_id, token) = harness.user("unlucky@retouch.test", json!({}));
    harness.generator.fail.store(true, Ordering::SeqCst);

    let (status, body) = harness.post("/api/v1/generate", &token, generate_body()).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "UPSTREAM_ERROR");
    assert_eq!(harness.store.get(user_id).unwrap().quota_used, 0);
    assert!(harness.projects.projects.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_generation_request_never_reaches_the_model() {
    let harness = Harness::new();
    let (_, token) = harness.user("sloppy@retouch.test", json!({}));

    let (status, body) = harness
        .post("/api/v1/generate", &token, json!({ "prompt": "  ", "image_url": "https://cdn/x.png" }))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(harness.generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn only_admins_grant_credits() {
    let harness = Harness::new();
    let (target, target_token) = harness.user("member@retouch.test", json!({ "credit_balance": 1 }));
    let (_, admin_token) = harness.user(ADMIN_EMAIL, json!({}));
    let (_, role_admin_token) = harness.user_with_roles("owner@retouch.test", json!(["owner"]));
    let (_, self_promoted_token) =
        harness.user("climber@retouch.test", json!({ "role": "admin", "is_admin": true }));

    let grant = json!({ "user_id": target.to_string(), "amount": 4.7 });

    let (status, _) = harness.post("/api/v1/credits/grant", &target_token, grant.clone()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = harness.post("/api/v1/credits/grant", &self_promoted_token, grant.clone()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = harness.post("/api/v1/credits/grant", &admin_token, grant.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 5);

    let (status, body) = harness.post("/api/v1/credits/grant", &role_admin_token, grant).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 9);

    let (status, _) = harness
        .post("/api/v1/credits/grant", &admin_token, json!({ "user_id": target.to_string(), "amount": 0.5 }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn consuming_credits_checks_the_balance() {
    let harness = Harness::new();
    let (_, token) = harness.user("spender@retouch.test", json!({ "credit_balance": 3 }));

    let (status, body) = harness.post("/api/v1/credits/consume", &token, json!({ "amount": 5 })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INSUFFICIENT_CREDITS");

    let (status, _) = harness.post("/api/v1/credits/consume", &token, json!({ "amount": 3.5 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = harness.post("/api/v1/credits/consume", &token, json!({ "amount": 2 })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 1);

    let (status, body) = harness.get("/api/v1/credits/balance", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 1);
}

#[tokio::test]
async fn referral_code_claim_rewards_the_referrer() {
    let harness = Harness::new();
    let (referrer, referrer_token) = harness.user("referrer@retouch.test", json!({}));
    let (_, friend_token) = harness.user("friend@retouch.test", json!({}));

    let (status, body) = harness.get("/api/v1/referrals/code", &referrer_token).await;
    assert_eq!(status, StatusCode::OK);
    let code = body["code"].as_str().unwrap().to_string();
    assert_eq!(harness.codes.code_for(referrer), Some(code.clone()));

    let (status, body) = harness
        .post("/api/v1/referrals/claim", &friend_token, json!({ "code": code.to_lowercase() }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "claimed");
    assert_eq!(body["reward"], REFERRAL_REWARD_BONUS);

    let (_, body) = harness.get("/api/v1/referrals/code", &referrer_token).await;
    assert_eq!(body["credits"], REFERRAL_REWARD_BONUS);

    let (status, body) = harness
        .post("/api/v1/referrals/claim", &friend_token, json!({ "code": code }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_claimed");

    let (status, _) = harness
        .post("/api/v1/referrals/claim", &referrer_token, json!({ "code": code }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = harness
        .post("/api/v1/referrals/claim", &referrer_token, json!({ "code": "NOSUCHCODE" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_rejects_unsigned_and_malformed_payloads() {
    let harness = Harness::new();
    let payload = event("customer.subscription.updated", json!({ "id": "sub_1" }));

    assert_eq!(harness.webhook(&payload, None).await, StatusCode::BAD_REQUEST);
    assert_eq!(
        harness.webhook(&payload, Some(sign(&payload, "whsec_someone_else"))).await,
        StatusCode::BAD_REQUEST
    );

    let garbage = "{ not json";
    assert_eq!(
        harness.webhook(garbage, Some(sign(garbage, WEBHOOK_SECRET))).await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn webhook_applies_subscription_and_acknowledges_the_rest() {
    let harness = Harness::new();
    let (user_id, token) = harness.user("payer@retouch.test", json!({}));
    let start = OffsetDateTime::now_utc().unix_timestamp();

    let payload = event(
        "customer.subscription.updated",
        json!({
            "id": "sub_router",
            "object": "subscription",
            "customer": "cus_router",
            "status": "active",
            "metadata": { "supabase_user_id": user_id.to_string() },
            "current_period_start": start,
            "current_period_end": start + 2_592_000,
            "items": { "data": [ { "price": { "id": "price_basic" } } ] }
        }),
    );
    assert_eq!(
        harness.webhook(&payload, Some(sign(&payload, WEBHOOK_SECRET))).await,
        StatusCode::OK
    );

    let record = harness.store.get(user_id).unwrap();
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert_eq!(record.quota_limit, BASIC_PLAN_QUOTA);
    assert_eq!(record.billing_subscription_id.as_deref(), Some("sub_router"));

    let (_, body) = harness.get("/api/v1/subscription", &token).await;
    assert_eq!(body["plan"], "Basic");
    assert_eq!(body["remaining"], BASIC_PLAN_QUOTA);

    // Unattributable events are dropped but acknowledged
    let orphan = event(
        "customer.subscription.updated",
        json!({
            "id": "sub_orphan",
            "object": "subscription",
            "customer": "cus_unknown",
            "status": "active",
            "items": { "data": [ { "price": { "id": "price_basic" } } ] }
        }),
    );
    assert_eq!(harness.webhook(&orphan, Some(sign(&orphan, WEBHOOK_SECRET))).await, StatusCode::OK);

    let unsupported = event("customer.created", json!({ "id": "cus_new" }));
    assert_eq!(
        harness.webhook(&unsupported, Some(sign(&unsupported, WEBHOOK_SECRET))).await,
        StatusCode::OK
    );
}

#[tokio::test]
async fn stripe_routes_are_absent_without_billing() {
    let harness = Harness::new();
    let (_, token) = harness.user("curious@retouch.test", json!({}));

    let (status, _) = harness
        .post("/api/v1/billing/checkout", &token, json!({ "price_id": "price_basic" }))
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
