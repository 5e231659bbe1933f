#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Retouch API Library
//!
//! The HTTP surface of Retouch: generation gated on quota, credits, referrals,
//! Stripe checkout and webhooks.

pub mod auth;
pub mod config;
pub mod error;
pub mod generation;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use generation::{ImageGenerator, NewProject, ProjectStore, ReplicateClient};
pub use routes::create_router;
pub use state::{AppState, BillingServices};
