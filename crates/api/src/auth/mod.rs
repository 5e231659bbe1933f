//! Authentication for Retouch
//!
//! Requests carry a Supabase access token; the middleware verifies it and
//! exposes the caller as an [`AuthUser`] extension.

pub mod admin;
pub mod jwt;
pub mod middleware;

pub use admin::is_admin_user;
pub use jwt::{JwtError, SupabaseClaims, SupabaseJwtVerifier};
pub use middleware::{require_auth, AuthState, AuthUser};
