//! Supabase JWT validation

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Audience Supabase stamps on tokens for signed-in users
pub const SUPABASE_AUDIENCE: &str = "authenticated";

/// JWT claims structure for Supabase-issued tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseClaims {
    /// Subject (user ID as string, parsed to a UUID by the middleware)
    pub sub: String,
    pub email: Option<String>,
    /// Role (authenticated, anon, etc.)
    pub role: Option<String>,
    pub aud: Option<String>,
    pub iat: Option<i64>,
    pub exp: i64,
}

/// Validates access tokens signed with the project's JWT secret
#[derive(Clone)]
pub struct SupabaseJwtVerifier {
    decoding_key: DecodingKey,
}

impl SupabaseJwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate a Supabase-issued JWT token
    pub fn validate(&self, token: &str) -> Result<SupabaseClaims, JwtError> {
        // Explicit algorithm prevents algorithm confusion attacks
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance
        validation.set_audience(&[SUPABASE_AUDIENCE]);

        match decode::<SupabaseClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(JwtError::Expired),
                jsonwebtoken::errors::ErrorKind::InvalidToken => Err(JwtError::Invalid),
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => Err(JwtError::Invalid),
                jsonwebtoken::errors::ErrorKind::InvalidSignature => Err(JwtError::Invalid),
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    tracing::warn!("Supabase JWT audience validation failed - rejecting token");
                    Err(JwtError::Invalid)
                }
                _ => Err(JwtError::Validation(e.to_string())),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;

    const SECRET: &str = "test-supabase-jwt-secret";

    fn token(secret: &str, aud: &str, exp_offset: i64) -> String {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = SupabaseClaims {
            sub: "6f1c1c9e-9a55-4c47-8d1a-0b7e2a2f5b11".to_string(),
            email: Some("user@example.com".to_string()),
            role: Some("authenticated".to_string()),
            aud: Some(aud.to_string()),
            iat: Some(now),
            exp: now + exp_offset,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn test_valid_token() {
        let verifier = SupabaseJwtVerifier::new(SECRET);
        let claims = verifier.validate(&token(SECRET, SUPABASE_AUDIENCE, 3600)).unwrap();
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn test_rejects_wrong_secret_audience_and_expiry() {
        let verifier = SupabaseJwtVerifier::new(SECRET);
        assert!(matches!(
            verifier.validate(&token("other-secret", SUPABASE_AUDIENCE, 3600)),
            Err(JwtError::Invalid)
        ));
        assert!(matches!(
            verifier.validate(&token(SECRET, "anon", 3600)),
            Err(JwtError::Invalid)
        ));
        assert!(matches!(
            verifier.validate(&token(SECRET, SUPABASE_AUDIENCE, -3600)),
            Err(JwtError::Expired)
        ));
        assert!(verifier.validate("not-a-jwt").is_err());
    }
}
