//! Bearer-token verification.
//!
//! The hub never mints tokens; the external identity service signs HS256
//! JWTs whose claims carry an identity and permission strings.  Validation
//! allows configurable leeway for clock skew between the signer and this
//! host.

use af_protocol::{Claims, REALTIME_PERMISSION};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::config::AuthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// Absent, malformed, badly signed or expired.
    InvalidToken,
    /// Valid token without the `realtime` permission.
    PermissionDenied,
}

/// Validate a raw bearer token and require the realtime permission.
pub fn authorize(auth: &AuthConfig, raw_token: &str) -> Result<Claims, AuthError> {
    let claims = validate_token(auth, raw_token)?;
    if !claims.permissions.iter().any(|p| p == REALTIME_PERMISSION) {
        return Err(AuthError::PermissionDenied);
    }
    Ok(claims)
}

pub fn validate_token(auth: &AuthConfig, raw_token: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = auth.leeway.as_secs();
    validation.set_required_spec_claims(&["exp"]);

    decode::<Claims>(
        raw_token,
        &DecodingKey::from_secret(auth.signing_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| AuthError::InvalidToken)
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_test_utils::{mint_expired_token, mint_token};
    use std::time::Duration;

    fn auth_config(secret: &str) -> AuthConfig {
        AuthConfig {
            signing_secret: secret.to_owned(),
            leeway: Duration::from_secs(30),
        }
    }

    #[test]
    fn valid_token_with_permission_is_accepted() {
        let cfg = auth_config("0123456789abcdef0123456789abcdef");
        let token = mint_token(&cfg.signing_secret, "operator", &["realtime"], 600);
        let claims = authorize(&cfg, &token).unwrap();
        assert_eq!(claims.sub, "operator");
    }

    #[test]
    fn missing_permission_is_denied() {
        let cfg = auth_config("0123456789abcdef0123456789abcdef");
        let token = mint_token(&cfg.signing_secret, "operator", &["dashboard"], 600);
        assert_eq!(authorize(&cfg, &token), Err(AuthError::PermissionDenied));
    }

    #[test]
    fn expired_token_is_invalid() {
        let cfg = auth_config("0123456789abcdef0123456789abcdef");
        let token = mint_expired_token(&cfg.signing_secret, "operator", &["realtime"], 600);
        assert_eq!(authorize(&cfg, &token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn expiry_within_leeway_is_tolerated() {
        let cfg = auth_config("0123456789abcdef0123456789abcdef");
        let token = mint_expired_token(&cfg.signing_secret, "operator", &["realtime"], 5);
        assert!(authorize(&cfg, &token).is_ok(), "5s stale < 30s leeway");
    }

    #[test]
    fn wrong_key_and_garbage_are_invalid() {
        let cfg = auth_config("0123456789abcdef0123456789abcdef");
        let other = mint_token("another-secret-another-secret!!!", "operator", &["realtime"], 600);
        assert_eq!(authorize(&cfg, &other), Err(AuthError::InvalidToken));
        assert_eq!(authorize(&cfg, "not.a.jwt"), Err(AuthError::InvalidToken));
        assert_eq!(authorize(&cfg, ""), Err(AuthError::InvalidToken));
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
    }
}
