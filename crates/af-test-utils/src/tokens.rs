//! Bearer-token minting for tests.  The hub only verifies tokens; tests play
//! the role of the external identity service.

use af_protocol::Claims;
use jsonwebtoken::{encode, EncodingKey, Header};

/// Shared secret used across the test suites.
pub const TEST_SIGNING_SECRET: &str = "af-test-signing-secret";

/// Mint an HS256 token valid for `ttl_secs` from now.
pub fn mint_token(secret: &str, sub: &str, permissions: &[&str], ttl_secs: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: sub.to_owned(),
        permissions: permissions.iter().map(|&p| p.to_owned()).collect(),
        iat: now,
        exp: now + ttl_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encoding cannot fail with an HS256 secret")
}

/// Mint a token that expired `expired_secs` ago (beyond any sane leeway).
pub fn mint_expired_token(secret: &str, sub: &str, permissions: &[&str], expired_secs: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: sub.to_owned(),
        permissions: permissions.iter().map(|&p| p.to_owned()).collect(),
        iat: now - expired_secs - 3600,
        exp: now - expired_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encoding cannot fail with an HS256 secret")
}
