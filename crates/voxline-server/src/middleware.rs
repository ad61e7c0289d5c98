use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use voxline_types::PrincipalInfo;

use crate::AppState;

/// Wrapper for the authenticated principal stored in request extensions.
#[derive(Clone, Debug)]
pub struct PrincipalContext(pub PrincipalInfo);

/// Derives the 32-byte HMAC key for observer tokens from the configured
/// secret. The domain prefix keeps the key independent of any other use of
/// the same secret.
pub fn derive_token_secret(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"voxline-observer-token-v1:");
    hasher.update(secret.as_bytes());
    let result = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&result);
    key
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn sign(payload: &str, secret: &[u8; 32]) -> Hmac<Sha256> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC key length is valid");
    mac.update(payload.as_bytes());
    mac
}

/// Issues a token for `principal` valid for `ttl`.
pub fn generate_observer_token(principal: &PrincipalInfo, secret: &[u8; 32], ttl: Duration) -> String {
    generate_observer_token_until(principal, secret, unix_now() + ttl.as_secs())
}

/// Issues a token for `principal` that expires at `expires` (Unix seconds).
///
/// Token format: `base64url(uid|role|expires|hex(hmac_sha256))`.
pub fn generate_observer_token_until(
    principal: &PrincipalInfo,
    secret: &[u8; 32],
    expires: u64,
) -> String {
    let payload = format!("{}|{}|{}", principal.uid, principal.role, expires);
    let signature = sign(&payload, secret).finalize().into_bytes();
    let token = format!("{}|{}", payload, hex::encode(signature));
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(token.as_bytes())
}

/// Verifies signature and expiry, returning the principal the token was
/// issued to.
pub fn verify_observer_token(token: &str, secret: &[u8; 32]) -> Result<PrincipalInfo, StatusCode> {
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token.as_bytes())
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let token = String::from_utf8(decoded).map_err(|_| StatusCode::UNAUTHORIZED)?;

    // uid may itself contain '|', so split from the right.
    let mut parts = token.rsplitn(4, '|');
    let (Some(sig_hex), Some(expires_str), Some(role), Some(uid)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if uid.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let payload = format!("{}|{}|{}", uid, role, expires_str);
    let provided = hex::decode(sig_hex).map_err(|_| StatusCode::UNAUTHORIZED)?;
    sign(&payload, secret)
        .verify_slice(&provided)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let expires: u64 = expires_str.parse().map_err(|_| StatusCode::UNAUTHORIZED)?;
    if unix_now() > expires {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(PrincipalInfo {
        uid: uid.to_string(),
        role: role.to_string(),
    })
}

/// Middleware to authenticate requests via `Authorization: Bearer <token>`.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get("Authorization")
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_str()
        .map_err(|_| StatusCode::UNAUTHORIZED)?
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?
        .trim()
        .to_string();

    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let principal = verify_observer_token(&token, &state.token_secret).inspect_err(|_| {
        tracing::debug!(path = %req.uri().path(), "rejected bearer token");
    })?;

    req.extensions_mut().insert(PrincipalContext(principal));
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> PrincipalInfo {
        PrincipalInfo {
            uid: "ops|1".to_string(),
            role: "supervisor".to_string(),
        }
    }

    #[test]
    fn token_round_trips_principal() {
        let secret = derive_token_secret("s3cret");
        let token = generate_observer_token(&principal(), &secret, Duration::from_secs(60));
        assert_eq!(verify_observer_token(&token, &secret), Ok(principal()));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let token = generate_observer_token(
            &principal(),
            &derive_token_secret("a"),
            Duration::from_secs(60),
        );
        assert_eq!(
            verify_observer_token(&token, &derive_token_secret("b")),
            Err(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = derive_token_secret("s3cret");
        let token = generate_observer_token_until(&principal(), &secret, unix_now() - 1);
        assert_eq!(
            verify_observer_token(&token, &secret),
            Err(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn tampered_role_is_rejected() {
        let secret = derive_token_secret("s3cret");
        let token = generate_observer_token(&principal(), &secret, Duration::from_secs(60));
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .unwrap();
        let forged = String::from_utf8(decoded)
            .unwrap()
            .replace("supervisor", "admin");
        let forged = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(forged.as_bytes());
        assert!(verify_observer_token(&forged, &secret).is_err());
        assert!(verify_observer_token("not-a-token", &secret).is_err());
    }
}
