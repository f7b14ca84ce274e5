use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alumnet_core::{Role, UserId};
use alumnet_protocol::{Envelope, EventType, PROTOCOL_VERSION};
use anyhow::anyhow;
use argon2::{
    password_hash::rand_core::{OsRng, RngCore},
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::{
    header::{AUTHORIZATION, COOKIE},
    HeaderMap,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use pasetors::{
    claims::{Claims, ClaimsValidationRules},
    local,
    token::UntrustedToken,
    version4::V4,
    Local,
};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{
    core::{AppState, AuthContext, ACCESS_TOKEN_TTL_SECS, MAX_MESSAGE_CONTENT_CHARS},
    directory::find_user,
    errors::ChatFailure,
};

pub(crate) const TOKEN_COOKIE_NAME: &str = "token";

pub(crate) fn validate_password(value: &str) -> Result<(), ChatFailure> {
    let len = value.len();
    if (12..=128).contains(&len) {
        Ok(())
    } else {
        Err(ChatFailure::InvalidRequest)
    }
}

/// Trim and bound-check message content. Returns the trimmed text.
pub(crate) fn normalize_message_content(content: &str) -> Result<String, ChatFailure> {
    let trimmed = content.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_MESSAGE_CONTENT_CHARS {
        return Err(ChatFailure::InvalidRequest);
    }
    Ok(trimmed.to_owned())
}

pub(crate) fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hash failed: {e}"))?
        .to_string();
    Ok(hash)
}

pub(crate) fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied_password.as_bytes(), &parsed)
        .is_ok()
}

pub(crate) fn issue_tokens(
    state: &AppState,
    user_id: UserId,
    name: &str,
    role: Role,
    session_id: &str,
) -> anyhow::Result<(String, String, [u8; 32])> {
    let ttl = u64::try_from(ACCESS_TOKEN_TTL_SECS).map_err(|_| anyhow!("invalid token ttl"))?;
    let mut claims = Claims::new_expires_in(&Duration::from_secs(ttl))
        .map_err(|e| anyhow!("claims init failed: {e}"))?;
    claims
        .subject(&user_id.to_string())
        .map_err(|e| anyhow!("claim sub failed: {e}"))?;
    claims
        .add_additional("name", name)
        .map_err(|e| anyhow!("claim name failed: {e}"))?;
    claims
        .add_additional("role", role.as_str())
        .map_err(|e| anyhow!("claim role failed: {e}"))?;

    let access_token = local::encrypt(&state.token_key, &claims, None, None)
        .map_err(|e| anyhow!("access token mint failed: {e}"))?;

    let mut refresh_secret = [0_u8; 32];
    OsRng.fill_bytes(&mut refresh_secret);
    let refresh_secret = URL_SAFE_NO_PAD.encode(refresh_secret);
    let refresh_token = format!("{session_id}.{refresh_secret}");
    let refresh_hash = hash_refresh_token(&refresh_token);

    Ok((access_token, refresh_token, refresh_hash))
}

pub(crate) fn verify_access_token(state: &AppState, token: &str) -> anyhow::Result<Claims> {
    let untrusted = UntrustedToken::<Local, V4>::try_from(token).map_err(|e| anyhow!("{e}"))?;
    let validation_rules = ClaimsValidationRules::new();
    let trusted = local::decrypt(&state.token_key, &untrusted, &validation_rules, None, None)
        .map_err(|e| anyhow!("token decrypt failed: {e}"))?;
    trusted
        .payload_claims()
        .cloned()
        .ok_or_else(|| anyhow!("token claims missing"))
}

pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, ChatFailure> {
    let access_token = request_token(headers).ok_or(ChatFailure::Unauthorized)?;
    authenticate_with_token(state, access_token).await
}

/// Resolve a verified token to its live directory entry. A token whose
/// subject no longer resolves is treated the same as an invalid one.
pub(crate) async fn authenticate_with_token(
    state: &AppState,
    access_token: &str,
) -> Result<AuthContext, ChatFailure> {
    let claims = verify_access_token(state, access_token).map_err(|_| ChatFailure::Unauthorized)?;
    let subject = claims
        .get_claim("sub")
        .and_then(serde_json::Value::as_str)
        .ok_or(ChatFailure::Unauthorized)?;
    let user_id =
        UserId::try_from(subject.to_owned()).map_err(|_| ChatFailure::Unauthorized)?;
    let user = find_user(state, user_id)
        .await?
        .ok_or(ChatFailure::Unauthorized)?;
    Ok(AuthContext {
        user_id,
        name: user.name,
        role: user.role,
    })
}

/// Bearer header first, then the `token` cookie, matching the HTTP
/// middleware order of the original client surface.
pub(crate) fn request_token(headers: &HeaderMap) -> Option<&str> {
    bearer_token(headers).or_else(|| cookie_token(headers))
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

pub(crate) fn cookie_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(COOKIE)?;
    let header = header.to_str().ok()?;
    header.split(';').find_map(|pair| {
        pair.trim()
            .strip_prefix(TOKEN_COOKIE_NAME)?
            .strip_prefix('=')
    })
}

pub(crate) fn hash_refresh_token(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

pub(crate) fn outbound_event<T: Serialize>(event_type: &str, data: T) -> String {
    const FALLBACK_PAYLOAD: &str = r#"{"v":1,"t":"typing","d":{}}"#;

    let Ok(t) = EventType::try_from(event_type.to_owned()) else {
        return String::from(FALLBACK_PAYLOAD);
    };
    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        t,
        d: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
    };

    serde_json::to_string(&envelope).unwrap_or_else(|_| String::from(FALLBACK_PAYLOAD))
}

pub(crate) fn now_unix() -> i64 {
    let now = SystemTime::now();
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use axum::http::{header::COOKIE, HeaderMap, HeaderValue};

    use super::{cookie_token, normalize_message_content};

    #[test]
    fn cookie_token_is_found_among_other_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; token=abc123; sidebar=open"),
        );
        assert_eq!(cookie_token(&headers), Some("abc123"));
    }

    #[test]
    fn cookie_token_ignores_prefixed_names() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("token_shadow=nope"));
        assert_eq!(cookie_token(&headers), None);
    }

    #[test]
    fn message_content_is_trimmed_and_bounded() {
        assert_eq!(normalize_message_content("  hi  ").unwrap(), "hi");
        assert!(normalize_message_content("   ").is_err());
        let long = "x".repeat(5001);
        assert!(normalize_message_content(&long).is_err());
        let max = "x".repeat(5000);
        assert_eq!(normalize_message_content(&max).unwrap().len(), 5000);
    }
}
