use alumnet_core::{DisplayName, Email, Role};
use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
};
use ulid::Ulid;

use crate::server::{
    auth::{
        authenticate, hash_password, hash_refresh_token, issue_tokens, now_unix, validate_password,
    },
    core::{AppState, SessionRecord, ACCESS_TOKEN_TTL_SECS, REFRESH_TOKEN_TTL_SECS},
    db::ensure_db_schema,
    directory::{create_user, find_user, verify_credentials},
    errors::ChatFailure,
    types::{
        AuthResponse, LoginRequest, MeResponse, RefreshRequest, RegisterRequest, RegisterResponse,
    },
};

pub(crate) async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ChatFailure> {
    ensure_db_schema(&state).await?;
    let name = DisplayName::try_from(payload.name).map_err(|_| ChatFailure::InvalidRequest)?;
    let email = Email::try_from(payload.email).map_err(|_| ChatFailure::InvalidRequest)?;
    let role = Role::try_from(payload.role).map_err(|_| ChatFailure::InvalidRequest)?;
    // Admin accounts are provisioned out of band, never self-assigned.
    if role == Role::Admin {
        return Err(ChatFailure::InvalidRequest);
    }
    validate_password(&payload.password)?;

    let password_hash = hash_password(&payload.password).map_err(|_| ChatFailure::Internal)?;
    let created = create_user(&state, &name, &email, role, &password_hash).await?;

    if created.is_none() {
        // Same acceptance response to avoid registration-time enumeration.
        tracing::info!(event = "auth.register", outcome = "existing_user");
        return Ok(Json(RegisterResponse { accepted: true }));
    }

    tracing::info!(event = "auth.register", outcome = "created");

    Ok(Json(RegisterResponse { accepted: true }))
}

pub(crate) async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ChatFailure> {
    ensure_db_schema(&state).await?;
    let email = Email::try_from(payload.email).map_err(|_| ChatFailure::Unauthorized)?;
    validate_password(&payload.password).map_err(|_| ChatFailure::Unauthorized)?;

    let now = now_unix();
    let user = verify_credentials(&state, &email, &payload.password, now).await?;
    let Some(user) = user else {
        tracing::warn!(event = "auth.login", outcome = "invalid_credentials");
        return Err(ChatFailure::Unauthorized);
    };

    let session_id = Ulid::new().to_string();
    let (access_token, refresh_token, refresh_hash) =
        issue_tokens(&state, user.id, &user.name, user.role, &session_id)
            .map_err(|_| ChatFailure::Internal)?;
    state.sessions.write().await.insert(
        session_id,
        SessionRecord {
            user_id: user.id,
            refresh_token_hash: refresh_hash,
            expires_at_unix: now + REFRESH_TOKEN_TTL_SECS,
            revoked: false,
        },
    );

    tracing::info!(event = "auth.login", outcome = "success", user_id = %user.id);

    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        expires_in_secs: ACCESS_TOKEN_TTL_SECS,
    }))
}

pub(crate) async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<AuthResponse>, ChatFailure> {
    if payload.refresh_token.is_empty() || payload.refresh_token.len() > 512 {
        return Err(ChatFailure::Unauthorized);
    }

    let token_hash = hash_refresh_token(&payload.refresh_token);
    if let Some(session_id) = state
        .used_refresh_tokens
        .read()
        .await
        .get(&token_hash)
        .cloned()
    {
        // A replayed rotation burns the whole session.
        if let Some(session) = state.sessions.write().await.get_mut(&session_id) {
            session.revoked = true;
        }
        tracing::warn!(event = "auth.refresh", outcome = "replay_detected");
        return Err(ChatFailure::Unauthorized);
    }

    let session_id = payload
        .refresh_token
        .split('.')
        .next()
        .ok_or(ChatFailure::Unauthorized)?
        .to_owned();

    let mut sessions = state.sessions.write().await;
    let session = sessions
        .get_mut(&session_id)
        .ok_or(ChatFailure::Unauthorized)?;
    if session.revoked
        || session.expires_at_unix < now_unix()
        || session.refresh_token_hash != token_hash
    {
        return Err(ChatFailure::Unauthorized);
    }

    let user = find_user(&state, session.user_id)
        .await?
        .ok_or(ChatFailure::Unauthorized)?;

    let old_hash = session.refresh_token_hash;
    let (access_token, refresh_token, refresh_hash) =
        issue_tokens(&state, user.id, &user.name, user.role, &session_id)
            .map_err(|_| ChatFailure::Internal)?;
    session.refresh_token_hash = refresh_hash;
    session.expires_at_unix = now_unix() + REFRESH_TOKEN_TTL_SECS;
    drop(sessions);

    state
        .used_refresh_tokens
        .write()
        .await
        .insert(old_hash, session_id);

    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        expires_in_secs: ACCESS_TOKEN_TTL_SECS,
    }))
}

pub(crate) async fn logout(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<StatusCode, ChatFailure> {
    if payload.refresh_token.is_empty() || payload.refresh_token.len() > 512 {
        return Err(ChatFailure::Unauthorized);
    }

    let session_id = payload
        .refresh_token
        .split('.')
        .next()
        .ok_or(ChatFailure::Unauthorized)?
        .to_owned();
    let token_hash = hash_refresh_token(&payload.refresh_token);
    let mut sessions = state.sessions.write().await;
    let session = sessions
        .get_mut(&session_id)
        .ok_or(ChatFailure::Unauthorized)?;
    if session.refresh_token_hash != token_hash {
        return Err(ChatFailure::Unauthorized);
    }
    session.revoked = true;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ChatFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let user = find_user(&state, auth.user_id)
        .await?
        .ok_or(ChatFailure::Unauthorized)?;

    Ok(Json(MeResponse {
        user_id: user.id.to_string(),
        name: user.name,
        email: user.email,
        role: user.role,
    }))
}
