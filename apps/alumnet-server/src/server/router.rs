use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, StatusCode},
    routing::{delete, get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    core::{AppConfig, AppState},
    handlers::{
        auth::{login, logout, me, refresh, register},
        chat::{
            delete_conversation, get_chat_users, get_conversations, get_messages, mark_read,
            search_messages, send_message,
        },
    },
    realtime::gateway_ws,
    types::{health, metrics},
};

/// Build the axum router with global security middleware.
///
/// # Errors
/// Returns an error if configured security limits are invalid.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    if config.max_gateway_event_bytes > alumnet_protocol::MAX_EVENT_BYTES {
        return Err(anyhow!(
            "gateway event limit cannot exceed protocol max of {} bytes",
            alumnet_protocol::MAX_EVENT_BYTES
        ));
    }
    if config.gateway_outbound_queue == 0 {
        return Err(anyhow!("gateway outbound queue must hold at least 1 event"));
    }
    if config.gateway_ingress_events_per_window == 0 {
        return Err(anyhow!(
            "gateway ingress rate limit must be at least 1 event per window"
        ));
    }

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let app_state = AppState::new(config)?;
    let request_id_header = HeaderName::from_static("x-request-id");
    let governor_layer = GovernorLayer::new(governor_config);

    Ok(Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .route("/chat/message", post(send_message))
        .route("/chat/messages/{user_id}", get(get_messages))
        .route("/chat/conversations", get(get_conversations))
        .route("/chat/users", get(get_chat_users))
        .route("/chat/read/{user_id}", put(mark_read))
        .route("/chat/conversation/{user_id}", delete(delete_conversation))
        .route("/chat/search", get(search_messages))
        .route("/gateway", get(gateway_ws))
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(governor_layer),
        ))
}
