use alumnet_core::Role;
use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{core::METRICS_TEXT_CONTENT_TYPE, metrics::render_metrics};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn metrics() -> Response {
    (
        [(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)],
        render_metrics(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) error: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RegisterRequest {
    pub(crate) name: String,
    pub(crate) email: String,
    pub(crate) password: String,
    pub(crate) role: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RegisterResponse {
    pub(crate) accepted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoginRequest {
    pub(crate) email: String,
    pub(crate) password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RefreshRequest {
    pub(crate) refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AuthResponse {
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
    pub(crate) expires_in_secs: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct MeResponse {
    pub(crate) user_id: String,
    pub(crate) name: String,
    pub(crate) email: String,
    pub(crate) role: Role,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SendMessageRequest {
    pub(crate) receiver_id: String,
    pub(crate) content: String,
}

/// One message as delivered to clients, sender display fields joined in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessageResponse {
    pub(crate) message_id: String,
    pub(crate) conversation_key: String,
    pub(crate) sender_id: String,
    pub(crate) receiver_id: String,
    pub(crate) content: String,
    pub(crate) is_read: bool,
    pub(crate) deleted_by: Option<String>,
    pub(crate) sender_name: String,
    pub(crate) sender_role: Option<Role>,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    pub(crate) page: Option<usize>,
    pub(crate) limit: Option<usize>,
}

/// Aggregated, non-persisted view of one conversation's latest state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ConversationSummary {
    pub(crate) conversation_key: String,
    pub(crate) partner_id: String,
    pub(crate) partner_name: String,
    pub(crate) partner_role: Option<Role>,
    pub(crate) last_message: String,
    pub(crate) last_message_at_unix: i64,
    pub(crate) unread_count: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CandidatesQuery {
    pub(crate) role: Option<String>,
    pub(crate) search: Option<String>,
    pub(crate) page: Option<usize>,
    pub(crate) limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatCandidate {
    pub(crate) user_id: String,
    pub(crate) name: String,
    pub(crate) email: String,
    pub(crate) role: Role,
    pub(crate) is_online: bool,
    pub(crate) last_seen_unix: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Pagination {
    pub(crate) page: usize,
    pub(crate) limit: usize,
    pub(crate) total: usize,
    pub(crate) pages: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ChatUsersResponse {
    pub(crate) users: Vec<ChatCandidate>,
    pub(crate) pagination: Pagination,
}

#[derive(Debug, Serialize)]
pub(crate) struct MarkReadResponse {
    pub(crate) updated: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ArchiveResponse {
    pub(crate) archived: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchQuery {
    pub(crate) query: String,
    pub(crate) user_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayAuthQuery {
    pub(crate) access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewayJoinChat {
    pub(crate) chat_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewayTyping {
    pub(crate) chat_id: String,
    pub(crate) is_typing: bool,
}
