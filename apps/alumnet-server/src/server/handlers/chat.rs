use alumnet_core::{ConversationKey, UserId};
use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
};

use crate::server::{
    auth::authenticate,
    core::{
        AppState, DEFAULT_CANDIDATE_PAGE_SIZE, DEFAULT_MESSAGE_PAGE_SIZE, MAX_CANDIDATE_PAGE_SIZE,
        MAX_MESSAGE_PAGE_SIZE,
    },
    db::ensure_db_schema,
    directory::{list_chat_candidates, touch_presence, RoleFilter},
    errors::ChatFailure,
    gateway_events,
    realtime::broadcast_user_event,
    store::{
        append_message, archive_conversation, list_conversation_messages, list_conversations_for,
        mark_conversation_read, search_conversation,
    },
    types::{
        ArchiveResponse, CandidatesQuery, ChatCandidate, ChatUsersResponse, ConversationSummary,
        HistoryQuery, MarkReadResponse, MessageResponse, Pagination, SearchQuery,
        SendMessageRequest,
    },
};

fn parse_user_id(raw: &str) -> Result<UserId, ChatFailure> {
    UserId::try_from(raw.to_owned()).map_err(|_| ChatFailure::InvalidRequest)
}

fn page_window(
    page: Option<usize>,
    limit: Option<usize>,
    default_limit: usize,
    max_limit: usize,
) -> Result<(usize, usize), ChatFailure> {
    let page = page.unwrap_or(1);
    let limit = limit.unwrap_or(default_limit);
    if page == 0 || limit == 0 || limit > max_limit {
        return Err(ChatFailure::InvalidRequest);
    }
    Ok((page, limit))
}

/// Send a message: validate, persist, then push. The push is
/// fire-and-forget — the HTTP outcome reflects persistence alone, since
/// the message is already durable by the time delivery is attempted.
pub(crate) async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ChatFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let receiver_id = parse_user_id(&payload.receiver_id)?;

    let message = append_message(&state, &auth, receiver_id, &payload.content).await?;

    let event = gateway_events::new_message(&message);
    broadcast_user_event(&state, receiver_id, &event).await;

    if let Err(error) = touch_presence(&state, auth.user_id).await {
        tracing::warn!(event = "chat.presence.touch", user_id = %auth.user_id, %error);
    }

    Ok((StatusCode::CREATED, Json(message)))
}

/// One page of the conversation with the path user, oldest-first.
/// Fetching marks the requester's incoming messages read (documented
/// contract of the store, asserted by tests).
pub(crate) async fn get_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageResponse>>, ChatFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let partner_id = parse_user_id(&user_id)?;
    let (page, limit) = page_window(
        query.page,
        query.limit,
        DEFAULT_MESSAGE_PAGE_SIZE,
        MAX_MESSAGE_PAGE_SIZE,
    )?;

    let conversation_key = ConversationKey::derive(auth.user_id, partner_id);
    let messages =
        list_conversation_messages(&state, &conversation_key, auth.user_id, page, limit).await?;
    Ok(Json(messages))
}

pub(crate) async fn get_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, ChatFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let summaries = list_conversations_for(&state, auth.user_id).await?;
    Ok(Json(summaries))
}

pub(crate) async fn get_chat_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CandidatesQuery>,
) -> Result<Json<ChatUsersResponse>, ChatFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let role_filter = RoleFilter::parse(query.role.as_deref())?;
    let (page, limit) = page_window(
        query.page,
        query.limit,
        DEFAULT_CANDIDATE_PAGE_SIZE,
        MAX_CANDIDATE_PAGE_SIZE,
    )?;
    let search = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty());

    let (users, total) =
        list_chat_candidates(&state, auth.user_id, role_filter, search, page, limit).await?;

    Ok(Json(ChatUsersResponse {
        users: users
            .into_iter()
            .map(|user| ChatCandidate {
                user_id: user.id.to_string(),
                name: user.name,
                email: user.email,
                role: user.role,
                is_online: user.is_online,
                last_seen_unix: user.last_seen_unix,
            })
            .collect(),
        pagination: Pagination {
            page,
            limit,
            total,
            pages: total.div_ceil(limit),
        },
    }))
}

pub(crate) async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<MarkReadResponse>, ChatFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let partner_id = parse_user_id(&user_id)?;

    let conversation_key = ConversationKey::derive(auth.user_id, partner_id);
    let updated = mark_conversation_read(&state, &conversation_key, auth.user_id).await?;
    Ok(Json(MarkReadResponse { updated }))
}

pub(crate) async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<ArchiveResponse>, ChatFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let partner_id = parse_user_id(&user_id)?;

    let conversation_key = ConversationKey::derive(auth.user_id, partner_id);
    archive_conversation(&state, &conversation_key, auth.user_id).await?;
    Ok(Json(ArchiveResponse { archived: true }))
}

pub(crate) async fn search_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<MessageResponse>>, ChatFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let partner_id = parse_user_id(&query.user_id)?;

    let conversation_key = ConversationKey::derive(auth.user_id, partner_id);
    let messages = search_conversation(&state, &conversation_key, &query.query).await?;
    Ok(Json(messages))
}
