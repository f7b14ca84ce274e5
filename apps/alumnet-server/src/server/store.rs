use std::collections::HashMap;

use alumnet_core::{ConversationKey, Role, UserId};
use sqlx::Row;
use ulid::Ulid;

use super::{
    auth::{normalize_message_content, now_unix},
    core::{
        AppState, AuthContext, MessageRecord, CONVERSATION_SCAN_WINDOW, SEARCH_RESULT_LIMIT,
    },
    directory::{find_user, like_pattern},
    errors::ChatFailure,
    types::{ConversationSummary, MessageResponse},
};

pub(crate) const PLACEHOLDER_DISPLAY_NAME: &str = "User";

fn message_from_joined_row(row: &sqlx::postgres::PgRow) -> Result<MessageResponse, ChatFailure> {
    let sender_name: Option<String> = row
        .try_get("sender_name")
        .map_err(|_| ChatFailure::Internal)?;
    let sender_role: Option<String> = row
        .try_get("sender_role")
        .map_err(|_| ChatFailure::Internal)?;
    Ok(MessageResponse {
        message_id: row
            .try_get("message_id")
            .map_err(|_| ChatFailure::Internal)?,
        conversation_key: row
            .try_get("conversation_key")
            .map_err(|_| ChatFailure::Internal)?,
        sender_id: row.try_get("sender_id").map_err(|_| ChatFailure::Internal)?,
        receiver_id: row
            .try_get("receiver_id")
            .map_err(|_| ChatFailure::Internal)?,
        content: row.try_get("content").map_err(|_| ChatFailure::Internal)?,
        is_read: row.try_get("is_read").map_err(|_| ChatFailure::Internal)?,
        deleted_by: row
            .try_get("deleted_by")
            .map_err(|_| ChatFailure::Internal)?,
        sender_name: sender_name.unwrap_or_else(|| String::from(PLACEHOLDER_DISPLAY_NAME)),
        sender_role: sender_role.and_then(|role| Role::try_from(role).ok()),
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ChatFailure::Internal)?,
    })
}

fn message_record_from_row(row: &sqlx::postgres::PgRow) -> Result<MessageRecord, ChatFailure> {
    let conversation_key: String = row
        .try_get("conversation_key")
        .map_err(|_| ChatFailure::Internal)?;
    let sender_id: String = row.try_get("sender_id").map_err(|_| ChatFailure::Internal)?;
    let receiver_id: String = row
        .try_get("receiver_id")
        .map_err(|_| ChatFailure::Internal)?;
    let deleted_by: Option<String> = row
        .try_get("deleted_by")
        .map_err(|_| ChatFailure::Internal)?;
    Ok(MessageRecord {
        id: row
            .try_get("message_id")
            .map_err(|_| ChatFailure::Internal)?,
        conversation_key: ConversationKey::try_from(conversation_key)
            .map_err(|_| ChatFailure::Internal)?,
        sender_id: UserId::try_from(sender_id).map_err(|_| ChatFailure::Internal)?,
        receiver_id: UserId::try_from(receiver_id).map_err(|_| ChatFailure::Internal)?,
        content: row.try_get("content").map_err(|_| ChatFailure::Internal)?,
        is_read: row.try_get("is_read").map_err(|_| ChatFailure::Internal)?,
        deleted_by: deleted_by
            .map(UserId::try_from)
            .transpose()
            .map_err(|_| ChatFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ChatFailure::Internal)?,
    })
}

/// Display map for in-memory joins: user id -> (name, role).
async fn sender_display_map(state: &AppState) -> HashMap<String, (String, Role)> {
    let users = state.users.read().await;
    users
        .values()
        .map(|user| {
            (
                user.id.to_string(),
                (user.name.as_str().to_owned(), user.role),
            )
        })
        .collect()
}

fn message_response_from_record(
    record: &MessageRecord,
    display: &HashMap<String, (String, Role)>,
) -> MessageResponse {
    let sender_id = record.sender_id.to_string();
    let (sender_name, sender_role) = display.get(&sender_id).map_or_else(
        || (String::from(PLACEHOLDER_DISPLAY_NAME), None),
        |(name, role)| (name.clone(), Some(*role)),
    );
    MessageResponse {
        message_id: record.id.clone(),
        conversation_key: record.conversation_key.as_str().to_owned(),
        sender_id,
        receiver_id: record.receiver_id.to_string(),
        content: record.content.clone(),
        is_read: record.is_read,
        deleted_by: record.deleted_by.map(|id| id.to_string()),
        sender_name,
        sender_role,
        created_at_unix: record.created_at_unix,
    }
}

/// Newest-first ordering: creation time, then id (ULIDs are themselves
/// time-ordered, which keeps pagination stable across equal timestamps).
fn sort_newest_first(records: &mut [MessageRecord]) {
    records.sort_by(|a, b| {
        b.created_at_unix
            .cmp(&a.created_at_unix)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Persist one message after validating the receiver and content.
/// The stored row is returned with the sender's display fields joined in.
pub(crate) async fn append_message(
    state: &AppState,
    sender: &AuthContext,
    receiver_id: UserId,
    content: &str,
) -> Result<MessageResponse, ChatFailure> {
    let content = normalize_message_content(content)?;
    find_user(state, receiver_id)
        .await?
        .ok_or(ChatFailure::NotFound)?;

    let conversation_key = ConversationKey::derive(sender.user_id, receiver_id);
    let message_id = Ulid::new().to_string();
    let created_at_unix = now_unix();

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "INSERT INTO messages (message_id, conversation_key, sender_id, receiver_id, content,
                                   is_read, deleted_by, created_at_unix)
             VALUES ($1, $2, $3, $4, $5, FALSE, NULL, $6)",
        )
        .bind(&message_id)
        .bind(conversation_key.as_str())
        .bind(sender.user_id.to_string())
        .bind(receiver_id.to_string())
        .bind(&content)
        .bind(created_at_unix)
        .execute(pool)
        .await
        .map_err(|e| {
            if matches!(e, sqlx::Error::Database(_)) {
                ChatFailure::NotFound
            } else {
                ChatFailure::Internal
            }
        })?;
    } else {
        let record = MessageRecord {
            id: message_id.clone(),
            conversation_key: conversation_key.clone(),
            sender_id: sender.user_id,
            receiver_id,
            content: content.clone(),
            is_read: false,
            deleted_by: None,
            created_at_unix,
        };
        state.messages.write().await.push(record);
    }

    Ok(MessageResponse {
        message_id,
        conversation_key: conversation_key.as_str().to_owned(),
        sender_id: sender.user_id.to_string(),
        receiver_id: receiver_id.to_string(),
        content,
        is_read: false,
        deleted_by: None,
        sender_name: sender.name.clone(),
        sender_role: Some(sender.role),
        created_at_unix,
    })
}

/// One page of a conversation, oldest-first for chronological reading.
///
/// Contract: fetching also marks every message in the conversation that
/// is addressed to `reader` as read. The returned page reflects the
/// read-state as stored before this call.
pub(crate) async fn list_conversation_messages(
    state: &AppState,
    conversation_key: &ConversationKey,
    reader: UserId,
    page: usize,
    limit: usize,
) -> Result<Vec<MessageResponse>, ChatFailure> {
    let offset = page.saturating_sub(1).saturating_mul(limit);

    let mut messages = if let Some(pool) = &state.db_pool {
        let limit_i64 = i64::try_from(limit).map_err(|_| ChatFailure::InvalidRequest)?;
        let offset_i64 = i64::try_from(offset).map_err(|_| ChatFailure::InvalidRequest)?;
        let rows = sqlx::query(
            "SELECT m.message_id, m.conversation_key, m.sender_id, m.receiver_id, m.content,
                    m.is_read, m.deleted_by, m.created_at_unix,
                    u.name AS sender_name, u.role AS sender_role
             FROM messages m
             LEFT JOIN users u ON u.user_id = m.sender_id
             WHERE m.conversation_key = $1
             ORDER BY m.created_at_unix DESC, m.message_id DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(conversation_key.as_str())
        .bind(limit_i64)
        .bind(offset_i64)
        .fetch_all(pool)
        .await
        .map_err(|_| ChatFailure::Internal)?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            messages.push(message_from_joined_row(row)?);
        }
        messages
    } else {
        let mut records: Vec<MessageRecord> = {
            let all = state.messages.read().await;
            all.iter()
                .filter(|record| &record.conversation_key == conversation_key)
                .cloned()
                .collect()
        };
        sort_newest_first(&mut records);
        let display = sender_display_map(state).await;
        records
            .iter()
            .skip(offset)
            .take(limit)
            .map(|record| message_response_from_record(record, &display))
            .collect()
    };

    mark_conversation_read(state, conversation_key, reader).await?;

    messages.reverse();
    Ok(messages)
}

/// Mark every unread message addressed to `reader` in this conversation
/// as read. Idempotent; returns the number of rows that flipped.
pub(crate) async fn mark_conversation_read(
    state: &AppState,
    conversation_key: &ConversationKey,
    reader: UserId,
) -> Result<u64, ChatFailure> {
    if let Some(pool) = &state.db_pool {
        let result = sqlx::query(
            "UPDATE messages SET is_read = TRUE
             WHERE conversation_key = $1 AND receiver_id = $2 AND is_read = FALSE",
        )
        .bind(conversation_key.as_str())
        .bind(reader.to_string())
        .execute(pool)
        .await
        .map_err(|_| ChatFailure::Internal)?;
        return Ok(result.rows_affected());
    }

    let mut updated = 0_u64;
    let mut messages = state.messages.write().await;
    for record in messages.iter_mut() {
        if &record.conversation_key == conversation_key
            && record.receiver_id == reader
            && !record.is_read
        {
            record.is_read = true;
            updated += 1;
        }
    }
    Ok(updated)
}

/// Archive a conversation for `requester` by stamping `deleted_by` on
/// every message. Purely advisory: no read path filters on the flag, so
/// the history stays visible to both participants.
pub(crate) async fn archive_conversation(
    state: &AppState,
    conversation_key: &ConversationKey,
    requester: UserId,
) -> Result<(), ChatFailure> {
    if let Some(pool) = &state.db_pool {
        sqlx::query("UPDATE messages SET deleted_by = $2 WHERE conversation_key = $1")
            .bind(conversation_key.as_str())
            .bind(requester.to_string())
            .execute(pool)
            .await
            .map_err(|_| ChatFailure::Internal)?;
        return Ok(());
    }

    let mut messages = state.messages.write().await;
    for record in messages.iter_mut() {
        if &record.conversation_key == conversation_key {
            record.deleted_by = Some(requester);
        }
    }
    Ok(())
}

/// Case-insensitive substring search within one conversation,
/// newest-first, capped at [`SEARCH_RESULT_LIMIT`] hits.
pub(crate) async fn search_conversation(
    state: &AppState,
    conversation_key: &ConversationKey,
    query: &str,
) -> Result<Vec<MessageResponse>, ChatFailure> {
    let query = query.trim();
    if query.is_empty() {
        return Err(ChatFailure::InvalidRequest);
    }

    if let Some(pool) = &state.db_pool {
        let limit = i64::try_from(SEARCH_RESULT_LIMIT).map_err(|_| ChatFailure::Internal)?;
        let rows = sqlx::query(
            "SELECT m.message_id, m.conversation_key, m.sender_id, m.receiver_id, m.content,
                    m.is_read, m.deleted_by, m.created_at_unix,
                    u.name AS sender_name, u.role AS sender_role
             FROM messages m
             LEFT JOIN users u ON u.user_id = m.sender_id
             WHERE m.conversation_key = $1 AND m.content ILIKE $2
             ORDER BY m.created_at_unix DESC, m.message_id DESC
             LIMIT $3",
        )
        .bind(conversation_key.as_str())
        .bind(like_pattern(query))
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|_| ChatFailure::Internal)?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            messages.push(message_from_joined_row(row)?);
        }
        return Ok(messages);
    }

    let needle = query.to_lowercase();
    let mut records: Vec<MessageRecord> = {
        let all = state.messages.read().await;
        all.iter()
            .filter(|record| &record.conversation_key == conversation_key)
            .filter(|record| record.content.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    };
    sort_newest_first(&mut records);
    records.truncate(SEARCH_RESULT_LIMIT);
    let display = sender_display_map(state).await;
    Ok(records
        .iter()
        .map(|record| message_response_from_record(record, &display))
        .collect())
}

/// Group a newest-first message window into per-partner summaries.
///
/// The first message seen for a key is the conversation's most recent
/// one; unread counting covers every scanned message addressed to
/// `user_id`. Insertion order doubles as the recency ordering.
pub(crate) fn summarize_conversations(
    user_id: UserId,
    newest_first: &[MessageRecord],
) -> Vec<ConversationSummary> {
    let mut index_by_key: HashMap<&str, usize> = HashMap::new();
    let mut summaries: Vec<ConversationSummary> = Vec::new();

    for record in newest_first {
        let key = record.conversation_key.as_str();
        let unread = u64::from(record.receiver_id == user_id && !record.is_read);
        if let Some(&index) = index_by_key.get(key) {
            summaries[index].unread_count += unread;
            continue;
        }

        let partner_id = if record.sender_id == user_id {
            record.receiver_id
        } else {
            record.sender_id
        };
        index_by_key.insert(key, summaries.len());
        summaries.push(ConversationSummary {
            conversation_key: key.to_owned(),
            partner_id: partner_id.to_string(),
            partner_name: String::from(PLACEHOLDER_DISPLAY_NAME),
            partner_role: None,
            last_message: record.content.clone(),
            last_message_at_unix: record.created_at_unix,
            unread_count: unread,
        });
    }

    summaries
}

/// The most recent messages the user participates in, newest-first,
/// bounded by [`CONVERSATION_SCAN_WINDOW`].
async fn recent_messages_for_user(
    state: &AppState,
    user_id: UserId,
) -> Result<Vec<MessageRecord>, ChatFailure> {
    if let Some(pool) = &state.db_pool {
        let limit = i64::try_from(CONVERSATION_SCAN_WINDOW).map_err(|_| ChatFailure::Internal)?;
        let rows = sqlx::query(
            "SELECT message_id, conversation_key, sender_id, receiver_id, content,
                    is_read, deleted_by, created_at_unix
             FROM messages
             WHERE sender_id = $1 OR receiver_id = $1
             ORDER BY created_at_unix DESC, message_id DESC
             LIMIT $2",
        )
        .bind(user_id.to_string())
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|_| ChatFailure::Internal)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(message_record_from_row(row)?);
        }
        return Ok(records);
    }

    let mut records: Vec<MessageRecord> = {
        let all = state.messages.read().await;
        all.iter()
            .filter(|record| record.sender_id == user_id || record.receiver_id == user_id)
            .cloned()
            .collect()
    };
    sort_newest_first(&mut records);
    records.truncate(CONVERSATION_SCAN_WINDOW);
    Ok(records)
}

/// Conversation summaries for a user, most recent first. Partner names
/// resolve through the directory best-effort: an unresolved partner
/// keeps the raw id and the placeholder name instead of failing the
/// whole listing.
pub(crate) async fn list_conversations_for(
    state: &AppState,
    user_id: UserId,
) -> Result<Vec<ConversationSummary>, ChatFailure> {
    let recent = recent_messages_for_user(state, user_id).await?;
    let mut summaries = summarize_conversations(user_id, &recent);

    for summary in &mut summaries {
        let Ok(partner_id) = UserId::try_from(summary.partner_id.clone()) else {
            continue;
        };
        match find_user(state, partner_id).await {
            Ok(Some(partner)) => {
                summary.partner_name = partner.name;
                summary.partner_role = Some(partner.role);
            }
            Ok(None) | Err(_) => {}
        }
    }

    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use alumnet_core::{ConversationKey, UserId};

    use super::{summarize_conversations, PLACEHOLDER_DISPLAY_NAME};
    use crate::server::core::MessageRecord;

    fn record(
        sender: UserId,
        receiver: UserId,
        content: &str,
        is_read: bool,
        created_at_unix: i64,
    ) -> MessageRecord {
        MessageRecord {
            id: ulid::Ulid::new().to_string(),
            conversation_key: ConversationKey::derive(sender, receiver),
            sender_id: sender,
            receiver_id: receiver,
            content: String::from(content),
            is_read,
            deleted_by: None,
            created_at_unix,
        }
    }

    #[test]
    fn summaries_group_by_partner_and_keep_recency_order() {
        let me = UserId::new();
        let partner_a = UserId::new();
        let partner_b = UserId::new();
        // Newest-first window: B's reply, then my message to B, then A's.
        let window = vec![
            record(partner_b, me, "see you then", false, 30),
            record(me, partner_b, "lunch?", true, 20),
            record(partner_a, me, "hello", false, 10),
        ];

        let summaries = summarize_conversations(me, &window);
        assert_eq!(summaries.len(), 2);

        assert_eq!(summaries[0].partner_id, partner_b.to_string());
        assert_eq!(summaries[0].last_message, "see you then");
        assert_eq!(summaries[0].last_message_at_unix, 30);
        assert_eq!(summaries[0].unread_count, 1);

        assert_eq!(summaries[1].partner_id, partner_a.to_string());
        assert_eq!(summaries[1].last_message, "hello");
        assert_eq!(summaries[1].unread_count, 1);
    }

    #[test]
    fn unread_counts_only_messages_addressed_to_the_user() {
        let me = UserId::new();
        let partner = UserId::new();
        let window = vec![
            record(partner, me, "three", false, 30),
            record(partner, me, "two", false, 20),
            record(me, partner, "one", false, 10),
        ];

        let summaries = summarize_conversations(me, &window);
        assert_eq!(summaries.len(), 1);
        // My own unread message to the partner does not count against me.
        assert_eq!(summaries[0].unread_count, 2);
        assert_eq!(summaries[0].partner_name, PLACEHOLDER_DISPLAY_NAME);
    }

    #[test]
    fn self_conversation_reports_self_as_partner() {
        let me = UserId::new();
        let window = vec![record(me, me, "note to self", false, 5)];

        let summaries = summarize_conversations(me, &window);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].partner_id, me.to_string());
    }

    #[test]
    fn empty_window_yields_no_summaries() {
        assert!(summarize_conversations(UserId::new(), &[]).is_empty());
    }
}
