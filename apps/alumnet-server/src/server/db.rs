use super::{core::AppState, errors::ChatFailure};

const CREATE_USERS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS users (
                    user_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    email TEXT UNIQUE NOT NULL,
                    role TEXT NOT NULL,
                    password_hash TEXT NOT NULL,
                    failed_logins SMALLINT NOT NULL DEFAULT 0,
                    locked_until_unix BIGINT NULL,
                    is_online BOOLEAN NOT NULL DEFAULT FALSE,
                    last_seen_unix BIGINT NOT NULL DEFAULT 0
                )";
const CREATE_MESSAGES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT PRIMARY KEY,
                    conversation_key TEXT NOT NULL,
                    sender_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    receiver_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    content TEXT NOT NULL,
                    is_read BOOLEAN NOT NULL DEFAULT FALSE,
                    deleted_by TEXT NULL,
                    created_at_unix BIGINT NOT NULL
                )";
const CREATE_MESSAGES_CONVERSATION_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
                    ON messages(conversation_key, created_at_unix DESC)";
const CREATE_MESSAGES_PARTICIPANT_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_participant_created
                    ON messages(sender_id, receiver_id, created_at_unix DESC)";
const CREATE_MESSAGES_RECEIVER_UNREAD_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_receiver_unread
                    ON messages(receiver_id) WHERE is_read = FALSE";
const CREATE_USERS_ROLE_NAME_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_users_role_online_name
                    ON users(role, is_online DESC, name ASC)";

/// Create tables and indexes once per process. A pg advisory lock keeps
/// concurrent replicas from racing the DDL.
pub(crate) async fn ensure_db_schema(state: &AppState) -> Result<(), ChatFailure> {
    const SCHEMA_INIT_LOCK_ID: i64 = 0x414c_554d_4e45_5431;
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };

    state
        .db_init
        .get_or_try_init(|| async move {
            let mut tx = pool.begin().await?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(SCHEMA_INIT_LOCK_ID)
                .execute(&mut *tx)
                .await?;

            for statement in [
                CREATE_USERS_TABLE_SQL,
                CREATE_MESSAGES_TABLE_SQL,
                CREATE_MESSAGES_CONVERSATION_INDEX_SQL,
                CREATE_MESSAGES_PARTICIPANT_INDEX_SQL,
                CREATE_MESSAGES_RECEIVER_UNREAD_INDEX_SQL,
                CREATE_USERS_ROLE_NAME_INDEX_SQL,
            ] {
                sqlx::query(statement).execute(&mut *tx).await?;
            }

            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|_| ChatFailure::Internal)?;
    Ok(())
}
