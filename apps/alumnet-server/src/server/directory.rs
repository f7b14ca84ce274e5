use alumnet_core::{DisplayName, Email, Role, UserId};
use sqlx::Row;

use super::{
    auth::{now_unix, verify_password},
    core::{AppState, UserRecord, LOGIN_LOCK_SECS, LOGIN_LOCK_THRESHOLD},
    errors::ChatFailure,
};

/// Directory view of a user, as consumed by the chat core. Presence
/// metadata rides along for candidate listings.
#[derive(Debug, Clone)]
pub(crate) struct DirectoryUser {
    pub(crate) id: UserId,
    pub(crate) name: String,
    pub(crate) email: String,
    pub(crate) role: Role,
    pub(crate) is_online: bool,
    pub(crate) last_seen_unix: i64,
}

/// Which roles a candidate listing should include. `All` deliberately
/// excludes admins: they are reachable by direct id only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoleFilter {
    All,
    Only(Role),
}

impl RoleFilter {
    pub(crate) fn parse(raw: Option<&str>) -> Result<Self, ChatFailure> {
        match raw {
            None => Ok(Self::Only(Role::Alumni)),
            Some("all") => Ok(Self::All),
            Some(value) => Role::try_from(value.to_owned())
                .map(Self::Only)
                .map_err(|_| ChatFailure::InvalidRequest),
        }
    }

    fn matches(self, role: Role) -> bool {
        match self {
            Self::All => matches!(role, Role::Student | Role::Alumni),
            Self::Only(role_filter) => role == role_filter,
        }
    }

    fn sql_roles(self) -> Vec<String> {
        match self {
            Self::All => vec![
                Role::Student.as_str().to_owned(),
                Role::Alumni.as_str().to_owned(),
            ],
            Self::Only(role) => vec![role.as_str().to_owned()],
        }
    }
}

fn directory_user_from_row(row: &sqlx::postgres::PgRow) -> Result<DirectoryUser, ChatFailure> {
    let id: String = row.try_get("user_id").map_err(|_| ChatFailure::Internal)?;
    let role: String = row.try_get("role").map_err(|_| ChatFailure::Internal)?;
    Ok(DirectoryUser {
        id: UserId::try_from(id).map_err(|_| ChatFailure::Internal)?,
        name: row.try_get("name").map_err(|_| ChatFailure::Internal)?,
        email: row.try_get("email").map_err(|_| ChatFailure::Internal)?,
        role: Role::try_from(role).map_err(|_| ChatFailure::Internal)?,
        is_online: row.try_get("is_online").map_err(|_| ChatFailure::Internal)?,
        last_seen_unix: row
            .try_get("last_seen_unix")
            .map_err(|_| ChatFailure::Internal)?,
    })
}

fn directory_user_from_record(record: &UserRecord) -> DirectoryUser {
    DirectoryUser {
        id: record.id,
        name: record.name.as_str().to_owned(),
        email: record.email.as_str().to_owned(),
        role: record.role,
        is_online: record.is_online,
        last_seen_unix: record.last_seen_unix,
    }
}

pub(crate) async fn find_user(
    state: &AppState,
    user_id: UserId,
) -> Result<Option<DirectoryUser>, ChatFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT user_id, name, email, role, is_online, last_seen_unix
             FROM users
             WHERE user_id = $1",
        )
        .bind(user_id.to_string())
        .fetch_optional(pool)
        .await
        .map_err(|_| ChatFailure::Internal)?;
        return row.as_ref().map(directory_user_from_row).transpose();
    }

    let emails = state.user_emails.read().await;
    let Some(email) = emails.get(&user_id.to_string()) else {
        return Ok(None);
    };
    let users = state.users.read().await;
    Ok(users.get(email).map(directory_user_from_record))
}

/// Create a user unless the email is already registered. Returns the new
/// id, or `None` on conflict so callers can stay enumeration-silent.
pub(crate) async fn create_user(
    state: &AppState,
    name: &DisplayName,
    email: &Email,
    role: Role,
    password_hash: &str,
) -> Result<Option<UserId>, ChatFailure> {
    let user_id = UserId::new();

    if let Some(pool) = &state.db_pool {
        let result = sqlx::query(
            "INSERT INTO users (user_id, name, email, role, password_hash, failed_logins,
                                locked_until_unix, is_online, last_seen_unix)
             VALUES ($1, $2, $3, $4, $5, 0, NULL, FALSE, $6)
             ON CONFLICT (email) DO NOTHING",
        )
        .bind(user_id.to_string())
        .bind(name.as_str())
        .bind(email.as_str())
        .bind(role.as_str())
        .bind(password_hash)
        .bind(now_unix())
        .execute(pool)
        .await
        .map_err(|_| ChatFailure::Internal)?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        return Ok(Some(user_id));
    }

    let mut users = state.users.write().await;
    if users.contains_key(email.as_str()) {
        return Ok(None);
    }
    users.insert(
        email.as_str().to_owned(),
        UserRecord {
            id: user_id,
            name: name.clone(),
            email: email.clone(),
            role,
            password_hash: password_hash.to_owned(),
            failed_logins: 0,
            locked_until_unix: None,
            is_online: false,
            last_seen_unix: now_unix(),
        },
    );
    drop(users);
    state
        .user_emails
        .write()
        .await
        .insert(user_id.to_string(), email.as_str().to_owned());
    Ok(Some(user_id))
}

/// Verify an email/password pair with lockout accounting. Unknown emails
/// burn a dummy verification so timing stays uniform.
pub(crate) async fn verify_credentials(
    state: &AppState,
    email: &Email,
    password: &str,
    now: i64,
) -> Result<Option<DirectoryUser>, ChatFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT user_id, name, email, role, password_hash, failed_logins, locked_until_unix,
                    is_online, last_seen_unix
             FROM users
             WHERE email = $1",
        )
        .bind(email.as_str())
        .fetch_optional(pool)
        .await
        .map_err(|_| ChatFailure::Internal)?;

        let Some(row) = row else {
            let _ = verify_password(&state.dummy_password_hash, password);
            return Ok(None);
        };

        let locked_until: Option<i64> = row
            .try_get("locked_until_unix")
            .map_err(|_| ChatFailure::Internal)?;
        if locked_until.is_some_and(|lock_until| lock_until > now) {
            return Ok(None);
        }

        let password_hash: String = row
            .try_get("password_hash")
            .map_err(|_| ChatFailure::Internal)?;
        if verify_password(&password_hash, password) {
            sqlx::query(
                "UPDATE users SET failed_logins = 0, locked_until_unix = NULL WHERE email = $1",
            )
            .bind(email.as_str())
            .execute(pool)
            .await
            .map_err(|_| ChatFailure::Internal)?;
            return directory_user_from_row(&row).map(Some);
        }

        let failed: i16 = row
            .try_get("failed_logins")
            .map_err(|_| ChatFailure::Internal)?;
        let failed = failed.saturating_add(1);
        if failed >= i16::from(LOGIN_LOCK_THRESHOLD) {
            sqlx::query(
                "UPDATE users SET failed_logins = 0, locked_until_unix = $2 WHERE email = $1",
            )
            .bind(email.as_str())
            .bind(now + LOGIN_LOCK_SECS)
            .execute(pool)
            .await
            .map_err(|_| ChatFailure::Internal)?;
        } else {
            sqlx::query("UPDATE users SET failed_logins = $2 WHERE email = $1")
                .bind(email.as_str())
                .bind(failed)
                .execute(pool)
                .await
                .map_err(|_| ChatFailure::Internal)?;
        }
        return Ok(None);
    }

    let mut users = state.users.write().await;
    let Some(user) = users.get_mut(email.as_str()) else {
        let _ = verify_password(&state.dummy_password_hash, password);
        return Ok(None);
    };

    if user
        .locked_until_unix
        .is_some_and(|lock_until| lock_until > now)
    {
        return Ok(None);
    }

    if verify_password(&user.password_hash, password) {
        user.failed_logins = 0;
        user.locked_until_unix = None;
        return Ok(Some(directory_user_from_record(user)));
    }

    user.failed_logins = user.failed_logins.saturating_add(1);
    if user.failed_logins >= LOGIN_LOCK_THRESHOLD {
        user.locked_until_unix = Some(now + LOGIN_LOCK_SECS);
        user.failed_logins = 0;
    }
    Ok(None)
}

/// Mark a user online and refresh their last-seen stamp. Send-message
/// calls this for the sender as a side effect.
pub(crate) async fn touch_presence(state: &AppState, user_id: UserId) -> Result<(), ChatFailure> {
    let now = now_unix();
    if let Some(pool) = &state.db_pool {
        sqlx::query("UPDATE users SET is_online = TRUE, last_seen_unix = $2 WHERE user_id = $1")
            .bind(user_id.to_string())
            .bind(now)
            .execute(pool)
            .await
            .map_err(|_| ChatFailure::Internal)?;
        return Ok(());
    }

    let emails = state.user_emails.read().await;
    let Some(email) = emails.get(&user_id.to_string()).cloned() else {
        return Ok(());
    };
    drop(emails);
    let mut users = state.users.write().await;
    if let Some(user) = users.get_mut(&email) {
        user.is_online = true;
        user.last_seen_unix = now;
    }
    Ok(())
}

/// Escape `\`, `%` and `_` so user input stays a literal in LIKE patterns.
pub(crate) fn like_pattern(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len() + 2);
    escaped.push('%');
    for c in fragment.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Page of chat candidates plus the total matching count: users of the
/// requested role, excluding the requester, optionally filtered by a
/// name/email substring, sorted online-first then by name.
pub(crate) async fn list_chat_candidates(
    state: &AppState,
    requester: UserId,
    role_filter: RoleFilter,
    search: Option<&str>,
    page: usize,
    limit: usize,
) -> Result<(Vec<DirectoryUser>, usize), ChatFailure> {
    let offset = page.saturating_sub(1).saturating_mul(limit);

    if let Some(pool) = &state.db_pool {
        let roles = role_filter.sql_roles();
        let pattern = search.map(like_pattern);
        let limit_i64 = i64::try_from(limit).map_err(|_| ChatFailure::InvalidRequest)?;
        let offset_i64 = i64::try_from(offset).map_err(|_| ChatFailure::InvalidRequest)?;

        let rows = sqlx::query(
            "SELECT user_id, name, email, role, is_online, last_seen_unix
             FROM users
             WHERE user_id <> $1
               AND role = ANY($2)
               AND ($3::text IS NULL OR name ILIKE $3 OR email ILIKE $3)
             ORDER BY is_online DESC, name ASC
             LIMIT $4 OFFSET $5",
        )
        .bind(requester.to_string())
        .bind(&roles)
        .bind(pattern.clone())
        .bind(limit_i64)
        .bind(offset_i64)
        .fetch_all(pool)
        .await
        .map_err(|_| ChatFailure::Internal)?;

        let mut users = Vec::with_capacity(rows.len());
        for row in &rows {
            users.push(directory_user_from_row(row)?);
        }

        let count_row = sqlx::query(
            "SELECT COUNT(*) AS total
             FROM users
             WHERE user_id <> $1
               AND role = ANY($2)
               AND ($3::text IS NULL OR name ILIKE $3 OR email ILIKE $3)",
        )
        .bind(requester.to_string())
        .bind(&roles)
        .bind(pattern)
        .fetch_one(pool)
        .await
        .map_err(|_| ChatFailure::Internal)?;
        let total: i64 = count_row
            .try_get("total")
            .map_err(|_| ChatFailure::Internal)?;
        let total = usize::try_from(total).map_err(|_| ChatFailure::Internal)?;
        return Ok((users, total));
    }

    let needle = search.map(str::to_lowercase);
    let users = state.users.read().await;
    let mut matching: Vec<DirectoryUser> = users
        .values()
        .filter(|user| user.id != requester)
        .filter(|user| role_filter.matches(user.role))
        .filter(|user| {
            needle.as_ref().is_none_or(|needle| {
                user.name.as_str().to_lowercase().contains(needle)
                    || user.email.as_str().contains(needle)
            })
        })
        .map(directory_user_from_record)
        .collect();
    drop(users);

    matching.sort_by(|a, b| {
        b.is_online
            .cmp(&a.is_online)
            .then_with(|| a.name.cmp(&b.name))
    });
    let total = matching.len();
    let paged = matching.into_iter().skip(offset).take(limit).collect();
    Ok((paged, total))
}
