use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use alumnet_core::{ConversationKey, DisplayName, Email, Role, UserId};
use anyhow::anyhow;
use argon2::password_hash::rand_core::{OsRng, RngCore};
use pasetors::{keys::SymmetricKey, version4::V4};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::{mpsc, watch, OnceCell, RwLock};
use uuid::Uuid;

use super::auth::hash_password;

pub(crate) type ChatListeners = HashMap<Uuid, mpsc::Sender<String>>;

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 1_048_576;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 60;
pub const ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;
pub const DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW: u32 = 20;
pub const DEFAULT_GATEWAY_INGRESS_WINDOW_SECS: u64 = 10;
pub const DEFAULT_GATEWAY_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_MAX_GATEWAY_EVENT_BYTES: usize = alumnet_protocol::MAX_EVENT_BYTES;
pub(crate) const LOGIN_LOCK_THRESHOLD: u8 = 5;
pub(crate) const LOGIN_LOCK_SECS: i64 = 30;
pub(crate) const MAX_MESSAGE_CONTENT_CHARS: usize = 5000;
pub(crate) const DEFAULT_MESSAGE_PAGE_SIZE: usize = 50;
pub(crate) const MAX_MESSAGE_PAGE_SIZE: usize = 100;
pub(crate) const SEARCH_RESULT_LIMIT: usize = 50;
pub(crate) const CONVERSATION_SCAN_WINDOW: usize = 100;
pub(crate) const DEFAULT_CANDIDATE_PAGE_SIZE: usize = 20;
pub(crate) const MAX_CANDIDATE_PAGE_SIZE: usize = 100;
pub(crate) const METRICS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub(crate) static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: Mutex<HashMap<&'static str, u64>>,
    pub(crate) ws_disconnects: Mutex<HashMap<&'static str, u64>>,
    pub(crate) gateway_events_emitted: Mutex<HashMap<(&'static str, &'static str), u64>>,
    pub(crate) gateway_events_dropped:
        Mutex<HashMap<(&'static str, &'static str, &'static str), u64>>,
    pub(crate) gateway_events_parse_rejected: Mutex<HashMap<&'static str, u64>>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub gateway_ingress_events_per_window: u32,
    pub gateway_ingress_window: Duration,
    pub gateway_outbound_queue: usize,
    pub max_gateway_event_bytes: usize,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            gateway_ingress_events_per_window: DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW,
            gateway_ingress_window: Duration::from_secs(DEFAULT_GATEWAY_INGRESS_WINDOW_SECS),
            gateway_outbound_queue: DEFAULT_GATEWAY_OUTBOUND_QUEUE,
            max_gateway_event_bytes: DEFAULT_MAX_GATEWAY_EVENT_BYTES,
            database_url: None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) gateway_ingress_events_per_window: u32,
    pub(crate) gateway_ingress_window: Duration,
    pub(crate) gateway_outbound_queue: usize,
    pub(crate) max_gateway_event_bytes: usize,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) db_pool: Option<PgPool>,
    pub(crate) db_init: Arc<OnceCell<()>>,
    pub(crate) users: Arc<RwLock<HashMap<String, UserRecord>>>,
    pub(crate) user_emails: Arc<RwLock<HashMap<String, String>>>,
    pub(crate) messages: Arc<RwLock<Vec<MessageRecord>>>,
    pub(crate) sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    pub(crate) used_refresh_tokens: Arc<RwLock<HashMap<[u8; 32], String>>>,
    pub(crate) token_key: Arc<SymmetricKey<V4>>,
    pub(crate) dummy_password_hash: Arc<String>,
    pub(crate) connection_senders: Arc<RwLock<HashMap<Uuid, mpsc::Sender<String>>>>,
    pub(crate) connection_controls: Arc<RwLock<HashMap<Uuid, watch::Sender<ConnectionControl>>>>,
    pub(crate) connection_users: Arc<RwLock<HashMap<Uuid, UserId>>>,
    pub(crate) chat_subscriptions: Arc<RwLock<HashMap<String, ChatListeners>>>,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let mut key_bytes = [0_u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let token_key = SymmetricKey::<V4>::from(&key_bytes)
            .map_err(|e| anyhow!("token key init failed: {e}"))?;
        let dummy_password_hash = hash_password("alumnet-dummy-password")?;
        let db_pool = if let Some(database_url) = &config.database_url {
            Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect_lazy(database_url)
                    .map_err(|e| anyhow!("postgres pool init failed: {e}"))?,
            )
        } else {
            None
        };

        Ok(Self {
            db_pool,
            db_init: Arc::new(OnceCell::new()),
            users: Arc::new(RwLock::new(HashMap::new())),
            user_emails: Arc::new(RwLock::new(HashMap::new())),
            messages: Arc::new(RwLock::new(Vec::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            used_refresh_tokens: Arc::new(RwLock::new(HashMap::new())),
            token_key: Arc::new(token_key),
            dummy_password_hash: Arc::new(dummy_password_hash),
            connection_senders: Arc::new(RwLock::new(HashMap::new())),
            connection_controls: Arc::new(RwLock::new(HashMap::new())),
            connection_users: Arc::new(RwLock::new(HashMap::new())),
            chat_subscriptions: Arc::new(RwLock::new(HashMap::new())),
            runtime: Arc::new(RuntimeConfig {
                gateway_ingress_events_per_window: config.gateway_ingress_events_per_window,
                gateway_ingress_window: config.gateway_ingress_window,
                gateway_outbound_queue: config.gateway_outbound_queue,
                max_gateway_event_bytes: config.max_gateway_event_bytes,
            }),
        })
    }
}

/// Identity directory record. Keyed by email in the in-memory map; the
/// `user_emails` map resolves ids back to emails.
#[derive(Debug, Clone)]
pub(crate) struct UserRecord {
    pub(crate) id: UserId,
    pub(crate) name: DisplayName,
    pub(crate) email: Email,
    pub(crate) role: Role,
    pub(crate) password_hash: String,
    pub(crate) failed_logins: u8,
    pub(crate) locked_until_unix: Option<i64>,
    pub(crate) is_online: bool,
    pub(crate) last_seen_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct SessionRecord {
    pub(crate) user_id: UserId,
    pub(crate) refresh_token_hash: [u8; 32],
    pub(crate) expires_at_unix: i64,
    pub(crate) revoked: bool,
}

/// One persisted chat message. Immutable after creation except for
/// `is_read` (flipped by the receiver) and `deleted_by` (set by either
/// participant on archive).
#[derive(Debug, Clone)]
pub(crate) struct MessageRecord {
    pub(crate) id: String,
    pub(crate) conversation_key: ConversationKey,
    pub(crate) sender_id: UserId,
    pub(crate) receiver_id: UserId,
    pub(crate) content: String,
    pub(crate) is_read: bool,
    pub(crate) deleted_by: Option<UserId>,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct AuthContext {
    pub(crate) user_id: UserId,
    pub(crate) name: String,
    pub(crate) role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionControl {
    Open,
    Close,
}
