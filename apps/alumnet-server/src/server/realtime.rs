use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use alumnet_core::{ConversationKey, UserId};
use alumnet_protocol::{parse_envelope, JOIN_CHAT_EVENT, TYPING_EVENT};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{
    auth::{authenticate_with_token, request_token},
    core::{AppState, AuthContext, ConnectionControl},
    errors::ChatFailure,
    gateway_events::{self, GatewayEvent},
    metrics::{
        record_gateway_event_dropped, record_gateway_event_emitted,
        record_gateway_event_parse_rejected, record_ws_disconnect,
    },
    types::{GatewayAuthQuery, GatewayJoinChat, GatewayTyping},
};

/// Upgrade handler. Authentication happens before the upgrade completes,
/// so an invalid token never reaches the event loop; the refusal is the
/// same generic 401 whether the token is missing, expired or malformed.
pub(crate) async fn gateway_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayAuthQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ChatFailure> {
    let token = query
        .access_token
        .or_else(|| request_token(&headers).map(ToOwned::to_owned))
        .ok_or(ChatFailure::Unauthorized)?;
    let auth = authenticate_with_token(&state, &token).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        handle_gateway_connection(state, socket, auth).await;
    }))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn handle_gateway_connection(
    state: AppState,
    socket: WebSocket,
    auth: AuthContext,
) {
    let connection_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let slow_consumer_disconnect = Arc::new(AtomicBool::new(false));

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.runtime.gateway_outbound_queue);
    state
        .connection_senders
        .write()
        .await
        .insert(connection_id, outbound_tx.clone());
    let (control_tx, mut control_rx) = watch::channel(ConnectionControl::Open);
    state
        .connection_controls
        .write()
        .await
        .insert(connection_id, control_tx);
    // Binding the connection to its user id is what joins the personal
    // delivery room: pushes address users, not connections.
    state
        .connection_users
        .write()
        .await
        .insert(connection_id, auth.user_id);
    tracing::debug!(event = "gateway.connect", user_id = %auth.user_id);

    let slow_consumer_disconnect_send = Arc::clone(&slow_consumer_disconnect);
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                control_change = control_rx.changed() => {
                    if control_change.is_ok() && *control_rx.borrow() == ConnectionControl::Close {
                        slow_consumer_disconnect_send.store(true, Ordering::Relaxed);
                        record_ws_disconnect("slow_consumer");
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1008,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        break;
                    }
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let mut ingress = VecDeque::new();
    let mut disconnect_reason = "connection_closed";
    while let Some(incoming) = stream.next().await {
        let Ok(message) = incoming else {
            disconnect_reason = "socket_error";
            break;
        };

        let payload: Vec<u8> = match message {
            Message::Text(text) => {
                if text.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                text.as_bytes().to_vec()
            }
            Message::Binary(bytes) => {
                if bytes.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                bytes.to_vec()
            }
            Message::Close(_) => {
                disconnect_reason = "client_close";
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !allow_gateway_ingress(
            &mut ingress,
            state.runtime.gateway_ingress_events_per_window,
            state.runtime.gateway_ingress_window,
        ) {
            disconnect_reason = "ingress_rate_limited";
            break;
        }

        let Ok(envelope) = parse_envelope(&payload) else {
            record_gateway_event_parse_rejected("invalid_envelope");
            disconnect_reason = "invalid_envelope";
            break;
        };

        match envelope.t.as_str() {
            JOIN_CHAT_EVENT => {
                let Ok(join) = serde_json::from_value::<GatewayJoinChat>(envelope.d) else {
                    record_gateway_event_parse_rejected("invalid_join_chat_payload");
                    disconnect_reason = "invalid_join_chat_payload";
                    break;
                };
                let Some(chat_key) = participant_chat_key(&join.chat_id, auth.user_id) else {
                    disconnect_reason = "forbidden_chat";
                    break;
                };
                add_chat_subscription(
                    &state,
                    connection_id,
                    chat_key.as_str().to_owned(),
                    outbound_tx.clone(),
                )
                .await;
            }
            TYPING_EVENT => {
                let Ok(typing) = serde_json::from_value::<GatewayTyping>(envelope.d) else {
                    record_gateway_event_parse_rejected("invalid_typing_payload");
                    disconnect_reason = "invalid_typing_payload";
                    break;
                };
                let Some(chat_key) = participant_chat_key(&typing.chat_id, auth.user_id) else {
                    disconnect_reason = "forbidden_chat";
                    break;
                };
                let event = gateway_events::typing(auth.user_id, typing.is_typing);
                broadcast_chat_event(&state, chat_key.as_str(), Some(connection_id), &event).await;
            }
            _ => {
                record_gateway_event_parse_rejected("unknown_event");
                disconnect_reason = "unknown_event";
                break;
            }
        }
    }

    if !slow_consumer_disconnect.load(Ordering::Relaxed) {
        record_ws_disconnect(disconnect_reason);
    }
    remove_connection(&state, connection_id).await;
    send_task.abort();
}

/// Parse a client-supplied chat id and require the authenticated user to
/// be one of its participants.
fn participant_chat_key(chat_id: &str, user_id: UserId) -> Option<ConversationKey> {
    let key = ConversationKey::try_from(chat_id.to_owned()).ok()?;
    key.includes(user_id).then_some(key)
}

pub(crate) async fn add_chat_subscription(
    state: &AppState,
    connection_id: Uuid,
    chat_key: String,
    outbound_tx: mpsc::Sender<String>,
) {
    let mut subscriptions = state.chat_subscriptions.write().await;
    subscriptions
        .entry(chat_key)
        .or_default()
        .insert(connection_id, outbound_tx);
}

pub(crate) async fn remove_connection(state: &AppState, connection_id: Uuid) {
    state.connection_users.write().await.remove(&connection_id);
    state
        .connection_controls
        .write()
        .await
        .remove(&connection_id);
    state
        .connection_senders
        .write()
        .await
        .remove(&connection_id);

    let mut subscriptions = state.chat_subscriptions.write().await;
    subscriptions.retain(|_, listeners| {
        listeners.remove(&connection_id);
        !listeners.is_empty()
    });
}

async fn close_slow_connections(state: &AppState, slow_connections: Vec<Uuid>) {
    if slow_connections.is_empty() {
        return;
    }

    let controls = state.connection_controls.read().await;
    for connection_id in slow_connections {
        if let Some(control) = controls.get(&connection_id) {
            let _ = control.send(ConnectionControl::Close);
        }
    }
}

/// Relay an event to every connection subscribed to a chat scope,
/// optionally excluding the originating connection (typing indicators
/// never echo back to the typist).
pub(crate) async fn broadcast_chat_event(
    state: &AppState,
    chat_key: &str,
    exclude: Option<Uuid>,
    event: &GatewayEvent,
) {
    let mut slow_connections = Vec::new();
    let mut delivered = 0_usize;
    let mut subscriptions = state.chat_subscriptions.write().await;
    if let Some(listeners) = subscriptions.get_mut(chat_key) {
        listeners.retain(|connection_id, sender| {
            if exclude == Some(*connection_id) {
                return true;
            }
            match sender.try_send(event.payload.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    record_gateway_event_dropped("chat", event.event_type, "closed");
                    false
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    record_gateway_event_dropped("chat", event.event_type, "full_queue");
                    slow_connections.push(*connection_id);
                    false
                }
            }
        });
        if listeners.is_empty() {
            subscriptions.remove(chat_key);
        }
    }
    drop(subscriptions);

    close_slow_connections(state, slow_connections).await;
    if delivered > 0 {
        tracing::debug!(
            event = "gateway.event.emit",
            scope = "chat",
            event_type = event.event_type,
            delivered
        );
        for _ in 0..delivered {
            record_gateway_event_emitted("chat", event.event_type);
        }
    }
}

/// Push an event to the personal room of one user: every live connection
/// authenticated as that user receives it. Fire-and-forget; with no live
/// connection the event is simply dropped and the receiver catches up by
/// fetching.
pub(crate) async fn broadcast_user_event(state: &AppState, user_id: UserId, event: &GatewayEvent) {
    let connection_ids: Vec<Uuid> = state
        .connection_users
        .read()
        .await
        .iter()
        .filter_map(|(connection_id, bound_user)| {
            (*bound_user == user_id).then_some(*connection_id)
        })
        .collect();
    if connection_ids.is_empty() {
        record_gateway_event_dropped("user", event.event_type, "no_connection");
        return;
    }

    let mut slow_connections = Vec::new();
    let mut delivered = 0_usize;
    let mut senders = state.connection_senders.write().await;
    for connection_id in connection_ids {
        let Some(sender) = senders.get(&connection_id) else {
            continue;
        };
        match sender.try_send(event.payload.clone()) {
            Ok(()) => delivered += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped("user", event.event_type, "closed");
                senders.remove(&connection_id);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped("user", event.event_type, "full_queue");
                slow_connections.push(connection_id);
                senders.remove(&connection_id);
            }
        }
    }
    drop(senders);

    close_slow_connections(state, slow_connections).await;
    if delivered > 0 {
        tracing::debug!(
            event = "gateway.event.emit",
            scope = "user",
            event_type = event.event_type,
            delivered
        );
        for _ in 0..delivered {
            record_gateway_event_emitted("user", event.event_type);
        }
    }
}

pub(crate) fn allow_gateway_ingress(
    ingress: &mut VecDeque<Instant>,
    limit: u32,
    window: Duration,
) -> bool {
    let now = Instant::now();
    while ingress
        .front()
        .is_some_and(|oldest| now.duration_since(*oldest) > window)
    {
        let _ = ingress.pop_front();
    }

    if ingress.len() >= limit as usize {
        return false;
    }

    ingress.push_back(now);
    true
}
