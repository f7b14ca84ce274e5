use alumnet_core::UserId;
use alumnet_protocol::{NEW_MESSAGE_EVENT, TYPING_EVENT};
use serde::Serialize;

use super::{auth::outbound_event, types::MessageResponse};

pub(crate) struct GatewayEvent {
    pub(crate) event_type: &'static str,
    pub(crate) payload: String,
}

fn build_event<T: Serialize>(event_type: &'static str, payload: T) -> GatewayEvent {
    GatewayEvent {
        event_type,
        payload: outbound_event(event_type, payload),
    }
}

#[derive(Serialize)]
struct TypingPayload {
    user_id: String,
    is_typing: bool,
}

pub(crate) fn new_message(message: &MessageResponse) -> GatewayEvent {
    build_event(NEW_MESSAGE_EVENT, message)
}

pub(crate) fn typing(user_id: UserId, is_typing: bool) -> GatewayEvent {
    build_event(
        TYPING_EVENT,
        TypingPayload {
            user_id: user_id.to_string(),
            is_typing,
        },
    )
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{new_message, typing, GatewayEvent};
    use crate::server::types::MessageResponse;
    use alumnet_core::UserId;

    fn parse_payload(event: &GatewayEvent) -> Value {
        let value: Value =
            serde_json::from_str(&event.payload).expect("gateway event payload should be valid");
        assert_eq!(value["v"], Value::from(1));
        assert_eq!(value["t"], Value::from(event.event_type));
        value["d"].clone()
    }

    #[test]
    fn new_message_event_carries_full_message() {
        let message = MessageResponse {
            message_id: String::from("m-1"),
            conversation_key: String::from("a_b"),
            sender_id: String::from("a"),
            receiver_id: String::from("b"),
            content: String::from("hello"),
            is_read: false,
            deleted_by: None,
            sender_name: String::from("Ada"),
            sender_role: Some(alumnet_core::Role::Alumni),
            created_at_unix: 42,
        };
        let payload = parse_payload(&new_message(&message));
        assert_eq!(payload["content"], "hello");
        assert_eq!(payload["sender_name"], "Ada");
        assert_eq!(payload["is_read"], false);
    }

    #[test]
    fn typing_event_identifies_the_typist() {
        let user_id = UserId::new();
        let payload = parse_payload(&typing(user_id, true));
        assert_eq!(payload["user_id"], Value::from(user_id.to_string()));
        assert_eq!(payload["is_typing"], Value::from(true));
    }
}
