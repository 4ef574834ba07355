use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One chat message. Fields beyond `role` and `content` ride along in
/// `extra` so provider-specific extensions survive the rewrite.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            extra: Map::new(),
        }
    }
}

/// Policy-configured messages come first, user messages after, both in
/// their original order.
pub(crate) fn combine_messages(
    model_messages: &[Message],
    user_messages: &[Message],
) -> Vec<Message> {
    let mut out = Vec::with_capacity(model_messages.len() + user_messages.len());
    out.extend_from_slice(model_messages);
    out.extend_from_slice(user_messages);
    out
}

/// Pulls the `messages` array out of a chat-completion payload. `None`
/// when the payload is not JSON, has no `messages` field, or the array
/// does not hold role/content objects.
pub(crate) fn extract_messages(payload: &[u8]) -> Option<Vec<Message>> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let messages = value.get("messages")?.clone();
    serde_json::from_value(messages).ok()
}

/// The `model` string from a chat-completion payload, if present.
pub(crate) fn extract_model(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value.get("model")?.as_str().map(str::to_owned)
}

/// The full payload as a JSON object, or an empty object when the
/// payload is absent or malformed.
pub(crate) fn extract_envelope(payload: &[u8]) -> Map<String, Value> {
    serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn combines_model_and_user_messages_in_order() {
        let model_messages = vec![Message::new("system", "You are a helpful assistant")];
        let user_messages = vec![
            Message::new("user", "Hello"),
            Message::new("assistant", "Hi there"),
        ];
        let combined = combine_messages(&model_messages, &user_messages);
        assert_eq!(
            combined,
            vec![
                Message::new("system", "You are a helpful assistant"),
                Message::new("user", "Hello"),
                Message::new("assistant", "Hi there"),
            ]
        );
    }

    #[test]
    fn combines_multiple_model_messages_before_user_messages() {
        let model_messages = vec![
            Message::new("system", "You are a helpful assistant"),
            Message::new("system", "Respond in English"),
        ];
        let user_messages = vec![Message::new("user", "Hello")];
        let combined = combine_messages(&model_messages, &user_messages);
        assert_eq!(combined.len(), 3);
        assert_eq!(combined[1].content, "Respond in English");
        assert_eq!(combined[2].role, "user");
    }

    #[test]
    fn combine_handles_empty_sides() {
        let user_messages = vec![Message::new("user", "Hello")];
        assert_eq!(combine_messages(&[], &user_messages), user_messages);
        let model_messages = vec![Message::new("system", "Prefix")];
        assert_eq!(combine_messages(&model_messages, &[]), model_messages);
        assert!(combine_messages(&[], &[]).is_empty());
    }

    #[test]
    fn extracts_messages_from_valid_payload() {
        let payload = json!({
            "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": "Hi there"}
            ]
        })
        .to_string();
        let messages = extract_messages(payload.as_bytes()).expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].content, "Hi there");
    }

    #[test]
    fn extracts_empty_messages_array() {
        let messages = extract_messages(br#"{"messages": []}"#).expect("messages");
        assert!(messages.is_empty());
    }

    #[test]
    fn extraction_rejects_invalid_payloads() {
        assert_eq!(extract_messages(b"{invalid json}"), None);
        assert_eq!(extract_messages(br#"{"other": "field"}"#), None);
        assert_eq!(
            extract_messages(br#"{"messages": [{"role": "user"}]}"#),
            None
        );
    }

    #[test]
    fn extraction_keeps_unknown_message_fields() {
        let payload = json!({
            "messages": [{"role": "user", "content": "Hi", "name": "alice"}]
        })
        .to_string();
        let messages = extract_messages(payload.as_bytes()).expect("messages");
        assert_eq!(messages[0].extra["name"], "alice");
    }

    #[test]
    fn extracts_model_when_present() {
        let payload = br#"{"model": "gpt-4", "messages": []}"#;
        assert_eq!(extract_model(payload).as_deref(), Some("gpt-4"));
    }

    #[test]
    fn model_extraction_tolerates_odd_payloads() {
        assert_eq!(extract_model(br#"{"messages": []}"#), None);
        assert_eq!(extract_model(b"{invalid json}"), None);
        assert_eq!(extract_model(br#"{"model": 123}"#), None);
        assert_eq!(extract_model(b""), None);
    }

    #[test]
    fn envelope_of_malformed_payload_is_empty() {
        assert!(extract_envelope(b"{invalid").is_empty());
        let envelope = extract_envelope(br#"{"model":"gpt-4","temperature":0.2}"#);
        assert_eq!(envelope["temperature"], 0.2);
    }
}
