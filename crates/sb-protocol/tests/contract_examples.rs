//! Contract golden tests: parse representative JSON frames, serialize back,
//! and verify round-trip fidelity of the frozen wire shapes.

use sb_protocol::{ChatMessage, MessageType, SystemFrame};

/// Parse, re-serialize, re-parse, and compare JSON structure.
fn round_trip_message(json_text: &str) -> ChatMessage {
    let value: ChatMessage = serde_json::from_str(json_text)
        .unwrap_or_else(|e| panic!("failed to deserialize: {e}\nJSON: {json_text}"));
    let serialized = serde_json::to_string(&value).expect("serialize");
    let reparsed: ChatMessage = serde_json::from_str(&serialized).expect("re-deserialize");
    assert_eq!(value, reparsed, "round-trip mismatch for {json_text}");
    value
}

#[test]
fn full_message_round_trip() {
    let msg = round_trip_message(
        r#"{
            "id": "4f1c9a6e-0000-0000-0000-000000000000",
            "session_id": "algo-101",
            "type": "inbox_response",
            "context": "general",
            "from_user": "teach",
            "to_user": "alice",
            "content": {"text": "hello"},
            "timestamp": "2026-03-01T12:00:00Z"
        }"#,
    );
    assert_eq!(msg.kind, MessageType::InboxResponse);
    assert_eq!(msg.to_user.as_deref(), Some("alice"));
    assert!(msg.timestamp.is_some());
}

#[test]
fn minimal_client_message_parses_with_defaults() {
    // Clients may omit everything the server overrides.
    let msg = round_trip_message(r#"{"type": "instructor_inbox", "content": {"text": "hi"}}"#);
    assert_eq!(msg.kind, MessageType::InstructorInbox);
    assert!(msg.id.is_empty());
    assert!(msg.session_id.is_empty());
    assert!(msg.from_user.is_empty());
    assert!(msg.to_user.is_none());
    assert!(msg.timestamp.is_none());
    assert!(msg.context.is_empty());
}

#[test]
fn unknown_type_is_rejected() {
    let result = serde_json::from_str::<ChatMessage>(
        r#"{"type": "shoutbox", "content": {}}"#,
    );
    assert!(result.is_err(), "unknown message type must not parse");
}

#[test]
fn missing_type_is_rejected() {
    let result = serde_json::from_str::<ChatMessage>(r#"{"content": {}}"#);
    assert!(result.is_err(), "type field is mandatory");
}

#[test]
fn system_type_is_not_a_client_message() {
    // "system" is reserved for server frames and must not round-trip as a
    // routable message kind.
    let result = serde_json::from_str::<ChatMessage>(r#"{"type": "system", "content": {}}"#);
    assert!(result.is_err());
}

#[test]
fn fanout_message_omits_to_user_when_absent() {
    let msg = round_trip_message(r#"{"type": "instructor_broadcast", "content": {"n": 1}}"#);
    let serialized = serde_json::to_string(&msg).unwrap();
    assert!(
        !serialized.contains("to_user"),
        "absent recipient must not serialize: {serialized}"
    );
}

#[test]
fn system_frame_shape() {
    let frame = SystemFrame::history_complete();
    let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["type"], "system");
    assert_eq!(json["context"], "history_complete");
    assert_eq!(json["content"]["event"], "history_complete");
    assert!(json["timestamp"].is_string());
}

#[test]
fn error_frame_carries_code_and_message() {
    let frame = SystemFrame::error(sb_protocol::error_codes::RATE_LIMITED, "rate limit exceeded");
    let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["context"], "error");
    assert_eq!(json["content"]["event"], "error");
    assert_eq!(json["content"]["code"], "RATE_LIMITED");
    assert_eq!(json["content"]["message"], "rate limit exceeded");
}

#[test]
fn connection_replaced_notice_shape() {
    let frame = SystemFrame::connection_replaced();
    let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["context"], "session_ended");
    assert_eq!(json["content"]["event"], "session_ended");
    assert_eq!(json["content"]["reason"], "Connection replaced");
}

#[test]
fn system_frame_round_trips() {
    let frame = SystemFrame::history_unavailable();
    let serialized = serde_json::to_string(&frame).unwrap();
    let reparsed: SystemFrame = serde_json::from_str(&serialized).unwrap();
    assert_eq!(frame, reparsed);
}
