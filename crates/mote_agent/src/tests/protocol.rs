use serde_json::json;

use crate::protocol::{
    negotiated_protocol_version, parse_session_id, parse_session_update, parse_stop_reason,
    ContentBlock, SessionUpdate, StopReason,
};

#[test]
fn protocol_version_accepts_number_and_string() {
    assert_eq!(negotiated_protocol_version(&json!({"protocolVersion": 2})), 2);
    assert_eq!(
        negotiated_protocol_version(&json!({"protocolVersion": "2.1"})),
        2
    );
    assert_eq!(
        negotiated_protocol_version(&json!({"protocol_version": 1})),
        1
    );
    assert_eq!(negotiated_protocol_version(&json!({})), 1);
    assert_eq!(
        negotiated_protocol_version(&json!({"protocolVersion": "unversioned"})),
        1
    );
}

#[test]
fn message_chunk_extracts_nested_text() {
    let params = json!({
        "sessionId": "s1",
        "update": {
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "text", "text": "hello"},
        },
    });
    let (session, update) = parse_session_update(&params).expect("parse");
    assert_eq!(session, "s1");
    assert_eq!(
        update,
        SessionUpdate::AgentMessageChunk {
            text: "hello".into()
        }
    );
}

#[test]
fn tool_call_accepts_flat_shape() {
    let params = json!({
        "sessionId": "s1",
        "update": {
            "sessionUpdate": "tool_call",
            "toolCallId": "tc-1",
            "title": "search",
            "status": "pending",
            "rawInput": {"q": "x"},
        },
    });
    let (_, update) = parse_session_update(&params).expect("parse");
    let SessionUpdate::ToolCall(info) = update else {
        panic!("expected tool call, got {update:?}");
    };
    assert_eq!(info.id, "tc-1");
    assert_eq!(info.name, "search");
    assert_eq!(info.status.as_deref(), Some("pending"));
    assert_eq!(info.arguments, Some(json!({"q": "x"})));
}

#[test]
fn tool_call_accepts_nested_shape() {
    let params = json!({
        "sessionId": "s1",
        "update": {
            "sessionUpdate": "tool_call_update",
            "toolCall": {"toolCallId": "tc-2", "name": "fetch", "status": "completed"},
        },
    });
    let (_, update) = parse_session_update(&params).expect("parse");
    let SessionUpdate::ToolCallUpdate(info) = update else {
        panic!("expected tool call update, got {update:?}");
    };
    assert_eq!(info.id, "tc-2");
    assert_eq!(info.name, "fetch");
    assert_eq!(info.status.as_deref(), Some("completed"));
}

#[test]
fn unknown_update_kind_is_skipped() {
    let params = json!({
        "sessionId": "s1",
        "update": {"sessionUpdate": "usage_report"},
    });
    assert!(parse_session_update(&params).is_none());
}

#[test]
fn stop_reasons_map_to_finish_reasons() {
    let cases = [
        ("end_turn", StopReason::EndTurn, "stop"),
        ("tool_use", StopReason::ToolUse, "tool_calls"),
        ("max_tokens", StopReason::MaxTokens, "length"),
        ("stop_sequence", StopReason::StopSequence, "stop"),
    ];
    for (label, expected, finish) in cases {
        let parsed = parse_stop_reason(&json!({"stopReason": label}));
        assert_eq!(parsed, expected);
        assert_eq!(parsed.as_finish_reason(), finish);
    }
    // Unknown labels behave as end-turn.
    assert_eq!(
        parse_stop_reason(&json!({"stopReason": "mystery"})),
        StopReason::EndTurn
    );
}

#[test]
fn session_id_accepts_both_spellings() {
    assert_eq!(
        parse_session_id(&json!({"sessionId": "a"})).as_deref(),
        Some("a")
    );
    assert_eq!(
        parse_session_id(&json!({"session_id": "b"})).as_deref(),
        Some("b")
    );
    assert_eq!(parse_session_id(&json!({})), None);
}

#[test]
fn content_blocks_serialize_with_type_tags() {
    let text = serde_json::to_value(ContentBlock::Text {
        text: "hi".into(),
    })
    .expect("serialize");
    assert_eq!(text, json!({"type": "text", "text": "hi"}));

    let image = serde_json::to_value(ContentBlock::Image {
        mime_type: "image/png".into(),
        data: "AAAA".into(),
    })
    .expect("serialize");
    assert_eq!(
        image,
        json!({"type": "image", "mimeType": "image/png", "data": "AAAA"})
    );
}
