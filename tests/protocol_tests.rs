//! Wire format compliance for envelopes and JSON-RPC control frames.

use ares_mcp::protocol::{
    parse_frame, Envelope, Frame, JsonRpcResponse, Message, ProtocolError, MESSAGE_KINDS,
};
use rstest::rstest;
use serde_json::{json, Value};

const TS: &str = "2025-03-14T09:26:53Z";

fn frame(kind: &str, data: Value) -> String {
    json!({ "type": kind, "data": data, "timestamp": TS }).to_string()
}

#[rstest]
#[case("agent_register", json!({ "agent_id": "lit-1", "agent_type": "literature_search", "capabilities": ["literature_search"], "max_concurrent": 2 }))]
#[case("heartbeat", json!({ "agent_id": "lit-1", "load": 1 }))]
#[case("ping", json!({}))]
#[case("pong", json!({}))]
#[case("query_capabilities", json!({ "capability": "literature_search" }))]
#[case("research_action", json!({ "action": "start", "query": "sepsis biomarkers" }))]
#[case("task_submit", json!({ "action": "literature_search", "payload": { "q": "sepsis" }, "priority": 3 }))]
#[case("task_accepted", json!({ "task_id": "t-1", "status": "running" }))]
#[case("task_result", json!({ "task_id": "t-1", "status": "completed", "result": { "n": 4 } }))]
#[case("agent_response", json!({ "success": true, "result": {} }))]
#[case("registration_confirmed", json!({ "agent_id": "lit-1", "session_id": "s-1", "heartbeat_interval_secs": 30 }))]
#[case("health_check", json!({}))]
fn test_every_message_kind_decodes(#[case] kind: &str, #[case] data: Value) {
    let Frame::Envelope(env) = parse_frame(&frame(kind, data)).unwrap() else {
        panic!("expected envelope for {}", kind);
    };
    assert_eq!(env.kind(), kind);
    assert_eq!(env.timestamp.to_rfc3339(), "2025-03-14T09:26:53+00:00");
}

#[test]
fn test_case_list_covers_all_kinds() {
    assert_eq!(MESSAGE_KINDS.len(), 12);
}

#[test]
fn test_max_concurrency_alias_accepted() {
    let text = frame(
        "agent_register",
        json!({ "agent_id": "a", "agent_type": "writer", "capabilities": ["write"], "max_concurrency": 4 }),
    );
    let env = Envelope::parse(&text).unwrap();
    let Message::AgentRegister(register) = env.message else {
        panic!("expected agent_register");
    };
    assert_eq!(register.max_concurrent, 4);
}

#[test]
fn test_correlation_ids_survive_round_trip() {
    let text = json!({
        "type": "ping",
        "data": {},
        "timestamp": TS,
        "client_id": "dashboard",
        "request_id": "req-7",
    })
    .to_string();
    let env = Envelope::parse(&text).unwrap();
    let reply = env.reply(Message::Pong(Default::default()));
    assert_eq!(reply.request_id.as_deref(), Some("req-7"));

    let wire: Value = serde_json::from_str(&env.to_json()).unwrap();
    assert_eq!(wire["type"], "ping");
    assert_eq!(wire["client_id"], "dashboard");
    assert_eq!(wire["request_id"], "req-7");
    assert!(wire["data"].is_object());
}

#[rstest]
#[case(json!({ "data": {}, "timestamp": TS }), ProtocolError::MissingField("type"))]
#[case(json!({ "type": "ping", "timestamp": TS }), ProtocolError::MissingField("data"))]
#[case(json!({ "type": "ping", "data": {} }), ProtocolError::MissingField("timestamp"))]
#[case(json!({ "type": "ping", "data": {}, "timestamp": "yesterday" }), ProtocolError::InvalidTimestamp("yesterday".into()))]
#[case(json!({ "type": "teleport", "data": {}, "timestamp": TS }), ProtocolError::UnknownType("teleport".into()))]
fn test_invalid_envelopes_rejected(#[case] value: Value, #[case] expected: ProtocolError) {
    let err = parse_frame(&value.to_string()).unwrap_err();
    assert_eq!(err, expected);
    assert!(!err.is_rpc());
}

#[test]
fn test_invalid_payload_names_kind() {
    let err = parse_frame(&frame("task_result", json!({ "status": "completed" }))).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidPayload { ref kind, .. } if kind == "task_result"));
}

#[test]
fn test_rpc_ping_decodes() {
    let Frame::Rpc(req) = parse_frame(r#"{"jsonrpc":"2.0","id":"p-1","method":"ping"}"#).unwrap()
    else {
        panic!("expected rpc");
    };
    assert_eq!(req.id, json!("p-1"));
}

#[rstest]
#[case(r#"{"jsonrpc":"2.0","id":3,"method":"tools/call"}"#, -32601, json!(3))]
#[case(r#"{"jsonrpc":"1.0","id":4,"method":"ping"}"#, -32600, json!(4))]
#[case(r#"{"jsonrpc":"2.0","id":5"#, -32700, Value::Null)]
fn test_rpc_errors_carry_codes_and_ids(
    #[case] text: &str,
    #[case] code: i32,
    #[case] id: Value,
) {
    let err = parse_frame(text).unwrap_err();
    assert!(err.is_rpc());

    let reply: Value = serde_json::from_str(&JsonRpcResponse::error(&err).to_json()).unwrap();
    assert_eq!(reply["jsonrpc"], "2.0");
    assert_eq!(reply["error"]["code"], code);
    assert_eq!(reply["id"], id);
    assert!(reply.get("result").is_none());
}
