//! Wire compatibility tests for the sync protocol.
//!
//! These exercise the JSON the server reads and writes without a database.

use ensemble_engine::{
    wire::{ClientMessage, PushRequest, PushResponse, ServerMessage},
    Collection, DeviceId, SyncRecord, MEMBERS,
};
use serde_json::json;

fn record(device: &str, timestamp: u64) -> SyncRecord {
    SyncRecord::new(
        MEMBERS,
        Collection::from_entities(vec![json!({"id": "m1", "name": "Ana", "assignedInventory": []})]),
        timestamp,
        DeviceId::new(device),
        "orchestra-1",
    )
}

#[test]
fn websocket_session_as_a_device_sees_it() {
    let subscribe: ClientMessage =
        serde_json::from_value(json!({"type": "subscribe", "key": "members"})).unwrap();
    assert_eq!(
        subscribe,
        ClientMessage::Subscribe {
            key: MEMBERS.into()
        }
    );

    let ack = serde_json::to_value(ServerMessage::Subscribed {
        key: MEMBERS.into(),
    })
    .unwrap();
    assert_eq!(ack, json!({"type": "subscribed", "key": "members"}));

    // The writer receives its own write back; the device id tells it apart.
    let echo = serde_json::to_string(&ServerMessage::record(record("dev-a", 1_706_745_600_001)))
        .unwrap();
    match serde_json::from_str::<ServerMessage>(&echo).unwrap() {
        ServerMessage::Record { record } => {
            assert!(record.is_echo_for(&DeviceId::new("dev-a")));
            assert!(!record.is_echo_for(&DeviceId::new("dev-b")));
        }
        other => panic!("expected record, got {other:?}"),
    }

    let reply = serde_json::to_value(ServerMessage::PushResponse {
        timestamp: 1_706_745_600_001,
        request_id: Some("r-7".into()),
    })
    .unwrap();
    assert_eq!(
        reply,
        json!({"type": "push_response", "timestamp": 1_706_745_600_001u64, "request_id": "r-7"})
    );
}

#[test]
fn pull_of_absent_document_carries_null_record() {
    let value = serde_json::to_value(ServerMessage::PullResponse {
        record: None,
        request_id: None,
    })
    .unwrap();
    assert_eq!(value, json!({"type": "pull_response", "record": null}));
}

#[test]
fn http_and_websocket_records_share_one_shape() {
    let http_body = serde_json::to_value(record("dev-a", 42)).unwrap();
    let ws_message = serde_json::to_value(ServerMessage::record(record("dev-a", 42))).unwrap();

    assert_eq!(ws_message["record"], http_body);
    assert_eq!(
        http_body,
        json!({
            "key": "members",
            "data": [{"id": "m1", "name": "Ana", "assignedInventory": []}],
            "timestamp": 42,
            "deviceId": "dev-a",
            "ownerId": "orchestra-1"
        })
    );
}

#[test]
fn http_push_round_trip() {
    let body: PushRequest = serde_json::from_value(json!({
        "data": [{"id": "t1", "done": false}],
        "deviceId": "dev-b",
        "ownerId": "orchestra-1"
    }))
    .unwrap();
    assert_eq!(body.device_id, "dev-b");
    assert!(body.data.is_array());

    let response = serde_json::to_string(&PushResponse { timestamp: 9 }).unwrap();
    assert_eq!(response, r#"{"timestamp":9}"#);
}

#[test]
fn malformed_client_messages_are_rejected() {
    for text in [
        r#"{"type": "subscribe"}"#,
        r#"{"type": "push", "key": "members", "data": "m1", "device_id": "dev-a"}"#,
        r#"{"type": "rename", "key": "members"}"#,
        r#"not json"#,
    ] {
        assert!(
            serde_json::from_str::<ClientMessage>(text).is_err(),
            "accepted {text}"
        );
    }
}
