//! Integration tests for the sync client against the mock transport.

use std::time::Duration;

use futures::StreamExt;
use livesync_engine::{
    ClientConfig, ConnectionState, Diagnostic, MockTransport, MockVerification, ReconnectPolicy,
    SyncClient, SyncError,
};
use livesync_protocol::events;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Todo {
    #[serde(rename = "_id")]
    id: String,
    title: String,
}

fn setup(config: ClientConfig) -> (SyncClient, MockTransport) {
    let transport = MockTransport::new();
    let client = SyncClient::new(config, transport.clone());
    (client, transport)
}

async fn connected(config: ClientConfig) -> (SyncClient, MockTransport) {
    let (client, transport) = setup(config);
    client.connect().await.unwrap();
    (client, transport)
}

/// Lets the engine task drain its channels.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn connect_and_verify() {
    let (client, transport) = setup(ClientConfig::new("proj"));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Verified);
    assert_eq!(
        transport.emitted_on(events::CLIENT_VERIFY_SOCKET),
        vec![json!({ "projectId": "proj" })]
    );
}

#[tokio::test]
async fn handshake_rejection_fails_connect() {
    let (client, transport) = setup(ClientConfig::new("proj"));
    transport.set_verification(MockVerification::Reject(json!({ "message": "unknown project" })));

    let result = client.connect().await;

    assert_eq!(
        result,
        Err(SyncError::Handshake(json!({ "message": "unknown project" })))
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_failure_is_reported() {
    let (client, transport) = setup(ClientConfig::new("proj"));
    transport.set_connect_error("connection refused");

    let err = client.connect().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn two_subscribers_share_one_registration() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;

    let mut first = client
        .subscribe::<Vec<Todo>>("todos", json!({ "done": false }))
        .unwrap();
    let mut second = client
        .subscribe::<Vec<Todo>>("todos", json!({ "done": false }))
        .unwrap();
    settle().await;

    assert_eq!(first.key(), second.key());
    assert_eq!(transport.emit_count("proj_todos_read"), 1);
    assert_eq!(
        transport.emitted_on("proj_todos_read"),
        vec![json!({
            "body": { "done": false },
            "responseId": first.key(),
            "routeId": "todos",
            "syncType": 1
        })]
    );

    transport.deliver(
        first.key(),
        json!({ "result": [{ "_id": "a", "title": "milk" }] }),
    );

    let expected = vec![Todo {
        id: "a".into(),
        title: "milk".into(),
    }];
    assert_eq!(first.next().await.unwrap().unwrap(), expected);
    assert_eq!(second.next().await.unwrap().unwrap(), expected);
}

#[tokio::test]
async fn different_bodies_get_separate_streams() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;

    let open = client.subscribe::<Value>("todos", json!({ "done": false })).unwrap();
    let done = client.subscribe::<Value>("todos", json!({ "done": true })).unwrap();
    settle().await;

    assert_ne!(open.key(), done.key());
    assert_eq!(transport.emit_count("proj_todos_read"), 2);
    assert_eq!(transport.emit_count("proj_UTILITIES_VALIDATE_SYNC"), 1);
}

#[tokio::test]
async fn late_joiner_receives_current_value() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;

    let mut first = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;
    transport.deliver(first.key(), json!({ "result": [{ "_id": "a" }] }));
    assert_eq!(first.next().await.unwrap().unwrap(), json!([{ "_id": "a" }]));

    let mut late = client.subscribe::<Value>("todos", Value::Null).unwrap();
    assert_eq!(late.next().await.unwrap().unwrap(), json!([{ "_id": "a" }]));
    assert_eq!(transport.emit_count("proj_todos_read"), 1);
}

#[tokio::test]
async fn list_stream_merges_in_order() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;
    let mut todos = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;
    let key = todos.key().to_string();

    transport.deliver(&key, json!({ "result": [] }));
    transport.deliver(&key, json!({ "result": { "_id": "a" }, "opType": 1 }));
    transport.deliver(&key, json!({ "result": { "_id": "a", "v": 2 }, "opType": 2 }));
    transport.deliver(&key, json!({ "result": { "_id": "b" }, "opType": 3 }));
    transport.deliver(&key, json!({ "result": { "_id": "a" }, "opType": 3 }));

    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(todos.next().await.unwrap().unwrap());
    }
    assert_eq!(
        seen,
        vec![
            json!([]),
            json!([{ "_id": "a" }]),
            json!([{ "_id": "a", "v": 2 }]),
            json!([{ "_id": "a", "v": 2 }]),
            json!([]),
        ]
    );
}

#[tokio::test]
async fn single_document_delete_and_stale_update() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;
    let mut doc = client
        .subscribe::<Value>("profile", json!({ "id": "x" }))
        .unwrap();
    settle().await;
    let key = doc.key().to_string();

    transport.deliver(&key, json!({ "result": { "_id": "x", "name": "n" } }));
    transport.deliver(&key, json!({ "result": { "_id": "x" }, "opType": 3 }));
    transport.deliver(&key, json!({ "result": { "_id": "y" }, "opType": 2 }));
    settle().await;

    assert_eq!(
        doc.next().await.unwrap().unwrap(),
        json!({ "_id": "x", "name": "n" })
    );
    assert_eq!(doc.next().await.unwrap().unwrap(), Value::Null);
    assert!(doc.try_next().is_none());
}

#[tokio::test]
async fn observers_receive_independent_values() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;
    let mut first = client.subscribe::<Value>("todos", Value::Null).unwrap();
    let mut second = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;

    transport.deliver(first.key(), json!({ "result": { "_id": "a", "n": 1 } }));

    let mut mine = first.next().await.unwrap().unwrap();
    mine["n"] = json!(100);

    assert_eq!(
        second.next().await.unwrap().unwrap(),
        json!({ "_id": "a", "n": 1 })
    );

    let mut third = client.subscribe::<Value>("todos", Value::Null).unwrap();
    assert_eq!(
        third.next().await.unwrap().unwrap(),
        json!({ "_id": "a", "n": 1 })
    );
}

#[tokio::test]
async fn reattach_within_grace_keeps_stream() {
    let config = ClientConfig::new("proj").with_grace_delay(Duration::from_millis(200));
    let (client, transport) = connected(config).await;

    let mut first = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;
    let key = first.key().to_string();
    transport.deliver(&key, json!({ "result": [1, 2, 3] }));
    assert_eq!(first.next().await.unwrap().unwrap(), json!([1, 2, 3]));

    first.unsubscribe();
    settle().await;
    let mut again = client.subscribe::<Value>("todos", Value::Null).unwrap();
    assert_eq!(again.next().await.unwrap().unwrap(), json!([1, 2, 3]));

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(transport.emit_count("proj_todos_read"), 1);
    assert_eq!(transport.unlisten_count(&key), 0);
    assert!(transport.is_listening(&key));

    transport.deliver(&key, json!({ "result": [4] }));
    assert_eq!(again.next().await.unwrap().unwrap(), json!([4]));
}

#[tokio::test]
async fn last_detach_tears_down_after_grace() {
    let config = ClientConfig::new("proj").with_grace_delay(Duration::from_millis(20));
    let (client, transport) = connected(config).await;

    let first = client.subscribe::<Value>("todos", Value::Null).unwrap();
    let second = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;
    let key = first.key().to_string();

    drop(first);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(transport.is_listening(&key));

    drop(second);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!transport.is_listening(&key));
    assert_eq!(transport.unlisten_count(&key), 1);
    assert_eq!(transport.unlisten_count(&events::error_event(&key)), 1);

    // A new subscriber after teardown registers a fresh stream.
    let _fresh = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;
    assert_eq!(transport.emit_count("proj_todos_read"), 2);
}

#[tokio::test]
async fn subscribe_before_connect_is_deferred() {
    let (client, transport) = setup(ClientConfig::new("proj"));

    let mut todos = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;
    assert_eq!(transport.emit_count("proj_todos_read"), 0);

    client.connect().await.unwrap();
    settle().await;
    assert_eq!(transport.emit_count("proj_todos_read"), 1);

    transport.deliver(todos.key(), json!({ "result": "ready" }));
    assert_eq!(todos.next().await.unwrap().unwrap(), json!("ready"));
}

#[tokio::test]
async fn reconnect_replays_each_stream_once() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;
    let mut diagnostics = client.diagnostics();

    let mut todos = client.subscribe::<Value>("todos", Value::Null).unwrap();
    let mut shared = client.subscribe::<Value>("todos", Value::Null).unwrap();
    let mut users = client.subscribe::<Value>("users", Value::Null).unwrap();
    settle().await;
    transport.deliver(todos.key(), json!({ "result": [] }));
    assert_eq!(todos.next().await.unwrap().unwrap(), json!([]));
    assert_eq!(shared.next().await.unwrap().unwrap(), json!([]));
    transport.clear_emitted();

    assert!(transport.drop_connection("transport close"));
    settle().await;

    assert_eq!(client.state(), ConnectionState::Verified);
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(transport.emit_count("proj_todos_read"), 1);
    assert_eq!(transport.emit_count("proj_users_read"), 1);
    assert_eq!(transport.emit_count("proj_UTILITIES_VALIDATE_SYNC"), 0);
    assert_eq!(
        diagnostics.recv().await.unwrap(),
        Diagnostic::ConnectionLost {
            reason: "transport close".into()
        }
    );
    assert_eq!(diagnostics.recv().await.unwrap(), Diagnostic::Reconnected);

    transport.deliver(todos.key(), json!({ "result": { "_id": "a" }, "opType": 1 }));
    transport.deliver(users.key(), json!({ "result": [] }));
    assert_eq!(todos.next().await.unwrap().unwrap(), json!([{ "_id": "a" }]));
    assert_eq!(shared.next().await.unwrap().unwrap(), json!([{ "_id": "a" }]));
    assert_eq!(users.next().await.unwrap().unwrap(), json!([]));
}

#[tokio::test]
async fn reconnection_trigger_cycles_connection() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;
    let _todos = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;
    transport.clear_emitted();

    transport.deliver(events::RECONNECTION_TRIGGER, Value::Null);
    settle().await;

    assert_eq!(client.state(), ConnectionState::Verified);
    assert_eq!(transport.disconnect_count(), 1);
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(transport.emit_count(events::CLIENT_VERIFY_SOCKET), 1);
    assert_eq!(transport.emit_count("proj_todos_read"), 1);
}

#[tokio::test]
async fn failed_reconnect_is_published() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;
    let mut diagnostics = client.diagnostics();
    let mut states = client.state_changes();
    let mut todos = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;
    transport.deliver(todos.key(), json!({ "result": [1] }));
    assert_eq!(todos.next().await.unwrap().unwrap(), json!([1]));

    transport.set_connect_error("server down");
    transport.drop_connection("ping timeout");
    settle().await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

    let _lost = diagnostics.recv().await.unwrap();
    assert!(matches!(
        diagnostics.recv().await.unwrap(),
        Diagnostic::ReconnectFailed { error } if error.contains("server down")
    ));

    // The stream survives and is replayed by the next connect.
    transport.clear_connect_error();
    transport.clear_emitted();
    client.connect().await.unwrap();
    settle().await;
    assert_eq!(transport.emit_count("proj_todos_read"), 1);
    transport.deliver(todos.key(), json!({ "result": [2] }));
    assert_eq!(todos.next().await.unwrap().unwrap(), json!([2]));
}

#[tokio::test]
async fn reconnect_policy_retries() {
    let policy = ReconnectPolicy::new(3)
        .with_initial_delay(Duration::from_millis(40))
        .without_jitter();
    let (client, transport) = connected(ClientConfig::new("proj").with_reconnect(policy)).await;

    transport.set_connect_error("server down");
    transport.drop_connection("ping timeout");
    settle().await;
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    transport.clear_connect_error();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), ConnectionState::Verified);
    assert_eq!(transport.connect_count(), 3);
}

#[tokio::test]
async fn explicit_disconnect_keeps_streams() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;
    let mut todos = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;
    transport.deliver(todos.key(), json!({ "result": ["a"] }));
    assert_eq!(todos.next().await.unwrap().unwrap(), json!(["a"]));

    client.disconnect().unwrap();
    settle().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!transport.is_connected());

    let mut late = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;
    assert!(late.try_next().is_none());

    client.connect().await.unwrap();
    settle().await;
    assert_eq!(late.next().await.unwrap().unwrap(), json!(["a"]));
    assert_eq!(transport.emit_count("proj_todos_read"), 2);
}

#[tokio::test]
async fn call_resolves_with_data() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;

    let pending = tokio::spawn({
        let transport = transport.clone();
        async move {
            settle().await;
            let request = transport.emitted_on("proj_todos_write").remove(0);
            let response_id = request["responseId"].as_str().unwrap().to_string();
            transport.deliver(
                &response_id,
                json!({ "data": { "_id": "a", "title": "milk" } }),
            );
            request
        }
    });

    let todo: Todo = client
        .call("todos", json!({ "title": "milk" }), Some(true))
        .await
        .unwrap();
    let request = pending.await.unwrap();

    assert_eq!(
        todo,
        Todo {
            id: "a".into(),
            title: "milk".into()
        }
    );
    assert_eq!(request["body"], json!({ "title": "milk" }));
    assert_eq!(request["getDoc"], json!(true));
    assert_eq!(request["routeId"], json!("todos"));
    assert_eq!(
        transport.emitted_on("proj_UTILITIES_VALIDATE_WRITE"),
        vec![json!({
            "responseId": request["responseId"],
            "routeId": "todos"
        })]
    );
}

#[tokio::test]
async fn call_fails_with_remote_error() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;

    tokio::spawn({
        let transport = transport.clone();
        async move {
            settle().await;
            let request = transport.emitted_on("proj_todos_write").remove(0);
            let response_id = request["responseId"].as_str().unwrap().to_string();
            transport.deliver(&response_id, json!({ "err": "permission denied" }));
        }
    });

    let result: Result<Value, _> = client.call("todos", json!({}), None).await;
    assert_eq!(result, Err(SyncError::Remote(json!("permission denied"))));
}

#[tokio::test]
async fn call_fails_on_error_channel() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;

    tokio::spawn({
        let transport = transport.clone();
        async move {
            settle().await;
            let request = transport.emitted_on("proj_todos_write").remove(0);
            let response_id = request["responseId"].as_str().unwrap().to_string();
            transport.deliver(&events::error_event(&response_id), json!("bad payload"));
        }
    });

    let result: Result<Value, _> = client.call("todos", json!({}), None).await;
    assert_eq!(result, Err(SyncError::Remote(json!("bad payload"))));
}

#[tokio::test]
async fn call_times_out() {
    let config = ClientConfig::new("proj").with_call_timeout(Duration::from_millis(20));
    let (client, transport) = connected(config).await;

    let result: Result<Value, _> = client.call("todos", json!({}), None).await;
    assert_eq!(result, Err(SyncError::Timeout));

    settle().await;
    let request = transport.emitted_on("proj_todos_write").remove(0);
    let response_id = request["responseId"].as_str().unwrap();
    assert!(!transport.is_listening(response_id));
}

#[tokio::test]
async fn server_time_tracks_timestamps() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;
    let mut clock = client.server_time().unwrap();
    let todos = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;

    assert_eq!(clock.key(), events::SERVER_TIME_KEY);
    assert_eq!(
        transport.emitted_on("proj_UTILITIES_SERVER_TIME_read"),
        vec![json!({
            "body": {},
            "responseId": "UTILITIES_SERVER_TIME_RESULT",
            "routeId": "UTILITIES_SERVER_TIME",
            "syncType": 2
        })]
    );

    transport.deliver(
        events::SERVER_TIME_KEY,
        json!({ "result": "2024-05-01T10:00:00Z", "timestamp": "2024-05-01T10:00:00Z" }),
    );
    let first = clock.next().await.unwrap().unwrap();
    assert_eq!(first.to_rfc3339(), "2024-05-01T10:00:00+00:00");

    transport.deliver(
        todos.key(),
        json!({ "result": [], "timestamp": 1_714_557_660_000_i64 }),
    );
    let second = clock.next().await.unwrap().unwrap();
    assert_eq!((second - first).num_seconds(), 60);
}

#[tokio::test]
async fn merge_problems_become_diagnostics() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;
    let mut diagnostics = client.diagnostics();
    let mut todos = client.subscribe::<Value>("todos", Value::Null).unwrap();
    settle().await;
    let key = todos.key().to_string();

    transport.deliver(&key, json!({ "result": [] }));
    transport.deliver(&key, json!({ "result": { "_id": "a" }, "opType": 42 }));
    transport.deliver(&events::error_event(&key), json!("query failed"));
    transport.deliver(&key, json!({ "result": { "_id": "b" }, "opType": 1 }));

    assert_eq!(todos.next().await.unwrap().unwrap(), json!([]));
    assert_eq!(todos.next().await.unwrap().unwrap(), json!([{ "_id": "b" }]));

    assert!(matches!(
        diagnostics.recv().await.unwrap(),
        Diagnostic::RejectedOperation { key: k, .. } if k == key
    ));
    assert_eq!(
        diagnostics.recv().await.unwrap(),
        Diagnostic::StreamError {
            key: key.clone(),
            error: json!("query failed"),
        }
    );
}

#[tokio::test]
async fn route_rejection_becomes_diagnostic() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;
    let mut diagnostics = client.diagnostics();

    transport.deliver(
        &events::validate_sync_error_event(),
        json!({ "message": "route not found" }),
    );

    assert_eq!(
        diagnostics.recv().await.unwrap(),
        Diagnostic::RouteRejected {
            error: json!({ "message": "route not found" })
        }
    );
}

#[tokio::test]
async fn subscription_is_a_stream() {
    let (client, transport) = connected(ClientConfig::new("proj")).await;
    let todos = client.subscribe::<Vec<Todo>>("todos", Value::Null).unwrap();
    settle().await;

    transport.deliver(todos.key(), json!({ "result": [] }));
    transport.deliver(
        todos.key(),
        json!({ "result": { "_id": "a", "title": "milk" }, "opType": 1 }),
    );

    let values: Vec<Vec<Todo>> = todos
        .take(2)
        .map(|value| value.unwrap())
        .collect()
        .await;
    assert_eq!(values[0], vec![]);
    assert_eq!(values[1].len(), 1);
}

#[tokio::test]
async fn custom_identity_field() {
    let config = ClientConfig::new("proj").with_identity_field("id");
    let (client, transport) = connected(config).await;
    let mut items = client.subscribe::<Value>("items", Value::Null).unwrap();
    settle().await;

    transport.deliver(items.key(), json!({ "result": [{ "id": 1, "v": 1 }] }));
    transport.deliver(items.key(), json!({ "result": { "id": 1, "v": 2 }, "opType": 2 }));

    let _ = items.next().await;
    assert_eq!(
        items.next().await.unwrap().unwrap(),
        json!([{ "id": 1, "v": 2 }])
    );
}
