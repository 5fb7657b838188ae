use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use hub_client::{ClientError, HubClient};
use varme_core::config::HubOptions;

fn hub_options(port: u16) -> HubOptions {
    HubOptions {
        ws_url: format!("ws://127.0.0.1:{port}/api/websocket"),
        rest_url: None,
        access_token: "secret-token".into(),
        max_retries: 2,
        retry_delay_ms: 50,
        state_check_interval_ms: 600_000,
    }
}

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    (listener, port)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.expect("accept");
    tokio_tungstenite::accept_async(stream).await.expect("websocket handshake")
}

async fn send(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(Message::text(value.to_string())).await.expect("server send");
}

async fn recv(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match ws.next().await.expect("frame").expect("frame ok") {
            Message::Text(text) => return serde_json::from_str(&text).expect("json frame"),
            Message::Close(_) => panic!("connection closed while expecting a frame"),
            _ => {}
        }
    }
}

/// Server-initiated handshake; returns the client's auth message.
async fn handshake(ws: &mut WebSocketStream<TcpStream>, ok: bool) -> Value {
    send(ws, json!({"type": "auth_required"})).await;
    let auth = recv(ws).await;
    if ok {
        send(ws, json!({"type": "auth_ok"})).await;
    } else {
        send(ws, json!({"type": "auth_invalid", "message": "token expired"})).await;
    }
    auth
}

async fn reply_ok(ws: &mut WebSocketStream<TcpStream>, id: &Value, result: Value) {
    send(ws, json!({"type": "result", "id": id, "success": true, "result": result})).await;
}

#[tokio::test]
async fn authenticates_and_looks_up_entity_state() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let auth = handshake(&mut ws, true).await;
        assert_eq!(auth["type"], "auth");
        assert_eq!(auth["access_token"], "secret-token");

        let req = recv(&mut ws).await;
        assert_eq!(req["type"], "get_states");
        reply_ok(
            &mut ws,
            &req["id"],
            json!([
                {"entity_id": "sensor.porch_temperature", "state": "4.2"},
                {"entity_id": "sensor.hall_temperature", "state": "21.5"},
            ]),
        )
        .await;

        let req = recv(&mut ws).await;
        assert_eq!(req["type"], "get_states");
        reply_ok(&mut ws, &req["id"], json!([])).await;
    });

    let client = HubClient::connect(hub_options(port)).await.expect("connect");
    assert!(client.is_connected());

    let found = client.get_entity_state("sensor.hall_temperature").await.expect("get state");
    assert_eq!(found.expect("snapshot").state, "21.5");

    let missing = client.get_entity_state("sensor.hall_temperature").await.expect("get state");
    assert!(missing.is_none(), "a missing entity is None, not an error");

    client.disconnect().await;
    server.await.expect("server");
}

#[tokio::test]
async fn auth_rejection_is_fatal_before_any_request() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let auth = handshake(&mut ws, false).await;
        assert_eq!(auth["type"], "auth");

        // nothing but the socket going away may follow
        match ws.next().await {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {}
            Some(Ok(frame)) => panic!("unexpected frame after auth_invalid: {frame:?}"),
        }
    });

    let err = HubClient::connect(hub_options(port)).await.expect_err("auth must fail");
    assert!(matches!(err, ClientError::AuthInvalid(_)), "got {err:?}");
    server.await.expect("server");
}

#[tokio::test]
async fn request_ids_start_at_one_and_increase() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws, true).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            let req = recv(&mut ws).await;
            ids.push(req["id"].as_u64().expect("request id"));
            reply_ok(&mut ws, &req["id"], Value::Null).await;
        }
        ids
    });

    let client = HubClient::connect(hub_options(port)).await.expect("connect");
    let _events = client.subscribe_state_changed().await.expect("subscribe");
    client
        .call_service("climate", "set_hvac_mode", json!({"entity_id": "climate.hall"}))
        .await
        .expect("call service");
    client
        .call_service("climate", "set_temperature", json!({"entity_id": "climate.hall"}))
        .await
        .expect("call service");

    let ids = server.await.expect("server");
    assert_eq!(ids, vec![1, 2, 3]);
    client.disconnect().await;
}

#[tokio::test]
async fn failed_service_call_surfaces_the_hub_error() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws, true).await;

        let req = recv(&mut ws).await;
        assert_eq!(req["type"], "call_service");
        assert_eq!(req["domain"], "climate");
        assert_eq!(req["service"], "set_preset_mode");
        send(
            &mut ws,
            json!({
                "type": "result",
                "id": req["id"],
                "success": false,
                "error": {"code": "service_not_found", "message": "no such service"},
            }),
        )
        .await;
    });

    let client = HubClient::connect(hub_options(port)).await.expect("connect");
    let err = client
        .call_service("climate", "set_preset_mode", json!({"entity_id": "climate.hall"}))
        .await
        .expect_err("hub said no");
    assert!(matches!(err, ClientError::ServiceCall(_)), "got {err:?}");

    client.disconnect().await;
    server.await.expect("server");
}

#[tokio::test]
async fn fans_state_changes_out_to_every_subscriber() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws, true).await;

        let req = recv(&mut ws).await;
        assert_eq!(req["type"], "subscribe_events");
        assert_eq!(req["event_type"], "state_changed");
        reply_ok(&mut ws, &req["id"], Value::Null).await;

        // the fence guarantees both subscribers are registered
        let req = recv(&mut ws).await;
        assert_eq!(req["type"], "get_states");
        reply_ok(&mut ws, &req["id"], json!([])).await;

        send(
            &mut ws,
            json!({
                "type": "event",
                "id": 1,
                "event": {
                    "event_type": "state_changed",
                    "data": {
                        "entity_id": "sensor.hall_temperature",
                        "old_state": null,
                        "new_state": {"entity_id": "sensor.hall_temperature", "state": "19.2"},
                    },
                },
            }),
        )
        .await;
        // an unrecognized frame must be ignored, not kill the session
        send(&mut ws, json!({"type": "zone_registry_updated", "data": {}})).await;

        let req = recv(&mut ws).await;
        assert_eq!(req["type"], "get_states");
        reply_ok(&mut ws, &req["id"], json!([])).await;
    });

    let client = HubClient::connect(hub_options(port)).await.expect("connect");
    let mut first = client.subscribe_state_changed().await.expect("subscribe");
    let mut second = client.subscribe_state_changed().await.expect("subscribe");
    let _ = client.get_entity_state("sensor.none").await.expect("fence");

    let event = first.recv().await.expect("first subscriber event");
    assert_eq!(event.entity_id, "sensor.hall_temperature");
    assert_eq!(event.new_state.expect("new state").state, "19.2");

    let event = second.recv().await.expect("second subscriber event");
    assert_eq!(event.entity_id, "sensor.hall_temperature");

    // session still healthy after the unknown frame
    let state = client.get_entity_state("sensor.none").await.expect("get state");
    assert!(state.is_none());

    client.disconnect().await;
    server.await.expect("server");
}

#[tokio::test(start_paused = true)]
async fn unanswered_requests_time_out() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws, true).await;

        let req = recv(&mut ws).await;
        assert_eq!(req["type"], "call_service");
        // never reply; hold the socket open until the client hangs up
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                _ => {}
            }
        }
    });

    let client = HubClient::connect(hub_options(port)).await.expect("connect");
    let err = client
        .call_service("climate", "set_hvac_mode", json!({"entity_id": "climate.hall"}))
        .await
        .expect_err("no reply ever comes");
    assert!(matches!(err, ClientError::Timeout), "got {err:?}");

    client.disconnect().await;
    server.await.expect("server");
}

#[tokio::test]
async fn reconnect_fails_pending_waiters_then_resubscribes() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        // first session: accept a request, then drop the socket on the floor
        let mut ws = accept(&listener).await;
        handshake(&mut ws, true).await;
        let sub = recv(&mut ws).await;
        assert_eq!(sub["type"], "subscribe_events");
        reply_ok(&mut ws, &sub["id"], Value::Null).await;
        let req = recv(&mut ws).await;
        assert_eq!(req["type"], "get_states");
        drop(ws);

        // second session: ids restart at 1 and the subscription is replayed
        let mut ws = accept(&listener).await;
        handshake(&mut ws, true).await;
        let sub = recv(&mut ws).await;
        assert_eq!(sub["type"], "subscribe_events");
        assert_eq!(sub["id"], 1);
        reply_ok(&mut ws, &sub["id"], Value::Null).await;

        let req = recv(&mut ws).await;
        assert_eq!(req["type"], "get_states");
        reply_ok(&mut ws, &req["id"], json!([])).await;

        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                _ => {}
            }
        }
    });

    let client = HubClient::connect(hub_options(port)).await.expect("connect");
    let _events = client.subscribe_state_changed().await.expect("subscribe");

    let err = client
        .get_entity_state("sensor.hall_temperature")
        .await
        .expect_err("the session died under this request");
    assert!(matches!(err, ClientError::Disconnected), "got {err:?}");

    // after the reconnect the same handle keeps working
    let state = client.get_entity_state("sensor.hall_temperature").await.expect("get state");
    assert!(state.is_none());

    client.disconnect().await;
    server.await.expect("server");
}

#[tokio::test]
async fn retry_exhaustion_is_fatal() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws, true).await;
        drop(ws);
        drop(listener); // every reconnect attempt is refused
    });

    let client = HubClient::connect(hub_options(port)).await.expect("connect");
    server.await.expect("server");

    let err = client.closed().await;
    assert!(matches!(*err, ClientError::RetriesExhausted(2)), "got {err:?}");
    assert!(!client.is_connected());
}
