use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::protocol::{ClientEnvelope, ClientRequest, ServerEvent};
use tokio::net::TcpListener;

use crate::transport::{Channel, WebSocketChannel};

#[derive(Deserialize)]
struct TopicQuery {
    topic: String,
}

async fn ws_handler(ws: WebSocketUpgrade, Query(query): Query<TopicQuery>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_channel(socket, query.topic))
}

/// Greets every join with an empty `initial_jobs`, then echoes each client
/// frame back as a `reply` carrying the same request id.
async fn serve_channel(mut socket: WebSocket, topic: String) {
    let greeting = json!({
        "event": "initial_jobs",
        "payload": {"running": [], "completed": []}
    });
    if socket
        .send(Message::Text(greeting.to_string()))
        .await
        .is_err()
    {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(&text).expect("client frame");
            let reply = json!({
                "event": "reply",
                "payload": {
                    "request_id": frame["request_id"],
                    "response": {"echoed": frame["event"], "topic": topic}
                }
            });
            if socket.send(Message::Text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }
}

async fn spawn_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = Router::new().route("/socket/websocket", get(ws_handler));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

async fn next_event(events: &mut tokio::sync::broadcast::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for server event")
        .expect("event stream closed")
}

#[tokio::test]
async fn websocket_channel_round_trips_frames() {
    let server_url = spawn_server().await;
    let channel = WebSocketChannel::new(server_url, "job_updates:7");
    let mut events = channel.subscribe();

    channel.connect().await.expect("connect");
    assert!(*channel.connectivity().borrow());

    let greeting = next_event(&mut events).await;
    assert!(matches!(greeting, ServerEvent::InitialJobs { .. }));

    let envelope = ClientEnvelope::new(ClientRequest::GetJobs {});
    channel.publish(&envelope).await.expect("publish");

    match next_event(&mut events).await {
        ServerEvent::Reply {
            request_id,
            response,
        } => {
            assert_eq!(request_id, Some(envelope.request_id));
            assert_eq!(response["echoed"], "get_jobs");
            assert_eq!(response["topic"], "job_updates:7");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    channel.leave().await;
    assert!(!*channel.connectivity().borrow());
}

#[tokio::test]
async fn connecting_twice_does_not_rejoin() {
    let server_url = spawn_server().await;
    let channel = WebSocketChannel::new(server_url, "session_list");
    let mut events = channel.subscribe();

    channel.connect().await.expect("connect");
    channel.connect().await.expect("repeat connect is a no-op");

    let greeting = next_event(&mut events).await;
    assert!(matches!(greeting, ServerEvent::InitialJobs { .. }));

    // A second join would have produced a second greeting.
    let extra = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(extra.is_err(), "repeat connect must not re-run the join");
}

#[tokio::test]
async fn publish_before_connect_fails_locally() {
    let channel = WebSocketChannel::new("http://127.0.0.1:9", "session_list");
    let err = channel
        .publish(&ClientEnvelope::new(ClientRequest::RefreshJobs {}))
        .await
        .expect_err("publish without a connection must fail");
    assert!(err.to_string().contains("not connected"));
}
