use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use realtime::{
    router, Bridge, ControlPlane, EventFamily, Hub, LocalControlPlane, RealtimeState,
    StatusPublisher,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 一个服务实例：两个注册表和两条桥接，共享同一个发布订阅
fn instance(plane: Arc<LocalControlPlane>) -> RealtimeState {
    let user_hub = Hub::spawn("users");
    let chat_hub = Hub::spawn("chats");
    let control_plane: Arc<dyn ControlPlane> = plane;

    Bridge::new(
        EventFamily::Presence,
        "user_status",
        user_hub.clone(),
        Arc::clone(&control_plane),
        Duration::from_millis(10),
    )
    .spawn();
    Bridge::new(
        EventFamily::Chat,
        "send_Message",
        chat_hub.clone(),
        Arc::clone(&control_plane),
        Duration::from_millis(10),
    )
    .spawn();

    RealtimeState {
        user_hub,
        chat_hub,
        publisher: StatusPublisher::new(control_plane, "user_status", "send_Message"),
    }
}

async fn serve(state: RealtimeState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{}{}", addr, path))
        .await
        .unwrap();
    client
}

async fn wait_for_connections(hub: &Hub, key: &str, expected: usize) {
    for _ in 0..200 {
        if hub.connection_count(key).await == expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("{} 下的连接数未达到 {}", key, expected);
}

async fn next_json(client: &mut Client) -> Value {
    timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(text.as_str()).unwrap()
                }
                Some(Ok(_)) => continue,
                other => panic!("连接意外结束: {:?}", other),
            }
        }
    })
    .await
    .expect("等待事件超时")
}

async fn post_message(state: RealtimeState, chat_id: &str, body: Value) -> StatusCode {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/chats/{}/messages", chat_id))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    router(state).oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn test_chat_message_crosses_instances() {
    let plane = Arc::new(LocalControlPlane::default());
    let a = instance(plane.clone());
    let b = instance(plane.clone());
    let addr = serve(a.clone()).await;
    sleep(Duration::from_millis(20)).await;

    let mut client = connect(addr, "/ws/chats/c1").await;
    wait_for_connections(&a.chat_hub, "c1", 1).await;

    let status = post_message(b, "c1", json!({"sender_id": "u7", "content": "hello: world"})).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    assert_eq!(
        next_json(&mut client).await,
        json!({"event": "send_Message", "chatID": "c1", "content": "hello: world", "senderID": "u7"})
    );
}

#[tokio::test]
async fn test_empty_message_rejected() {
    let plane = Arc::new(LocalControlPlane::default());
    let a = instance(plane);

    let status = post_message(a, "c1", json!({"sender_id": "u7", "content": ""})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_presence_online_and_offline_across_instances() {
    let plane = Arc::new(LocalControlPlane::default());
    let a = instance(plane.clone());
    let b = instance(plane.clone());
    let addr_a = serve(a.clone()).await;
    let addr_b = serve(b.clone()).await;
    sleep(Duration::from_millis(20)).await;

    let mut watcher = connect(addr_a, "/ws/users/u42").await;
    wait_for_connections(&a.user_hub, "u42", 1).await;
    // 自身接入产生的 online
    assert_eq!(
        next_json(&mut watcher).await,
        json!({"event": "status_update", "userID": "u42", "status": "online"})
    );

    let mut second = connect(addr_b, "/ws/users/u42").await;
    wait_for_connections(&b.user_hub, "u42", 1).await;
    assert_eq!(next_json(&mut watcher).await["status"], "online");

    second.close(None).await.unwrap();
    assert_eq!(
        next_json(&mut watcher).await,
        json!({"event": "status_update", "userID": "u42", "status": "offline"})
    );
    wait_for_connections(&b.user_hub, "u42", 0).await;
    assert!(!b.user_hub.contains_key("u42").await);
    assert_eq!(a.user_hub.connection_count("u42").await, 1);
}

#[tokio::test]
async fn test_disconnect_removes_routing_key() {
    let plane = Arc::new(LocalControlPlane::default());
    let a = instance(plane);
    let addr = serve(a.clone()).await;

    let mut client = connect(addr, "/ws/chats/c9").await;
    wait_for_connections(&a.chat_hub, "c9", 1).await;
    assert_eq!(a.chat_hub.key_count().await, 1);

    client.send(Message::Close(None)).await.unwrap();
    wait_for_connections(&a.chat_hub, "c9", 0).await;
    assert_eq!(a.chat_hub.key_count().await, 0);
}
