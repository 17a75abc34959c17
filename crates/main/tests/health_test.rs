use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use config::BrokerConfig;
use messaging::{BrokerClient, MemoryBroker, ServiceType};
use realtime::{Hub, LocalControlPlane, RealtimeState, StatusPublisher};
use serde_json::Value;
use service_node::{router, AppState};
use std::sync::Arc;
use tower::ServiceExt;

async fn app_state(broker: &MemoryBroker) -> AppState {
    let client = BrokerClient::connect(
        BrokerConfig::default(),
        ServiceType::Chat,
        broker.connector(),
    )
    .await
    .unwrap();

    let realtime = RealtimeState {
        user_hub: Hub::spawn("users"),
        chat_hub: Hub::spawn("chats"),
        publisher: StatusPublisher::new(
            Arc::new(LocalControlPlane::default()),
            "user_status",
            "send_Message",
        ),
    };
    AppState::new(client, realtime)
}

async fn get_health(state: AppState) -> (StatusCode, Value) {
    let response = router(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_reports_connected_broker() {
    let broker = MemoryBroker::new();
    let state = app_state(&broker).await;

    let (status, body) = get_health(state).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "chat");
    assert_eq!(body["broker"]["connected"], true);
    assert_eq!(body["broker"]["reconnects"], 0);
    assert_eq!(body["hubs"]["user_keys"], 0);
}

#[tokio::test]
async fn test_health_degraded_after_close() {
    let broker = MemoryBroker::new();
    let state = app_state(&broker).await;
    state.broker.close().await.unwrap();

    let (status, body) = get_health(state).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["broker"]["connected"], false);
}

#[tokio::test]
async fn test_realtime_routes_are_mounted() {
    let broker = MemoryBroker::new();
    let state = app_state(&broker).await;

    let response = router(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chats/c1/messages")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"sender_id":"u1","content":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}
