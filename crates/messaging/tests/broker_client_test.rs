use async_trait::async_trait;
use chrono::Utc;
use config::BrokerConfig;
use messaging::transport::{
    BrokerChannel, BrokerConnector, DeliveryStream, ExchangeKind, MemoryConnector,
    OutboundMessage, QueueOptions,
};
use messaging::{
    BrokerClient, BrokerError, BrokerResult, Envelope, HandlerError, MemoryBroker, MessageHandler,
    ServiceType,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// 记录收到的消息，可配置为总是失败
struct RecordingHandler {
    received: Mutex<Vec<Envelope>>,
    fail: bool,
}

impl RecordingHandler {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    fn received(&self) -> Vec<Envelope> {
        self.received.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        self.received.lock().unwrap().push(envelope);
        if self.fail {
            Err("handler failed".into())
        } else {
            Ok(())
        }
    }
}

/// 可让发布一直挂起的连接器，其余操作交给内存代理
struct StallingConnector {
    inner: Arc<MemoryConnector>,
    stall: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnector for StallingConnector {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let inner = self.inner.connect().await?;
        Ok(Arc::new(StallingChannel {
            inner,
            stall: Arc::clone(&self.stall),
        }))
    }
}

struct StallingChannel {
    inner: Arc<dyn BrokerChannel>,
    stall: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerChannel for StallingChannel {
    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<()> {
        self.inner.declare_exchange(name, kind, durable).await
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BrokerResult<()> {
        self.inner.declare_queue(name, options).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.inner.bind_queue(queue, exchange, routing_key).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BrokerResult<()> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.publish(exchange, routing_key, message).await
    }

    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream> {
        self.inner.consume(queue).await
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.close().await
    }
}

fn test_config() -> BrokerConfig {
    BrokerConfig {
        health_check_interval_ms: 100,
        reconnect_delay_ms: 100,
        retry_types: vec!["active_user".to_string(), "forgot_password".to_string()],
        ..BrokerConfig::default()
    }
}

async fn client(broker: &MemoryBroker, service: ServiceType) -> BrokerClient {
    BrokerClient::connect(test_config(), service, broker.connector())
        .await
        .unwrap()
}

/// 等待条件成立，最多约 2 秒
async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_publish_fills_id_created_and_sender() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let email = client(&broker, ServiceType::Email).await;

    let handler = RecordingHandler::ok();
    email.consume(handler.clone()).await.unwrap();

    auth.publish(Envelope::new("user_created", json!({"id": "u1"})))
        .await
        .unwrap();

    assert!(wait_until(|| handler.count() == 1).await);
    let received = &handler.received()[0];
    assert!(received.id.is_some());
    assert!(received.created_at.is_some());
    assert_eq!(received.from_service, Some(ServiceType::Auth));
    assert_eq!(received.payload["id"], "u1");
    assert_eq!(received.retry_count, 0);
}

#[tokio::test]
async fn test_publish_keeps_caller_id_and_created() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let email = client(&broker, ServiceType::Email).await;

    let handler = RecordingHandler::ok();
    email.consume(handler.clone()).await.unwrap();

    let created = Utc::now() - chrono::Duration::minutes(5);
    auth.publish(
        Envelope::new("user_created", json!({}))
            .with_id("caller-id")
            .with_created_at(created),
    )
    .await
    .unwrap();

    assert!(wait_until(|| handler.count() == 1).await);
    let received = &handler.received()[0];
    assert_eq!(received.id.as_deref(), Some("caller-id"));
    assert_eq!(received.created_at, Some(created));
}

#[tokio::test]
async fn test_self_addressed_publish_rejected() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;

    let result = auth
        .publish(Envelope::new("user_created", json!({})).to(ServiceType::Auth))
        .await;
    assert!(matches!(result, Err(BrokerError::InvalidTargetError { .. })));
}

#[tokio::test]
async fn test_broadcast_reaches_every_service_queue() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let email = client(&broker, ServiceType::Email).await;
    let chat = client(&broker, ServiceType::Chat).await;

    let email_handler = RecordingHandler::ok();
    let chat_handler = RecordingHandler::ok();
    email.consume(email_handler.clone()).await.unwrap();
    chat.consume(chat_handler.clone()).await.unwrap();

    let mut envelope = Envelope::new("user_created", json!({"id": "u1"}));
    envelope.to_service = None;
    auth.publish(envelope).await.unwrap();

    assert!(wait_until(|| email_handler.count() == 1 && chat_handler.count() == 1).await);
    assert_eq!(broker.queue_depth("email.queue"), 0);
    assert_eq!(broker.queue_depth("chat.queue"), 0);
}

#[tokio::test]
async fn test_targeted_message_skipped_by_other_services() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let email = client(&broker, ServiceType::Email).await;
    let chat = client(&broker, ServiceType::Chat).await;

    let email_handler = RecordingHandler::ok();
    let chat_handler = RecordingHandler::ok();
    email.consume(email_handler.clone()).await.unwrap();
    chat.consume(chat_handler.clone()).await.unwrap();

    auth.publish(Envelope::new("active_user", json!({})).to(ServiceType::Email))
        .await
        .unwrap();

    assert!(wait_until(|| email_handler.count() == 1).await);
    // 其他服务确认并跳过，不进入处理器
    assert!(wait_until(|| broker.queue_depth("chat.queue") == 0).await);
    assert_eq!(chat_handler.count(), 0);
    assert!(broker.dropped("chat.queue").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failing_handler_retries_up_to_max_then_drops() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let email = client(&broker, ServiceType::Email).await;

    let handler = RecordingHandler::failing();
    email.consume(handler.clone()).await.unwrap();

    auth.publish(Envelope::new("active_user", json!({"email": "a@b.c"})))
        .await
        .unwrap();

    // 每次重试间隔 5 秒
    sleep(Duration::from_secs(60)).await;

    let counts: Vec<u32> = handler
        .received()
        .iter()
        .map(|envelope| envelope.retry_count)
        .collect();
    assert_eq!(counts, vec![0, 1, 2, 3]);

    // 每次失败的原消息都被丢弃，不重新入队
    assert_eq!(broker.dropped("email.queue").len(), 4);
    assert_eq!(broker.queue_depth("email.queue"), 0);

    let ids: Vec<_> = handler.received().iter().map(|e| e.id.clone()).collect();
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test(start_paused = true)]
async fn test_retry_survives_connection_loss_during_delay() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let email = client(&broker, ServiceType::Email).await;

    let handler = RecordingHandler::failing();
    email.consume(handler.clone()).await.unwrap();

    auth.publish(Envelope::new("active_user", json!({"email": "a@b.c"})))
        .await
        .unwrap();
    assert!(wait_until(|| handler.count() == 1).await);

    // 重试到期时连接仍不可用，约 10 秒后才能重连
    broker.refuse_connections(200);
    broker.sever_connections();

    sleep(Duration::from_millis(5_500)).await;
    assert!(!email.is_connected());
    assert_eq!(handler.count(), 1);

    sleep(Duration::from_secs(25)).await;
    assert!(email.is_connected());

    let counts: Vec<u32> = handler
        .received()
        .iter()
        .map(|envelope| envelope.retry_count)
        .collect();
    assert_eq!(counts, vec![0, 1, 2, 3]);
    assert_eq!(broker.dropped("email.queue").len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_pending_retry_abandoned_after_close() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let email = client(&broker, ServiceType::Email).await;

    let handler = RecordingHandler::failing();
    email.consume(handler.clone()).await.unwrap();

    auth.publish(Envelope::new("active_user", json!({})))
        .await
        .unwrap();
    assert!(wait_until(|| handler.count() == 1).await);

    broker.refuse_connections(u32::MAX);
    broker.sever_connections();
    sleep(Duration::from_secs(6)).await;
    email.close().await.unwrap();

    sleep(Duration::from_secs(30)).await;
    assert_eq!(handler.count(), 1);
    assert_eq!(broker.queue_depth("email.queue"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_for_configured_delay() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let email = client(&broker, ServiceType::Email).await;

    let handler = RecordingHandler::failing();
    email.consume(handler.clone()).await.unwrap();

    auth.publish(Envelope::new("forgot_password", json!({})))
        .await
        .unwrap();

    sleep(Duration::from_millis(4_900)).await;
    assert_eq!(handler.count(), 1);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(handler.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_type_outside_retry_set_is_never_redelivered() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let email = client(&broker, ServiceType::Email).await;

    let handler = RecordingHandler::failing();
    email.consume(handler.clone()).await.unwrap();

    auth.publish(Envelope::new("user_created", json!({})))
        .await
        .unwrap();

    sleep(Duration::from_secs(60)).await;
    assert_eq!(handler.count(), 1);
    assert_eq!(broker.dropped("email.queue").len(), 1);
}

#[tokio::test]
async fn test_malformed_body_dropped_without_handler() {
    let broker = MemoryBroker::new();
    let chat = client(&broker, ServiceType::Chat).await;

    let handler = RecordingHandler::ok();
    chat.consume(handler.clone()).await.unwrap();

    let raw = broker.connector().connect().await.unwrap();
    raw.publish(
        "microservices.broadcast",
        "",
        OutboundMessage {
            body: b"{not json".to_vec(),
            content_type: "application/json",
            message_id: "raw-1".to_string(),
            timestamp: Utc::now(),
            priority: 0,
            headers: HashMap::new(),
            persistent: true,
            mandatory: true,
        },
    )
    .await
    .unwrap();

    assert!(wait_until(|| broker.dropped("chat.queue").len() == 1).await);
    assert_eq!(handler.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_transport_closure() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let email = client(&broker, ServiceType::Email).await;

    let handler = RecordingHandler::ok();
    email.consume(handler.clone()).await.unwrap();

    broker.sever_connections();
    let result = auth
        .publish(Envelope::new("user_created", json!({})))
        .await;
    assert!(matches!(result, Err(BrokerError::PublishError { .. })));

    // 一个健康检查间隔内完成重连
    sleep(Duration::from_millis(150)).await;
    assert!(auth.is_connected());
    assert_eq!(auth.reconnect_count(), 1);
    assert_eq!(email.reconnect_count(), 1);

    auth.publish(Envelope::new("user_created", json!({"after": true})))
        .await
        .unwrap();

    // 消费循环在新通道上重新订阅
    sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.count(), 1);
    assert_eq!(handler.received()[0].payload["after"], true);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_retries_with_fixed_delay() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;

    broker.refuse_connections(2);
    broker.sever_connections();

    sleep(Duration::from_millis(150)).await;
    assert!(!auth.is_connected());

    sleep(Duration::from_millis(300)).await;
    assert!(auth.is_connected());
    assert_eq!(auth.reconnect_count(), 1);

    auth.publish(Envelope::new("user_created", json!({})))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_publish_deadline_releases_channel() {
    let broker = MemoryBroker::new();
    let stall = Arc::new(AtomicBool::new(true));
    let connector = Arc::new(StallingConnector {
        inner: broker.connector(),
        stall: Arc::clone(&stall),
    });
    let auth = BrokerClient::connect(test_config(), ServiceType::Auth, connector)
        .await
        .unwrap();
    let email = client(&broker, ServiceType::Email).await;

    let handler = RecordingHandler::ok();
    email.consume(handler.clone()).await.unwrap();

    let result = auth
        .publish_with_timeout(
            Envelope::new("user_created", json!({"first": true})),
            Duration::from_secs(1),
        )
        .await;
    assert!(matches!(result, Err(BrokerError::TimeoutError { .. })));

    // 超时后互斥锁已释放，同一通道可以继续发布
    stall.store(false, Ordering::SeqCst);
    auth.publish_with_timeout(
        Envelope::new("user_created", json!({"second": true})),
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    assert!(wait_until(|| handler.count() == 1).await);
    assert_eq!(handler.received()[0].payload["second"], true);
    assert!(auth.is_connected());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let clone = auth.clone();

    auth.close().await.unwrap();
    clone.close().await.unwrap();

    assert!(!auth.is_connected());
    assert_eq!(broker.open_channel_count(), 0);
    assert!(matches!(
        clone.publish(Envelope::new("user_created", json!({}))).await,
        Err(BrokerError::Closed)
    ));
    assert!(matches!(
        auth.consume(RecordingHandler::ok()).await,
        Err(BrokerError::Closed)
    ));
}

#[tokio::test]
async fn test_consume_survives_close_of_other_client() {
    let broker = MemoryBroker::new();
    let auth = client(&broker, ServiceType::Auth).await;
    let email = client(&broker, ServiceType::Email).await;
    let handler = RecordingHandler::ok();
    email.consume(handler.clone()).await.unwrap();

    auth.publish(Envelope::new("user_created", json!({})))
        .await
        .unwrap();
    auth.close().await.unwrap();

    assert!(wait_until(|| handler.count() == 1).await);
    assert!(email.is_connected());
}
