//! 消息消费
//!
//! 每个客户端一个投递循环：反序列化 → 调用处理器 → 成功则确认。
//! 处理失败时交给重试策略，可重试的消息延迟后经重试交换器重新发布，
//! 连接中断时等到重连后再发布；原消息一律否认且不重新入队。

use crate::client::ClientShared;
use crate::envelope::Envelope;
use crate::error::{BrokerError, BrokerResult};
use crate::transport::{Delivery, DeliveryStream};
use std::future::Future;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// 处理器返回的错误
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// 消息处理器 trait
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// 处理一条消息，返回错误时进入重试流程
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError>;
}

/// 由异步闭包构造的处理器
pub struct FnHandler<F> {
    func: F,
}

/// 把异步闭包包装为 [`MessageHandler`]
pub fn handler_fn<F, Fut>(func: F) -> Arc<FnHandler<F>>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { func })
}

#[async_trait::async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        (self.func)(envelope).await
    }
}

/// 在当前通道上声明服务队列并开始消费
pub(crate) async fn subscribe(shared: &ClientShared) -> BrokerResult<(String, DeliveryStream)> {
    let channel = shared.channel().await;
    let queue = shared
        .topology
        .declare_service_queue(channel.as_ref(), &shared.service)
        .await?;

    let deliveries = channel.consume(&queue).await.map_err(|e| match e {
        BrokerError::ConsumeSetupError { .. } => e,
        other => BrokerError::consume_setup(format!("订阅队列 {} 失败: {}", queue, other)),
    })?;

    info!(service = %shared.service, queue = %queue, "开始消费");
    Ok((queue, deliveries))
}

/// 投递循环，连接恢复后重新订阅，客户端关闭后退出
pub(crate) async fn delivery_loop<H>(
    shared: Arc<ClientShared>,
    queue: String,
    mut deliveries: DeliveryStream,
    handler: Arc<H>,
) where
    H: MessageHandler + 'static,
{
    let mut generation = shared.watch_generation();
    generation.borrow_and_update();

    loop {
        while let Some(delivery) = deliveries.recv().await {
            process_delivery(&shared, &queue, delivery, handler.as_ref()).await;
        }

        if shared.is_closed() {
            break;
        }
        warn!(service = %shared.service, queue = %queue, "投递流已结束，等待重新订阅");

        // 等待重连完成；通道仍可用时按重连间隔重试
        tokio::select! {
            changed = generation.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep(shared.config.reconnect_delay()) => {}
        }
        if shared.is_closed() {
            break;
        }

        match subscribe(&shared).await {
            Ok((_, stream)) => {
                deliveries = stream;
                generation.borrow_and_update();
            }
            Err(e) => {
                warn!(service = %shared.service, queue = %queue, "重新订阅失败: {}", e);
                let (_, empty) = tokio::sync::mpsc::unbounded_channel();
                deliveries = empty;
            }
        }
    }

    info!(service = %shared.service, queue = %queue, "消费循环退出");
}

/// 处理单条投递
async fn process_delivery<H>(shared: &Arc<ClientShared>, queue: &str, delivery: Delivery, handler: &H)
where
    H: MessageHandler + ?Sized,
{
    let envelope = match Envelope::from_slice(&delivery.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(queue = %queue, "丢弃无法解析的消息: {}", e);
            if let Err(e) = delivery.nack(false).await {
                warn!(queue = %queue, "否认消息失败: {}", e);
            }
            return;
        }
    };

    if !envelope.is_addressed_to(&shared.service) {
        debug!(
            queue = %queue,
            message_id = ?envelope.id,
            to_service = ?envelope.to_service,
            "消息目标不是本服务，跳过"
        );
        settle_ack(queue, delivery).await;
        return;
    }

    debug!(
        queue = %queue,
        message_id = ?envelope.id,
        message_type = %envelope.kind,
        retry_count = envelope.retry_count,
        redelivered = delivery.redelivered,
        "收到消息"
    );

    match handler.handle(envelope.clone()).await {
        Ok(()) => settle_ack(queue, delivery).await,
        Err(e) => {
            warn!(
                queue = %queue,
                message_id = ?envelope.id,
                message_type = %envelope.kind,
                retry_count = envelope.retry_count,
                "处理消息失败: {}",
                e
            );

            if shared.retry.should_retry(&envelope) {
                schedule_retry(Arc::clone(shared), queue.to_string(), envelope);
            } else {
                debug!(queue = %queue, message_type = %envelope.kind, "消息不再重试，丢弃");
            }

            if let Err(e) = delivery.nack(false).await {
                warn!(queue = %queue, "否认消息失败: {}", e);
            }
        }
    }
}

async fn settle_ack(queue: &str, delivery: Delivery) {
    if let Err(e) = delivery.ack().await {
        warn!(queue = %queue, "确认消息失败: {}", e);
    }
}

/// 延迟后把消息重新发布到重试交换器，路由键为队列名
///
/// 发布失败时等待重连后再次发布，直到成功或客户端关闭。
fn schedule_retry(shared: Arc<ClientShared>, queue: String, envelope: Envelope) {
    let next = shared.retry.next_attempt(envelope);
    let delay = shared.retry.delay_for(next.retry_count);

    info!(
        queue = %queue,
        message_id = ?next.id,
        message_type = %next.kind,
        retry_count = next.retry_count,
        "{:?} 后重试消息",
        delay
    );

    tokio::spawn(async move {
        let mut generation = shared.watch_generation();
        sleep(delay).await;

        let exchange = shared.topology.retry_exchange().to_string();
        loop {
            if shared.is_closed() {
                warn!(queue = %queue, message_id = ?next.id, "客户端已关闭，放弃重试");
                return;
            }

            match shared.publish_envelope(&exchange, &queue, &next).await {
                Ok(()) => {
                    debug!(queue = %queue, message_id = ?next.id, "重试消息已发布");
                    return;
                }
                Err(BrokerError::Closed) => {
                    warn!(queue = %queue, message_id = ?next.id, "客户端已关闭，放弃重试");
                    return;
                }
                Err(e) => warn!(
                    queue = %queue,
                    message_id = ?next.id,
                    retry_count = next.retry_count,
                    "重新发布消息失败: {}，连接恢复后再试",
                    e
                ),
            }

            tokio::select! {
                changed = generation.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = sleep(shared.config.reconnect_delay()) => {}
            }
        }
    });
}
