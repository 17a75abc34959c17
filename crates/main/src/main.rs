//! 服务节点入口
//!
//! 连接消息代理和 Redis，启动注册表、桥接和 HTTP/WebSocket 服务。

use anyhow::Context;
use config::AppConfig;
use messaging::{BrokerClient, KafkaConnector, ServiceType};
use realtime::{
    Bridge, ControlPlane, EventFamily, Hub, RealtimeState, RedisControlPlane, StatusPublisher,
};
use service_node::{router, AppState, LoggingHandler};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，默认 info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    let service = ServiceType::from(config.service.name.as_str());
    info!(service = %service, "服务启动中...");

    // 消息代理
    let connector = Arc::new(KafkaConnector::new(&config.broker));
    let broker = BrokerClient::connect(config.broker.clone(), service.clone(), connector)
        .await
        .context("连接消息代理失败")?;

    if config.service.consume {
        let handler = Arc::new(LoggingHandler::new(
            config.service.handled_types.iter().cloned(),
        ));
        broker.consume(handler).await.context("启动消费者失败")?;
    }

    // 跨实例发布订阅
    let control_plane: Arc<dyn ControlPlane> = Arc::new(
        RedisControlPlane::connect(&config.redis.url)
            .await
            .context("连接 Redis 失败")?,
    );

    let user_hub = Hub::spawn("users");
    let chat_hub = Hub::spawn("chats");
    let resubscribe_interval = config.redis.resubscribe_interval();

    Bridge::new(
        EventFamily::Presence,
        config.redis.status_channel.clone(),
        user_hub.clone(),
        Arc::clone(&control_plane),
        resubscribe_interval,
    )
    .spawn();
    Bridge::new(
        EventFamily::Chat,
        config.redis.chat_channel.clone(),
        chat_hub.clone(),
        Arc::clone(&control_plane),
        resubscribe_interval,
    )
    .spawn();

    let realtime = RealtimeState {
        user_hub,
        chat_hub,
        publisher: StatusPublisher::from_config(control_plane, &config.redis),
    };
    let app = router(AppState::new(broker.clone(), realtime));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址 {} 失败", addr))?;

    info!("服务启动在 http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    broker.close().await?;
    info!(service = %service, "服务已停止");
    Ok(())
}

/// 等待 Ctrl+C 或终止信号
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("监听 Ctrl+C 失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig_term) => {
                sig_term.recv().await;
            }
            Err(e) => {
                warn!("监听终止信号失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("接收到 Ctrl+C 信号，开始优雅停机..."),
        _ = terminate => info!("接收到终止信号，开始优雅停机..."),
    }
}
