//! 跨实例桥接
//!
//! 每个事件族一个接收循环：订阅频道，解析负载，推送给注册表中对应路由键的连接。
//! 无效负载静默丢弃；接收错误记录后继续；订阅断开后按间隔重新订阅。

use crate::control_plane::{ControlMessage, ControlPlane, EventFamily};
use crate::hub::{BroadcastReport, Hub};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub struct Bridge {
    family: EventFamily,
    channel: String,
    hub: Hub,
    control_plane: Arc<dyn ControlPlane>,
    resubscribe_interval: Duration,
}

impl Bridge {
    pub fn new(
        family: EventFamily,
        channel: impl Into<String>,
        hub: Hub,
        control_plane: Arc<dyn ControlPlane>,
        resubscribe_interval: Duration,
    ) -> Self {
        Self {
            family,
            channel: channel.into(),
            hub,
            control_plane,
            resubscribe_interval,
        }
    }

    /// 在后台运行接收循环
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// 接收循环，进程生命周期内运行
    pub async fn run(self) {
        info!(family = %self.family, channel = %self.channel, "桥接启动");

        loop {
            let mut stream = match self.control_plane.subscribe(&self.channel).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(channel = %self.channel, "订阅失败: {}，稍后重试", e);
                    sleep(self.resubscribe_interval).await;
                    continue;
                }
            };

            while let Some(item) = stream.next().await {
                match item {
                    Ok(payload) => {
                        self.dispatch(&payload).await;
                    }
                    Err(e) => warn!(channel = %self.channel, "接收消息失败: {}", e),
                }
            }

            warn!(channel = %self.channel, "订阅已断开，准备重新订阅");
            sleep(self.resubscribe_interval).await;
        }
    }

    /// 处理一条负载；无效负载返回 `None`
    pub async fn dispatch(&self, payload: &str) -> Option<BroadcastReport> {
        let message = match ControlMessage::decode(self.family, payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(channel = %self.channel, "跳过无效负载: {}", e);
                return None;
            }
        };

        let event = message.into_event();
        let report = self.hub.broadcast_to_key(event.routing_key(), &event).await;

        debug!(
            channel = %self.channel,
            routing_key = %event.routing_key(),
            delivered = report.delivered,
            failed = report.failed,
            "事件已推送"
        );
        Some(report)
    }
}
