//! 进程内发布订阅

use super::{ControlPlane, PayloadStream};
use crate::error::{ControlPlaneError, ControlPlaneResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// 基于 `tokio::sync::broadcast` 的发布订阅，克隆共享同一组频道
#[derive(Clone)]
pub struct LocalControlPlane {
    capacity: usize,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl LocalControlPlane {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalControlPlane {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn publish(&self, channel: &str, payload: String) -> ControlPlaneResult<usize> {
        let sender = self.sender(channel);
        if sender.receiver_count() == 0 {
            return Ok(0);
        }
        sender
            .send(payload)
            .map_err(|e| ControlPlaneError::PublishError {
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, channel: &str) -> ControlPlaneResult<PayloadStream> {
        let receiver = self.sender(channel).subscribe();
        let stream = BroadcastStream::new(receiver).map(|item| {
            item.map_err(|e| ControlPlaneError::SubscribeError {
                message: format!("订阅者落后: {}", e),
            })
        });
        Ok(stream.boxed())
    }
}
