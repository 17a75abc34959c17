//! 服务间消息信封
//!
//! 线上格式为 JSON 对象：
//! `{id, type, data, created, from_service, to_service, retry_count, priority, headers}`。
//! `to_service` 为空字符串表示广播给所有订阅服务。

use crate::error::{BrokerError, BrokerResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// 优先级上限（含）
pub const MAX_PRIORITY: u8 = 9;

/// 自定义消息元数据
pub type Headers = HashMap<String, serde_json::Value>;

/// 微服务身份
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServiceType {
    Auth,
    User,
    Email,
    Chat,
    Custom(String),
}

impl ServiceType {
    pub fn as_str(&self) -> &str {
        match self {
            ServiceType::Auth => "auth",
            ServiceType::User => "user",
            ServiceType::Email => "email",
            ServiceType::Chat => "chat",
            ServiceType::Custom(name) => name,
        }
    }
}

impl From<&str> for ServiceType {
    fn from(value: &str) -> Self {
        match value {
            "auth" => ServiceType::Auth,
            "user" => ServiceType::User,
            "email" => ServiceType::Email,
            "chat" => ServiceType::Chat,
            other => ServiceType::Custom(other.to_string()),
        }
    }
}

impl From<String> for ServiceType {
    fn from(value: String) -> Self {
        ServiceType::from(value.as_str())
    }
}

impl From<ServiceType> for String {
    fn from(value: ServiceType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 空字符串与 `None` 互相映射
mod empty_as_none {
    use super::ServiceType;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<ServiceType>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value.as_ref().map(ServiceType::as_str).unwrap_or(""))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<ServiceType>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.filter(|name| !name.is_empty()).map(ServiceType::from))
    }
}

/// 消息信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// 全局唯一ID，发布时缺失则生成
    #[serde(default)]
    pub id: Option<String>,
    /// 消息类型，消费者和重试策略依此路由
    #[serde(rename = "type")]
    pub kind: String,
    /// 业务数据，结构由消息类型决定
    #[serde(rename = "data", default)]
    pub payload: serde_json::Value,
    /// 创建时间，发布时缺失则补齐
    #[serde(rename = "created", default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "empty_as_none")]
    pub from_service: Option<ServiceType>,
    #[serde(default, with = "empty_as_none")]
    pub to_service: Option<ServiceType>,
    #[serde(default, deserialize_with = "clamped_retry_count")]
    pub retry_count: u32,
    #[serde(default, deserialize_with = "clamped_priority")]
    pub priority: u8,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub headers: Headers,
}

/// 对端可能把空的 headers 编码为 `null`
fn null_as_empty<'de, D>(deserializer: D) -> Result<Headers, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Headers>::deserialize(deserializer)?.unwrap_or_default())
}

/// 对端以有符号整数编码，越界值截断到合法范围
fn clamped_retry_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?.unwrap_or(0);
    Ok(raw.clamp(0, i64::from(u32::MAX)) as u32)
}

fn clamped_priority<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?.unwrap_or(0);
    Ok(raw.clamp(0, i64::from(MAX_PRIORITY)) as u8)
}

impl Envelope {
    /// 创建广播消息
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            payload,
            created_at: None,
            from_service: None,
            to_service: None,
            retry_count: 0,
            priority: 0,
            headers: Headers::new(),
        }
    }

    pub fn to(mut self, service: ServiceType) -> Self {
        self.to_service = Some(service);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_service.is_none()
    }

    /// 广播消息或目标为 `service` 的消息
    pub fn is_addressed_to(&self, service: &ServiceType) -> bool {
        self.to_service.as_ref().map_or(true, |target| target == service)
    }

    /// 发布前补齐字段：缺失的 id/created 被补齐，已有值保持不变；
    /// 来源服务盖章为 `sender`；拒绝发给自身的消息。
    pub fn prepare_for_publish(mut self, sender: &ServiceType) -> BrokerResult<Self> {
        if self.to_service.as_ref() == Some(sender) {
            return Err(BrokerError::InvalidTargetError {
                service: sender.to_string(),
            });
        }

        if self.id.as_deref().map_or(true, str::is_empty) {
            self.id = Some(Uuid::new_v4().to_string());
        }
        if self.created_at.is_none() {
            self.created_at = Some(Utc::now());
        }
        self.from_service = Some(sender.clone());
        self.priority = self.priority.min(MAX_PRIORITY);

        Ok(self)
    }

    /// 反序列化业务数据
    pub fn data_as<T: DeserializeOwned>(&self) -> BrokerResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            BrokerError::DeserializationError {
                message: format!("消息 {} 的数据格式无效: {}", self.kind, e),
            }
        })
    }

    pub fn to_bytes(&self) -> BrokerResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BrokerError::SerializationError {
            message: format!("序列化消息失败: {}", e),
        })
    }

    pub fn from_slice(body: &[u8]) -> BrokerResult<Self> {
        serde_json::from_slice(body).map_err(|e| BrokerError::DeserializationError {
            message: format!("反序列化消息失败: {}", e),
        })
    }
}
