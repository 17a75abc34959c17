//! 记录并确认消息的处理器
//!
//! 激活邮件、找回密码等具体业务由对应服务实现，这里只校验并记录收到的消息。

use async_trait::async_trait;
use messaging::{Envelope, HandlerError, MessageHandler};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// 邮件类消息的数据
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EmailRequest {
    pub email: String,
    pub activation_code: String,
    pub template_name: String,
    #[serde(rename = "userName")]
    pub user_name: String,
}

fn email_subject(kind: &str) -> Option<&'static str> {
    match kind {
        "active_user" => Some("账户激活"),
        "forgot_password" => Some("重置密码"),
        _ => None,
    }
}

pub struct LoggingHandler {
    /// 为空时处理所有类型
    handled_types: HashSet<String>,
}

impl LoggingHandler {
    pub fn new(handled_types: impl IntoIterator<Item = String>) -> Self {
        Self {
            handled_types: handled_types.into_iter().collect(),
        }
    }

    pub fn handles(&self, kind: &str) -> bool {
        self.handled_types.is_empty() || self.handled_types.contains(kind)
    }
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        if !self.handles(&envelope.kind) {
            debug!(message_type = %envelope.kind, "忽略未处理的消息类型");
            return Ok(());
        }

        if let Some(subject) = email_subject(&envelope.kind) {
            // 数据不是对象时返回错误，交给重试策略
            let request: EmailRequest = envelope.data_as()?;
            if request.email.is_empty() || request.template_name.is_empty() {
                warn!(message_id = ?envelope.id, "邮件消息缺少收件人或模板: {:?}", request);
            }
            info!(
                message_id = ?envelope.id,
                message_type = %envelope.kind,
                retry_count = envelope.retry_count,
                recipient = %request.email,
                template = %request.template_name,
                subject,
                "收到邮件请求"
            );
            return Ok(());
        }

        info!(
            message_id = ?envelope.id,
            message_type = %envelope.kind,
            from_service = ?envelope.from_service,
            retry_count = envelope.retry_count,
            data = %envelope.payload,
            "收到服务消息"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_type_set_handles_everything() {
        let handler = LoggingHandler::new(Vec::new());
        assert!(handler.handles("user_created"));
    }

    #[tokio::test]
    async fn test_unhandled_type_is_acknowledged() {
        let handler = LoggingHandler::new(vec!["active_user".to_string()]);
        assert!(!handler.handles("user_created"));
        assert!(handler
            .handle(Envelope::new("user_created", json!({})))
            .await
            .is_ok());
        assert!(handler
            .handle(Envelope::new("active_user", json!({"email": "a@b.c"})))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_email_payload_must_be_object() {
        let handler = LoggingHandler::new(Vec::new());
        let request = json!({
            "email": "a@b.c",
            "activation_code": "123456",
            "template_name": "activation.html",
            "userName": "ayse"
        });

        assert!(handler
            .handle(Envelope::new("forgot_password", request))
            .await
            .is_ok());
        assert!(handler
            .handle(Envelope::new("active_user", json!("a@b.c")))
            .await
            .is_err());
        // 非邮件类型不校验数据
        assert!(handler
            .handle(Envelope::new("user_created", json!("anything")))
            .await
            .is_ok());
    }
}
