//! 默认接收应用：记录收到的消息并接受

use async_trait::async_trait;
use hl7_core::Connector;
use hl7_dispatch::ReceivingApplication;
use hl7_mllp::ack::{ErrorCode, Rejection};
use hl7_mllp::Hl7Message;
use std::collections::HashSet;
use tracing::{info, warn};

/// 按消息类型过滤的接收应用，未配置类型时接受所有消息
#[derive(Debug, Default)]
pub struct LoggingApplication {
    accepted: HashSet<String>,
}

impl LoggingApplication {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只接受指定的消息类型（MSH-9.1）
    pub fn accepting<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accepted: codes.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ReceivingApplication for LoggingApplication {
    async fn receive(&self, message: &Hl7Message, connector: &Connector) -> Result<(), Rejection> {
        let code = message.message_code().unwrap_or_default();
        if !self.accepted.is_empty() && !self.accepted.contains(code) {
            warn!(connector = %connector.reference, "Rejecting unsupported message {}", message.name());
            return Err(Rejection::reject(
                ErrorCode::UnsupportedMessageType,
                format!("Unsupported message type: {}", message.name()),
            ));
        }
        info!(
            connector = %connector.reference,
            "Received {} from {}^{}, control id {}",
            message.name(),
            message.sending_application().unwrap_or_default(),
            message.sending_facility().unwrap_or_default(),
            message.control_id().unwrap_or_default()
        );
        Ok(())
    }
}
