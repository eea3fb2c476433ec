//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Hl7Error, Result};

/// 连接器引用（稳定标识，连接器生命周期内不变）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorRef(String);

impl ConnectorRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectorRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 连接器类型及传输参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectorKind {
    /// 发送方：连接远程主机
    Sender {
        host: String,
        port: u16,
        #[serde(default)]
        suspended: bool,
    },
    /// 接收方：监听本地端口
    Receiver { port: u16 },
}

/// 连接器（不可变，配置变化时整体替换）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub reference: ConnectorRef,
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    #[serde(default)]
    pub include_millis: bool,
    #[serde(default)]
    pub include_time_zone: bool,
    #[serde(flatten)]
    pub kind: ConnectorKind,
}

impl Connector {
    /// 创建发送方连接器
    pub fn sender(reference: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            reference: ConnectorRef::new(reference),
            sending_application: String::new(),
            sending_facility: String::new(),
            receiving_application: String::new(),
            receiving_facility: String::new(),
            include_millis: false,
            include_time_zone: false,
            kind: ConnectorKind::Sender {
                host: host.into(),
                port,
                suspended: false,
            },
        }
    }

    /// 创建接收方连接器
    pub fn receiver(reference: impl Into<String>, port: u16) -> Self {
        Self {
            reference: ConnectorRef::new(reference),
            sending_application: String::new(),
            sending_facility: String::new(),
            receiving_application: String::new(),
            receiving_facility: String::new(),
            include_millis: false,
            include_time_zone: false,
            kind: ConnectorKind::Receiver { port },
        }
    }

    pub fn with_sending(mut self, application: &str, facility: &str) -> Self {
        self.sending_application = application.to_string();
        self.sending_facility = facility.to_string();
        self
    }

    pub fn with_receiving(mut self, application: &str, facility: &str) -> Self {
        self.receiving_application = application.to_string();
        self.receiving_facility = facility.to_string();
        self
    }

    pub fn with_timestamp_format(mut self, include_millis: bool, include_time_zone: bool) -> Self {
        self.include_millis = include_millis;
        self.include_time_zone = include_time_zone;
        self
    }

    /// 返回挂起状态已修改的副本（仅对发送方有效）
    pub fn with_suspended(mut self, suspend: bool) -> Self {
        if let ConnectorKind::Sender { suspended, .. } = &mut self.kind {
            *suspended = suspend;
        }
        self
    }

    pub fn is_sender(&self) -> bool {
        matches!(self.kind, ConnectorKind::Sender { .. })
    }

    pub fn is_receiver(&self) -> bool {
        matches!(self.kind, ConnectorKind::Receiver { .. })
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.kind, ConnectorKind::Sender { suspended: true, .. })
    }

    /// 只有发送方的消息支持重新提交
    pub fn supports_resubmit(&self) -> bool {
        self.is_sender()
    }

    /// 入站或出站方向
    pub fn direction(&self) -> Direction {
        match self.kind {
            ConnectorKind::Sender { .. } => Direction::Outbound,
            ConnectorKind::Receiver { .. } => Direction::Inbound,
        }
    }

    /// 发送方的远程地址
    pub fn remote(&self) -> Option<(&str, u16)> {
        match &self.kind {
            ConnectorKind::Sender { host, port, .. } => Some((host.as_str(), *port)),
            ConnectorKind::Receiver { .. } => None,
        }
    }

    /// 接收方的监听端口
    pub fn listen_port(&self) -> Option<u16> {
        match self.kind {
            ConnectorKind::Receiver { port } => Some(port),
            ConnectorKind::Sender { .. } => None,
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConnectorKind::Sender { host, port, .. } => {
                write!(f, "{} (sender {}:{})", self.reference, host, port)
            }
            ConnectorKind::Receiver { port } => write!(f, "{} (receiver :{})", self.reference, port),
        }
    }
}

/// 出站消息格式选项，未设置的项继承自连接器
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageConfig {
    pub include_millis: Option<bool>,
    pub include_time_zone: Option<bool>,
}

impl MessageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_millis(mut self, value: bool) -> Self {
        self.include_millis = Some(value);
        self
    }

    pub fn include_time_zone(mut self, value: bool) -> Self {
        self.include_time_zone = Some(value);
        self
    }

    /// 解析最终格式: (include_millis, include_time_zone)
    pub fn resolve(&self, connector: &Connector) -> (bool, bool) {
        (
            self.include_millis.unwrap_or(connector.include_millis),
            self.include_time_zone.unwrap_or(connector.include_time_zone),
        )
    }
}

/// 消息方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "outbound" => Ok(Direction::Outbound),
            "inbound" => Ok(Direction::Inbound),
            other => Err(Hl7Error::Persistence(format!("Unknown direction: {}", other))),
        }
    }
}

/// 消息状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,  // 待发送
    Sent,     // 已发送并确认
    Error,    // 发送失败
    Received, // 入站审计记录
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Error => "ERROR",
            MessageStatus::Received => "RECEIVED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(MessageStatus::Pending),
            "SENT" => Ok(MessageStatus::Sent),
            "ERROR" => Ok(MessageStatus::Error),
            "RECEIVED" => Ok(MessageStatus::Received),
            other => Err(Hl7Error::Persistence(format!("Unknown message status: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Received)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 持久化的消息记录（不含消息内容）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub connector: ConnectorRef,
    pub direction: Direction,
    pub name: String,         // 例如 ADT_A01_1234.hl7
    pub author: String,       // 负责该消息的用户
    pub status: MessageStatus,
    pub mime_type: String,
    pub size: u64,
    pub checksum: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_at: Option<DateTime<Utc>>,
    pub error_text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_variants() {
        let sender = Connector::sender("pharmacy", "10.0.0.5", 2575);
        assert!(sender.is_sender());
        assert!(sender.supports_resubmit());
        assert_eq!(sender.remote(), Some(("10.0.0.5", 2575)));
        assert_eq!(sender.listen_port(), None);
        assert_eq!(sender.direction(), Direction::Outbound);

        let receiver = Connector::receiver("lab", 2576);
        assert!(receiver.is_receiver());
        assert!(!receiver.supports_resubmit());
        assert_eq!(receiver.listen_port(), Some(2576));
        assert_eq!(receiver.direction(), Direction::Inbound);
    }

    #[test]
    fn test_suspend_only_applies_to_senders() {
        let sender = Connector::sender("pharmacy", "localhost", 2575).with_suspended(true);
        assert!(sender.is_suspended());

        let receiver = Connector::receiver("lab", 2576).with_suspended(true);
        assert!(!receiver.is_suspended());
    }

    #[test]
    fn test_message_config_inherits_from_connector() {
        let connector = Connector::sender("pharmacy", "localhost", 2575).with_timestamp_format(true, false);
        assert_eq!(MessageConfig::new().resolve(&connector), (true, false));
        assert_eq!(
            MessageConfig::new().include_time_zone(true).resolve(&connector),
            (true, true)
        );
        assert_eq!(
            MessageConfig::new().include_millis(false).resolve(&connector),
            (false, false)
        );
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Sent,
            MessageStatus::Error,
            MessageStatus::Received,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(MessageStatus::parse("ACCEPTED").is_err());
    }

    #[test]
    fn test_connector_deserializes_tagged_kind() {
        let json = r#"{
            "reference": "pharmacy",
            "sending_application": "VPMS",
            "sending_facility": "MAIN",
            "receiving_application": "CUBEX",
            "receiving_facility": "PHARM",
            "include_millis": true,
            "type": "sender",
            "host": "cubex.local",
            "port": 2575
        }"#;
        let connector: Connector = serde_json::from_str(json).unwrap();
        assert_eq!(connector.reference.as_str(), "pharmacy");
        assert!(connector.include_millis);
        assert!(!connector.include_time_zone);
        assert_eq!(
            connector.kind,
            ConnectorKind::Sender {
                host: "cubex.local".to_string(),
                port: 2575,
                suspended: false
            }
        );
    }
}
