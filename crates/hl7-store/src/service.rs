//! 消息服务接口

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hl7_core::utils::{checksum, HL7_MIME_TYPE};
use hl7_core::{Connector, ConnectorRef, Direction, Hl7Error, MessageRecord, MessageStatus, Result};
use hl7_mllp::{Hl7Message, Hl7Parser};

/// 消息持久化服务
///
/// 状态转换: `PENDING → SENT`、`PENDING → ERROR`、`ERROR → PENDING`（仅出站）。
/// 入站消息保存后即为 `RECEIVED`。
#[async_trait]
pub trait MessageService: Send + Sync {
    /// 保存消息。发送方连接器创建 `PENDING` 出站记录，接收方连接器创建 `RECEIVED` 入站记录。
    async fn save(&self, message: &Hl7Message, connector: &Connector, user: &str) -> Result<MessageRecord>;

    /// 标记消息已发送
    async fn sent(&self, record: &MessageRecord, timestamp: DateTime<Utc>) -> Result<MessageRecord>;

    /// 标记消息发送失败，错误信息超过5000个字符时截断
    async fn error(
        &self,
        record: &MessageRecord,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
        error_text: &str,
    ) -> Result<MessageRecord>;

    /// 认领连接器最早的未认领待发送消息
    async fn next(&self, connector: &Connector) -> Result<Option<MessageRecord>>;

    /// 统计连接器指定状态的消息数量
    async fn get_messages(&self, connector: &ConnectorRef, status: MessageStatus) -> Result<u64>;

    /// 重新提交发送失败的消息
    async fn resubmit(&self, record: &MessageRecord) -> Result<MessageRecord>;

    /// 读取并校验消息内容
    async fn content(&self, record: &MessageRecord) -> Result<Vec<u8>>;

    /// 按ID查找消息
    async fn find(&self, id: i64) -> Result<Option<MessageRecord>>;

    /// 释放连接器遗留的认领（工作任务启动时调用）
    async fn release_claims(&self, connector: &ConnectorRef) -> Result<u64>;

    /// 读取并解码消息
    async fn get(&self, record: &MessageRecord, parser: &Hl7Parser) -> Result<Hl7Message> {
        let content = self.content(record).await?;
        parser.decode(&content)
    }
}

/// 待写入的消息
#[derive(Debug, Clone)]
pub(crate) struct NewMessage {
    pub connector: ConnectorRef,
    pub direction: Direction,
    pub name: String,
    pub author: String,
    pub status: MessageStatus,
    pub mime_type: String,
    pub content: Vec<u8>,
    pub checksum: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    /// 编码消息并计算校验和
    pub fn prepare(message: &Hl7Message, connector: &Connector, user: &str) -> Result<Self> {
        let code = message
            .message_code()
            .ok_or_else(|| Hl7Error::Protocol("Missing message type (MSH-9)".to_string()))?;
        let control_id = message
            .control_id()
            .ok_or_else(|| Hl7Error::Protocol("Missing message control ID (MSH-10)".to_string()))?;
        let name = match message.trigger_event() {
            Some(trigger) => format!("{}_{}_{}.hl7", code, trigger, control_id),
            None => format!("{}_{}.hl7", code, control_id),
        };

        let content = message.to_bytes();
        let now = Utc::now();
        let (status, processed_at) = match connector.direction() {
            Direction::Outbound => (MessageStatus::Pending, None),
            Direction::Inbound => (MessageStatus::Received, Some(now)),
        };

        Ok(Self {
            connector: connector.reference.clone(),
            direction: connector.direction(),
            name,
            author: user.to_string(),
            status,
            mime_type: HL7_MIME_TYPE.to_string(),
            checksum: checksum(&content),
            content,
            created_at: now,
            processed_at,
        })
    }
}

/// 校验读取的内容与记录的大小和校验和一致
pub(crate) fn verify_content(id: i64, size: u64, expected: u32, content: &[u8]) -> Result<()> {
    if content.len() as u64 != size {
        return Err(Hl7Error::Persistence(format!(
            "Message {} is truncated: expected {} bytes but read {}",
            id,
            size,
            content.len()
        )));
    }
    let actual = checksum(content);
    if actual != expected {
        return Err(Hl7Error::Persistence(format!(
            "Message {} is corrupt: checksum {:08x} does not match {:08x}",
            id, actual, expected
        )));
    }
    Ok(())
}

/// 检查 `error` 调用的目标状态
pub(crate) fn check_error_status(status: MessageStatus) -> Result<()> {
    if status != MessageStatus::Error {
        return Err(Hl7Error::InvalidState(format!(
            "Cannot record an error with status {}",
            status
        )));
    }
    Ok(())
}

/// 只有出站消息支持重新提交
pub(crate) fn check_resubmit(record: &MessageRecord) -> Result<()> {
    if record.direction != Direction::Outbound {
        return Err(Hl7Error::Unsupported(format!(
            "Message {} was received by connector {} and cannot be resubmitted",
            record.id, record.connector
        )));
    }
    Ok(())
}

/// 状态转换失败时的错误
pub(crate) fn transition_error(record: &MessageRecord, current: Option<MessageStatus>, target: MessageStatus) -> Hl7Error {
    match current {
        Some(current) => Hl7Error::InvalidState(format!(
            "Message {} cannot change from {} to {}",
            record.id, current, target
        )),
        None => Hl7Error::NotFound(format!("Message {}", record.id)),
    }
}
