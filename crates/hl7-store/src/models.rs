//! 数据库模型

use chrono::{DateTime, Utc};
use hl7_core::{ConnectorRef, Direction, Hl7Error, MessageRecord, MessageStatus};
use sqlx::FromRow;

/// 数据库消息表（不含消息内容）
#[derive(Debug, FromRow)]
pub struct DbMessage {
    pub id: i64,
    pub connector: String,
    pub direction: String, // 存储为字符串，转换为Direction枚举
    pub name: String,
    pub author: String,
    pub status: String, // 存储为字符串，转换为MessageStatus枚举
    pub mime_type: String,
    pub size: i64,
    pub checksum: i64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_at: Option<DateTime<Utc>>,
    pub error_text: Option<String>,
}

impl TryFrom<DbMessage> for MessageRecord {
    type Error = Hl7Error;

    fn try_from(db_message: DbMessage) -> Result<Self, Self::Error> {
        let size = u64::try_from(db_message.size)
            .map_err(|_| Hl7Error::Persistence(format!("Invalid size for message {}", db_message.id)))?;
        let checksum = u32::try_from(db_message.checksum)
            .map_err(|_| Hl7Error::Persistence(format!("Invalid checksum for message {}", db_message.id)))?;

        Ok(MessageRecord {
            id: db_message.id,
            connector: ConnectorRef::new(db_message.connector),
            direction: Direction::parse(&db_message.direction)?,
            name: db_message.name,
            author: db_message.author,
            status: MessageStatus::parse(&db_message.status)?,
            mime_type: db_message.mime_type,
            size,
            checksum,
            created_at: db_message.created_at,
            processed_at: db_message.processed_at,
            error_at: db_message.error_at,
            error_text: db_message.error_text,
        })
    }
}

/// 消息内容及其声明的大小和校验和
#[derive(Debug, FromRow)]
pub struct DbContent {
    pub size: i64,
    pub checksum: i64,
    pub content: Vec<u8>,
}
