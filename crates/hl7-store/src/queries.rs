//! 数据库查询操作

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hl7_core::utils::truncate_error;
use hl7_core::{Connector, ConnectorRef, Hl7Error, MessageRecord, MessageStatus, Result};
use hl7_mllp::Hl7Message;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::connection::DatabasePool;
use crate::models::{DbContent, DbMessage};
use crate::service::{check_error_status, check_resubmit, transition_error, verify_content, MessageService, NewMessage};

/// 记录列（不含内容）
const COLUMNS: &str = "id, connector, direction, name, author, status, mime_type, size, checksum, \
                       created_at, processed_at, error_at, error_text";

/// 基于SQLite的消息服务
#[derive(Debug, Clone)]
pub struct SqlMessageService {
    pool: SqlitePool,
}

impl SqlMessageService {
    pub fn new(pool: &DatabasePool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hl7_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                connector TEXT NOT NULL,
                direction TEXT NOT NULL,
                name TEXT NOT NULL,
                author TEXT NOT NULL,
                status TEXT NOT NULL,
                claimed INTEGER NOT NULL DEFAULT 0,
                mime_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                checksum INTEGER NOT NULL,
                content BLOB NOT NULL,
                created_at TEXT NOT NULL,
                processed_at TEXT,
                error_at TEXT,
                error_text TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Hl7Error::Persistence(e.to_string()))?;

        // 创建索引以优化待发送消息查询
        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_hl7_messages_queue ON hl7_messages(connector, status, id)",
            "CREATE INDEX IF NOT EXISTS idx_hl7_messages_created_at ON hl7_messages(created_at)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql)
                .execute(&self.pool)
                .await
                .map_err(|e| Hl7Error::Persistence(e.to_string()))?;
        }

        info!("Database tables created successfully");
        Ok(())
    }

    async fn current_status(&self, id: i64) -> Result<Option<MessageStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM hl7_messages WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Hl7Error::Persistence(e.to_string()))?;
        status.map(|s| MessageStatus::parse(&s)).transpose()
    }

    /// 条件更新：只有当前状态为 `from` 时才修改
    async fn transition(
        &self,
        record: &MessageRecord,
        from: MessageStatus,
        to: MessageStatus,
        assignments: &str,
        bind_time: Option<DateTime<Utc>>,
        bind_text: Option<String>,
    ) -> Result<MessageRecord> {
        let sql = format!(
            "UPDATE hl7_messages SET status = ?1, claimed = 0{} WHERE id = ?2 AND status = ?3 RETURNING {}",
            assignments, COLUMNS
        );
        let updated: Option<DbMessage> = sqlx::query_as(&sql)
            .bind(to.as_str())
            .bind(record.id)
            .bind(from.as_str())
            .bind(bind_time)
            .bind(bind_text)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Hl7Error::Persistence(e.to_string()))?;

        match updated {
            Some(row) => MessageRecord::try_from(row),
            None => {
                let current = self.current_status(record.id).await?;
                Err(transition_error(record, current, to))
            }
        }
    }
}

#[async_trait]
impl MessageService for SqlMessageService {
    async fn save(&self, message: &Hl7Message, connector: &Connector, user: &str) -> Result<MessageRecord> {
        let new = NewMessage::prepare(message, connector, user)?;
        let sql = format!(
            "INSERT INTO hl7_messages (connector, direction, name, author, status, claimed, mime_type, size, \
             checksum, content, created_at, processed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?10, ?11) RETURNING {}",
            COLUMNS
        );
        let row: DbMessage = sqlx::query_as(&sql)
            .bind(new.connector.as_str())
            .bind(new.direction.as_str())
            .bind(&new.name)
            .bind(&new.author)
            .bind(new.status.as_str())
            .bind(&new.mime_type)
            .bind(new.content.len() as i64)
            .bind(i64::from(new.checksum))
            .bind(&new.content)
            .bind(new.created_at)
            .bind(new.processed_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Hl7Error::Persistence(e.to_string()))?;

        let record = MessageRecord::try_from(row)?;
        debug!(connector = %record.connector, id = record.id, "Saved message {}", record.name);
        Ok(record)
    }

    async fn sent(&self, record: &MessageRecord, timestamp: DateTime<Utc>) -> Result<MessageRecord> {
        self.transition(
            record,
            MessageStatus::Pending,
            MessageStatus::Sent,
            ", processed_at = ?4, error_at = NULL, error_text = ?5",
            Some(timestamp),
            None,
        )
        .await
    }

    async fn error(
        &self,
        record: &MessageRecord,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
        error_text: &str,
    ) -> Result<MessageRecord> {
        check_error_status(status)?;
        self.transition(
            record,
            MessageStatus::Pending,
            MessageStatus::Error,
            ", error_at = ?4, error_text = ?5",
            Some(timestamp),
            Some(truncate_error(error_text)),
        )
        .await
    }

    async fn next(&self, connector: &Connector) -> Result<Option<MessageRecord>> {
        // 单条语句完成查找和认领，并发调用不会认领同一条消息
        let sql = format!(
            "UPDATE hl7_messages SET claimed = 1 \
             WHERE id = (SELECT id FROM hl7_messages \
                         WHERE connector = ?1 AND status = 'PENDING' AND claimed = 0 \
                         ORDER BY id LIMIT 1) \
             AND claimed = 0 \
             RETURNING {}",
            COLUMNS
        );
        let row: Option<DbMessage> = sqlx::query_as(&sql)
            .bind(connector.reference.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Hl7Error::Persistence(e.to_string()))?;
        row.map(MessageRecord::try_from).transpose()
    }

    async fn get_messages(&self, connector: &ConnectorRef, status: MessageStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hl7_messages WHERE connector = ?1 AND status = ?2")
            .bind(connector.as_str())
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Hl7Error::Persistence(e.to_string()))?;
        Ok(count as u64)
    }

    async fn resubmit(&self, record: &MessageRecord) -> Result<MessageRecord> {
        check_resubmit(record)?;
        // 未使用的参数绑定为 NULL
        self.transition(
            record,
            MessageStatus::Error,
            MessageStatus::Pending,
            ", error_at = COALESCE(?4, error_at), error_text = COALESCE(?5, error_text)",
            None,
            None,
        )
        .await
    }

    async fn content(&self, record: &MessageRecord) -> Result<Vec<u8>> {
        let row: DbContent = sqlx::query_as("SELECT size, checksum, content FROM hl7_messages WHERE id = ?1")
            .bind(record.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Hl7Error::Persistence(e.to_string()))?
            .ok_or_else(|| Hl7Error::NotFound(format!("Message {}", record.id)))?;

        verify_content(record.id, row.size as u64, row.checksum as u32, &row.content)?;
        Ok(row.content)
    }

    async fn find(&self, id: i64) -> Result<Option<MessageRecord>> {
        let sql = format!("SELECT {} FROM hl7_messages WHERE id = ?1", COLUMNS);
        let row: Option<DbMessage> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Hl7Error::Persistence(e.to_string()))?;
        row.map(MessageRecord::try_from).transpose()
    }

    async fn release_claims(&self, connector: &ConnectorRef) -> Result<u64> {
        let result = sqlx::query("UPDATE hl7_messages SET claimed = 0 WHERE connector = ?1 AND claimed = 1")
            .bind(connector.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| Hl7Error::Persistence(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
