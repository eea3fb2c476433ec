//! 内存消息存储
//!
//! 用于测试和嵌入式场景，进程退出后数据丢失。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hl7_core::utils::truncate_error;
use hl7_core::{Connector, ConnectorRef, Hl7Error, MessageRecord, MessageStatus, Result};
use hl7_mllp::Hl7Message;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::service::{check_error_status, check_resubmit, transition_error, verify_content, MessageService, NewMessage};

#[derive(Debug)]
struct Entry {
    record: MessageRecord,
    claimed: bool,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    // BTreeMap 按ID排序，即创建顺序
    entries: BTreeMap<i64, Entry>,
}

/// 内存消息服务
#[derive(Debug, Default)]
pub struct InMemoryMessageService {
    inner: RwLock<Inner>,
}

impl InMemoryMessageService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在写锁内执行状态转换
    async fn transition<F>(&self, record: &MessageRecord, from: MessageStatus, to: MessageStatus, apply: F) -> Result<MessageRecord>
    where
        F: FnOnce(&mut MessageRecord) + Send,
    {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(&record.id)
            .ok_or_else(|| transition_error(record, None, to))?;
        if entry.record.status != from {
            return Err(transition_error(record, Some(entry.record.status), to));
        }
        entry.record.status = to;
        entry.claimed = false;
        apply(&mut entry.record);
        Ok(entry.record.clone())
    }
}

#[async_trait]
impl MessageService for InMemoryMessageService {
    async fn save(&self, message: &Hl7Message, connector: &Connector, user: &str) -> Result<MessageRecord> {
        let new = NewMessage::prepare(message, connector, user)?;
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let record = MessageRecord {
            id: inner.next_id,
            connector: new.connector,
            direction: new.direction,
            name: new.name,
            author: new.author,
            status: new.status,
            mime_type: new.mime_type,
            size: new.content.len() as u64,
            checksum: new.checksum,
            created_at: new.created_at,
            processed_at: new.processed_at,
            error_at: None,
            error_text: None,
        };
        inner.entries.insert(
            record.id,
            Entry {
                record: record.clone(),
                claimed: false,
                content: new.content,
            },
        );
        debug!(connector = %record.connector, id = record.id, "Saved message {}", record.name);
        Ok(record)
    }

    async fn sent(&self, record: &MessageRecord, timestamp: DateTime<Utc>) -> Result<MessageRecord> {
        self.transition(record, MessageStatus::Pending, MessageStatus::Sent, |r| {
            r.processed_at = Some(timestamp);
            r.error_at = None;
            r.error_text = None;
        })
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
        let text = truncate_error(error_text);
        self.transition(record, MessageStatus::Pending, MessageStatus::Error, |r| {
            r.error_at = Some(timestamp);
            r.error_text = Some(text);
        })
        .await
    }

    async fn next(&self, connector: &Connector) -> Result<Option<MessageRecord>> {
        let mut inner = self.inner.write().await;
        let entry = inner.entries.values_mut().find(|e| {
            e.record.connector == connector.reference && e.record.status == MessageStatus::Pending && !e.claimed
        });
        Ok(entry.map(|e| {
            e.claimed = true;
            e.record.clone()
        }))
    }

    async fn get_messages(&self, connector: &ConnectorRef, status: MessageStatus) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .values()
            .filter(|e| &e.record.connector == connector && e.record.status == status)
            .count() as u64)
    }

    async fn resubmit(&self, record: &MessageRecord) -> Result<MessageRecord> {
        check_resubmit(record)?;
        self.transition(record, MessageStatus::Error, MessageStatus::Pending, |_| {})
            .await
    }

    async fn content(&self, record: &MessageRecord) -> Result<Vec<u8>> {
        let inner = self.inner.read().await;
        let entry = inner
            .entries
            .get(&record.id)
            .ok_or_else(|| Hl7Error::NotFound(format!("Message {}", record.id)))?;
        verify_content(record.id, entry.record.size, entry.record.checksum, &entry.content)?;
        Ok(entry.content.clone())
    }

    async fn find(&self, id: i64) -> Result<Option<MessageRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.entries.get(&id).map(|e| e.record.clone()))
    }

    async fn release_claims(&self, connector: &ConnectorRef) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut released = 0;
        for entry in inner.entries.values_mut() {
            if entry.claimed && &entry.record.connector == connector {
                entry.claimed = false;
                released += 1;
            }
        }
        Ok(released)
    }
}
