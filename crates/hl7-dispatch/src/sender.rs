//! 出站工作任务
//!
//! 每个发送方连接器一个任务：按创建顺序认领待发送消息，发送后等待确认，
//! 再将结果写回消息服务。一条消息处理完之前不会响应停止请求。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hl7_core::{Connector, Hl7Error, MessageRecord, MessageStatus, Result};
use hl7_mllp::ack::{unsupported_response, Acknowledgement};
use hl7_mllp::{Hl7Message, Hl7Parser};
use hl7_store::MessageService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::DispatcherSettings;
use crate::statistics::RuntimeStats;
use crate::transport::{Connection, Transport};

/// 运行中的出站工作任务
pub(crate) struct SenderHandle {
    pub connector: Connector,
    pub stats: Arc<RuntimeStats>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SenderHandle {
    pub fn start(
        connector: Connector,
        service: Arc<dyn MessageService>,
        transport: Arc<dyn Transport>,
        settings: &DispatcherSettings,
        cancel: CancellationToken,
    ) -> Self {
        let stats = Arc::new(RuntimeStats::new());
        let wake = Arc::new(Notify::new());
        let worker = SenderWorker {
            connector: connector.clone(),
            service,
            transport,
            ack_timeout: settings.ack_timeout(),
            poll_interval: settings.poll_interval(),
            retry_interval: settings.retry_interval(),
            wake: wake.clone(),
            cancel: cancel.clone(),
            stats: stats.clone(),
            parser: Hl7Parser::new(),
            connection: None,
        };
        let task = tokio::spawn(worker.run());

        Self {
            connector,
            stats,
            wake,
            cancel,
            task,
        }
    }

    /// 唤醒工作任务检查新消息
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// 停止工作任务，等待正在发送的消息完成
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(connector = %self.connector.reference, "Sender task failed: {}", e);
        }
    }
}

/// 单条消息的处理结果
#[derive(Debug)]
enum Outcome {
    Sent,
    Failed(String),
}

struct SenderWorker {
    connector: Connector,
    service: Arc<dyn MessageService>,
    transport: Arc<dyn Transport>,
    ack_timeout: Duration,
    poll_interval: Duration,
    retry_interval: Duration,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    stats: Arc<RuntimeStats>,
    parser: Hl7Parser,
    connection: Option<Box<dyn Connection>>,
}

impl SenderWorker {
    async fn run(mut self) {
        let reference = self.connector.reference.clone();
        info!(connector = %reference, "Starting sender for {}", self.connector);

        // 之前的任务异常退出时可能留下认领
        match self.service.release_claims(&reference).await {
            Ok(0) => {}
            Ok(released) => warn!(connector = %reference, "Released {} stale claims", released),
            Err(e) => warn!(connector = %reference, "Failed to release claims: {}", e),
        }

        while !self.cancel.is_cancelled() {
            if self.connector.is_suspended() {
                // 挂起的连接器只有在配置更新后才会恢复，届时任务会被替换
                self.cancel.cancelled().await;
                break;
            }

            let delay = match self.service.next(&self.connector).await {
                Ok(Some(record)) => match self.process(record).await {
                    Outcome::Sent => None,
                    Outcome::Failed(_) => Some(self.retry_interval),
                },
                Ok(None) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = self.wake.notified() => {}
                        _ = sleep(self.poll_interval) => {}
                    }
                    None
                }
                Err(e) => {
                    error!(connector = %reference, "Failed to retrieve next message: {}", e);
                    self.stats.error(Utc::now(), e.to_string()).await;
                    Some(self.retry_interval)
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = sleep(delay) => {}
                }
            }
        }

        self.connection = None;
        info!(connector = %reference, "Sender stopped");
    }

    /// 发送一条已认领的消息并记录结果
    async fn process(&mut self, record: MessageRecord) -> Outcome {
        let reference = self.connector.reference.clone();
        debug!(connector = %reference, id = record.id, "Sending message {}", record.name);

        let outcome = match self.service.get(&record, &self.parser).await {
            Ok(message) => self.deliver(&message).await,
            Err(e) => Outcome::Failed(format!("Failed to read message: {}", e)),
        };

        let now = Utc::now();
        if let Err(e) = self.record_outcome(&record, &outcome, now).await {
            error!(connector = %reference, id = record.id, "Failed to update message status: {}", e);
            self.stats.error(now, e.to_string()).await;
            return Outcome::Failed(e.to_string());
        }

        match &outcome {
            Outcome::Sent => {
                info!(connector = %reference, id = record.id, "Message {} sent", record.name);
                self.stats.processed(now).await;
            }
            Outcome::Failed(text) => {
                warn!(connector = %reference, id = record.id, "Failed to send message {}: {}", record.name, text);
                self.stats.error(now, text.clone()).await;
            }
        }
        outcome
    }

    /// 保存发送结果
    ///
    /// 存储暂时失败时按重试间隔重试同一更新，消息在此期间保持认领，
    /// 不会被重新发送。任务停止时放弃，认领在下次启动时释放。
    async fn record_outcome(&self, record: &MessageRecord, outcome: &Outcome, now: DateTime<Utc>) -> Result<()> {
        loop {
            let result = match outcome {
                Outcome::Sent => self.service.sent(record, now).await,
                Outcome::Failed(text) => {
                    self.service
                        .error(record, MessageStatus::Error, now, text)
                        .await
                }
            };
            match result {
                Ok(_) => return Ok(()),
                Err(Hl7Error::Persistence(e)) => {
                    warn!(connector = %record.connector, id = record.id, "Failed to update message status, retrying: {}", e);
                    self.stats.error(Utc::now(), e).await;
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(Hl7Error::Interrupted(format!(
                                "Status of message {} was not recorded",
                                record.name
                            )));
                        }
                        _ = sleep(self.retry_interval) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 发送消息并解释确认
    async fn deliver(&mut self, message: &Hl7Message) -> Outcome {
        match self.exchange(message).await {
            Ok(reply) => match Acknowledgement::from_message(&reply) {
                Some(ack) if ack.is_accept() => Outcome::Sent,
                Some(ack) => Outcome::Failed(ack.error_message()),
                None => Outcome::Failed(unsupported_response(&reply)),
            },
            Err(e) => {
                // 出错后连接状态未知，下次重新连接
                self.connection = None;
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn exchange(&mut self, message: &Hl7Message) -> Result<Hl7Message> {
        if self.connection.is_none() {
            let (host, port) = self
                .connector
                .remote()
                .ok_or_else(|| Hl7Error::Unsupported(format!("{} is not a sender", self.connector)))?;
            self.connection = Some(self.transport.connect(host, port).await?);
        }
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| Hl7Error::InvalidState("Not connected".to_string()))?;

        timeout(self.ack_timeout, connection.send(Bytes::from(message.to_bytes())))
            .await
            .map_err(|_| {
                Hl7Error::Timeout(format!(
                    "Failed to send message within {}ms",
                    self.ack_timeout.as_millis()
                ))
            })??;
        let reply = timeout(self.ack_timeout, connection.receive())
            .await
            .map_err(|_| {
                Hl7Error::Timeout(format!(
                    "No response received within {}ms",
                    self.ack_timeout.as_millis()
                ))
            })??;

        let reply = Hl7Parser::lenient().decode(&reply)?;
        if let (Some(sent), Some(ack)) = (message.control_id(), reply.segment("MSA").and_then(|msa| msa.field(2))) {
            if sent != ack {
                warn!(
                    connector = %self.connector.reference,
                    "Acknowledgement control ID {} does not match message {}", ack, sent
                );
            }
        }
        Ok(reply)
    }
}
