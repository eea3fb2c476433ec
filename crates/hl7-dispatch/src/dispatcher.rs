//! 消息分发器
//!
//! 管理每个连接器的出站工作任务和入站监听器。
//! 同一连接器的启动、停止和替换通过该连接器的生命周期锁串行执行，
//! 替换连接器时旧任务完全停止后才会启动新任务。不同连接器互不等待。

use futures::future::join_all;
use hl7_core::utils::{format_hl7_timestamp, generate_control_id};
use hl7_core::{Connector, ConnectorRef, Direction, Hl7Error, MessageConfig, MessageRecord, MessageStatus, Result};
use hl7_mllp::codec::DEFAULT_MAX_FRAME_LENGTH;
use hl7_mllp::Hl7Message;
use hl7_store::MessageService;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectors::{ConnectorEvent, Connectors};
use crate::receiver::{self, BindOptions, ListenerHandle, ReceivingApplication};
use crate::sender::SenderHandle;
use crate::statistics::Statistics;
use crate::transport::{TcpTransport, Transport};

/// 分发器配置（时间单位为毫秒）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// 连接远程系统的超时时间
    pub connect_timeout_ms: u64,
    /// 等待确认的超时时间
    pub ack_timeout_ms: u64,
    /// 队列为空时的轮询间隔
    pub poll_interval_ms: u64,
    /// 发送失败后的等待时间
    pub retry_interval_ms: u64,
    /// 监听地址
    pub bind_host: String,
    /// 端口被占用时的重试间隔
    pub bind_retry_interval_ms: u64,
    /// 端口被占用时最长等待时间
    pub bind_timeout_ms: u64,
    /// 最大帧长度
    pub max_frame_length: usize,
    /// 保存消息时记录的用户
    pub user: String,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 30_000,
            poll_interval_ms: 30_000,
            retry_interval_ms: 30_000,
            bind_host: "0.0.0.0".to_string(),
            bind_retry_interval_ms: 1_000,
            bind_timeout_ms: 30_000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            user: "hl7-dispatcher".to_string(),
        }
    }
}

impl DispatcherSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    fn bind_options(&self) -> BindOptions {
        BindOptions {
            host: self.bind_host.clone(),
            retry_interval: Duration::from_millis(self.bind_retry_interval_ms),
            timeout: Duration::from_millis(self.bind_timeout_ms),
            max_frame_length: self.max_frame_length,
            user: self.user.clone(),
        }
    }
}

#[derive(Default)]
struct Workers {
    senders: HashMap<ConnectorRef, SenderHandle>,
    listeners: HashMap<ConnectorRef, ListenerHandle>,
}

/// 单个连接器的生命周期锁
type Lifecycle = Arc<Mutex<()>>;

/// 消息分发器
pub struct MessageDispatcher {
    service: Arc<dyn MessageService>,
    connectors: Arc<dyn Connectors>,
    transport: Arc<dyn Transport>,
    settings: DispatcherSettings,
    /// 只在查找、插入和移除时短暂持有，不跨网络等待
    workers: Mutex<Workers>,
    lifecycles: Mutex<HashMap<ConnectorRef, Lifecycle>>,
    shutdown: CancellationToken,
}

impl MessageDispatcher {
    /// 创建使用TCP传输的分发器
    pub fn new(service: Arc<dyn MessageService>, connectors: Arc<dyn Connectors>, settings: DispatcherSettings) -> Self {
        let transport = Arc::new(TcpTransport::new(settings.connect_timeout(), settings.max_frame_length));
        Self::with_transport(service, connectors, transport, settings)
    }

    /// 创建使用指定传输的分发器
    pub fn with_transport(
        service: Arc<dyn MessageService>,
        connectors: Arc<dyn Connectors>,
        transport: Arc<dyn Transport>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            service,
            connectors,
            transport,
            settings,
            workers: Mutex::new(Workers::default()),
            lifecycles: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub fn service(&self) -> &Arc<dyn MessageService> {
        &self.service
    }

    /// 为所有已配置的发送方启动工作任务，投递上次运行遗留的消息
    pub async fn start(&self) -> Result<()> {
        self.check_running()?;
        let mut started = 0;
        for connector in self.connectors.get_connectors().await {
            if connector.is_sender() {
                let lifecycle = self.lifecycle(&connector.reference).await;
                let _guard = lifecycle.lock().await;
                if self.start_sender(&connector).await {
                    started += 1;
                }
            }
        }
        info!("Message dispatcher started {} senders", started);
        Ok(())
    }

    /// 将消息加入连接器的发送队列
    ///
    /// 填充 MSH-3 至 MSH-7，MSH-10 为空时生成新的控制ID。不等待网络。
    /// 已运行的工作任务只会被唤醒，不会按调用方传入的连接器重启。
    pub async fn queue(&self, mut message: Hl7Message, connector: &Connector, config: MessageConfig) -> Result<MessageRecord> {
        if !connector.is_sender() {
            return Err(Hl7Error::Unsupported(format!(
                "Cannot queue messages to {}",
                connector
            )));
        }
        self.check_running()?;

        populate_header(&mut message, connector, config);
        let record = self.service.save(&message, connector, &self.settings.user).await?;
        debug!(connector = %connector.reference, id = record.id, "Queued message {}", record.name);

        self.activate(&connector.reference, Some(connector)).await;
        Ok(record)
    }

    /// 在接收方连接器端口上监听，返回实际绑定的地址
    pub async fn listen(&self, connector: &Connector, application: Arc<dyn ReceivingApplication>) -> Result<SocketAddr> {
        if !connector.is_receiver() {
            return Err(Hl7Error::Unsupported(format!("Cannot listen on {}", connector)));
        }
        self.check_running()?;

        let lifecycle = self.lifecycle(&connector.reference).await;
        let _guard = lifecycle.lock().await;
        if let Some(address) = self.listening_address(&connector.reference).await {
            return Err(Hl7Error::InvalidState(format!(
                "{} is already listening on {}",
                connector.reference, address
            )));
        }
        let handle = self.start_listener(connector, application).await?;
        let address = handle.local_addr;
        self.insert_listener(handle).await?;
        Ok(address)
    }

    /// 停止连接器的工作任务或监听器，可重复调用
    pub async fn stop(&self, reference: &ConnectorRef) {
        let lifecycle = self.lifecycle(reference).await;
        let _guard = lifecycle.lock().await;
        self.stop_running(reference).await;
    }

    /// 重新提交发送失败的消息并唤醒工作任务
    pub async fn resubmit(&self, record: &MessageRecord) -> Result<MessageRecord> {
        let resubmitted = self.service.resubmit(record).await?;
        info!(connector = %record.connector, id = record.id, "Resubmitted message {}", record.name);
        self.activate(&record.connector, None).await;
        Ok(resubmitted)
    }

    /// 连接器配置变化：重启正在运行的工作任务或监听器
    pub async fn connector_changed(&self, connector: &Connector) -> Result<()> {
        let reference = &connector.reference;
        let lifecycle = self.lifecycle(reference).await;
        let _guard = lifecycle.lock().await;

        let (sender, listener) = {
            let mut workers = self.workers.lock().await;
            let sender_changed = workers
                .senders
                .get(reference)
                .map_or(false, |sender| &sender.connector != connector);
            let listener_changed = workers
                .listeners
                .get(reference)
                .map_or(false, |listener| &listener.connector != connector);
            (
                if sender_changed { workers.senders.remove(reference) } else { None },
                if listener_changed { workers.listeners.remove(reference) } else { None },
            )
        };

        if let Some(sender) = sender {
            info!(connector = %reference, "Connector changed, restarting sender");
            sender.stop().await;
            if connector.is_sender() {
                self.start_sender(connector).await;
            }
        }

        if let Some(listener) = listener {
            info!(connector = %reference, "Connector changed, restarting listener");
            let application = listener.application.clone();
            listener.stop().await;
            if connector.is_receiver() {
                self.check_running()?;
                let handle = self.start_listener(connector, application).await?;
                self.insert_listener(handle).await?;
            }
        }
        Ok(())
    }

    /// 连接器被删除：停止其工作任务和监听器
    pub async fn connector_removed(&self, reference: &ConnectorRef) {
        info!(connector = %reference, "Connector removed");
        self.stop(reference).await;
    }

    /// 订阅连接器变化事件，直到分发器关闭
    pub fn watch(self: &Arc<Self>, mut events: broadcast::Receiver<ConnectorEvent>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = dispatcher.shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ConnectorEvent::Updated(connector)) => {
                        if let Err(e) = dispatcher.connector_changed(&connector).await {
                            warn!(connector = %connector.reference, "Failed to apply connector change: {}", e);
                        }
                    }
                    Ok(ConnectorEvent::Removed(reference)) => dispatcher.connector_removed(&reference).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} connector events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// 连接器运行时统计，未运行时返回 None
    pub async fn statistics(&self, reference: &ConnectorRef) -> Option<Statistics> {
        let (stats, connector) = {
            let workers = self.workers.lock().await;
            if let Some(sender) = workers.senders.get(reference) {
                (sender.stats.clone(), sender.connector.clone())
            } else if let Some(listener) = workers.listeners.get(reference) {
                (listener.stats.clone(), listener.connector.clone())
            } else {
                return None;
            }
        };

        let direction = connector.direction();
        let mut snapshot = stats.snapshot(reference, direction, connector.is_suspended()).await;
        if direction == Direction::Outbound {
            snapshot.queued = self.count(reference, MessageStatus::Pending).await;
            snapshot.errors = self.count(reference, MessageStatus::Error).await;
        }
        Some(snapshot)
    }

    /// 正在运行的连接器
    pub async fn active_connectors(&self) -> Vec<ConnectorRef> {
        let workers = self.workers.lock().await;
        let mut references: Vec<ConnectorRef> = workers
            .senders
            .keys()
            .chain(workers.listeners.keys())
            .cloned()
            .collect();
        references.sort();
        references
    }

    /// 监听器实际绑定的地址
    pub async fn listening_address(&self, reference: &ConnectorRef) -> Option<SocketAddr> {
        self.workers
            .lock()
            .await
            .listeners
            .get(reference)
            .map(|listener| listener.local_addr)
    }

    /// 停止所有工作任务和监听器，之后的 queue/listen 调用返回 Interrupted
    pub async fn shutdown(&self) {
        info!("Shutting down message dispatcher");
        self.shutdown.cancel();
        let lifecycles: Vec<(ConnectorRef, Lifecycle)> = self
            .lifecycles
            .lock()
            .await
            .iter()
            .map(|(reference, lifecycle)| (reference.clone(), lifecycle.clone()))
            .collect();

        // 各连接器并行停止，进行中的生命周期操作先完成
        join_all(lifecycles.into_iter().map(move |(reference, lifecycle)| async move {
            let _guard = lifecycle.lock().await;
            self.stop_running(&reference).await;
        }))
        .await;
    }

    fn check_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Hl7Error::Interrupted("Message dispatcher has been shut down".to_string()));
        }
        Ok(())
    }

    async fn count(&self, reference: &ConnectorRef, status: MessageStatus) -> u64 {
        match self.service.get_messages(reference, status).await {
            Ok(count) => count,
            Err(e) => {
                warn!(connector = %reference, "Failed to count {} messages: {}", status, e);
                0
            }
        }
    }

    async fn lifecycle(&self, reference: &ConnectorRef) -> Lifecycle {
        self.lifecycles
            .lock()
            .await
            .entry(reference.clone())
            .or_default()
            .clone()
    }

    /// 唤醒发送方的工作任务，没有时按注册表中的连接器启动
    ///
    /// 该连接器正在停止或替换时不等待，由进行中的操作决定是否运行。
    async fn activate(&self, reference: &ConnectorRef, fallback: Option<&Connector>) {
        if let Some(sender) = self.workers.lock().await.senders.get(reference) {
            sender.wake();
            return;
        }

        let lifecycle = self.lifecycle(reference).await;
        let Ok(_guard) = lifecycle.try_lock() else {
            debug!(connector = %reference, "Lifecycle change in progress, sender not started");
            return;
        };
        let connector = match self.connectors.get_connector(reference).await {
            Some(connector) => connector,
            None => match fallback {
                Some(connector) => connector.clone(),
                None => return,
            },
        };
        if connector.is_sender() {
            self.start_sender(&connector).await;
        }
    }

    /// 启动工作任务（调用方持有生命周期锁），已运行或已关闭时返回 false
    async fn start_sender(&self, connector: &Connector) -> bool {
        let mut workers = self.workers.lock().await;
        if self.shutdown.is_cancelled() || workers.senders.contains_key(&connector.reference) {
            return false;
        }
        let handle = SenderHandle::start(
            connector.clone(),
            self.service.clone(),
            self.transport.clone(),
            &self.settings,
            self.shutdown.child_token(),
        );
        workers.senders.insert(connector.reference.clone(), handle);
        true
    }

    async fn start_listener(&self, connector: &Connector, application: Arc<dyn ReceivingApplication>) -> Result<ListenerHandle> {
        let options = self.settings.bind_options();
        let listener = receiver::bind(connector, &options, &self.shutdown).await?;
        ListenerHandle::start(
            listener,
            connector.clone(),
            application,
            self.service.clone(),
            options,
            self.shutdown.child_token(),
        )
    }

    async fn insert_listener(&self, handle: ListenerHandle) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if self.shutdown.is_cancelled() {
            drop(workers);
            handle.stop().await;
            return Err(Hl7Error::Interrupted("Message dispatcher has been shut down".to_string()));
        }
        workers.listeners.insert(handle.connector.reference.clone(), handle);
        Ok(())
    }

    /// 取出并停止连接器的任务（调用方持有生命周期锁）
    async fn stop_running(&self, reference: &ConnectorRef) {
        let (sender, listener) = {
            let mut workers = self.workers.lock().await;
            (workers.senders.remove(reference), workers.listeners.remove(reference))
        };
        if let Some(sender) = sender {
            info!(connector = %reference, "Stopping sender");
            sender.stop().await;
        }
        if let Some(listener) = listener {
            info!(connector = %reference, "Stopping listener");
            listener.stop().await;
        }
    }
}

/// 按连接器填充消息头
fn populate_header(message: &mut Hl7Message, connector: &Connector, config: MessageConfig) {
    let (include_millis, include_time_zone) = config.resolve(connector);
    message.set_header_field(3, connector.sending_application.as_str());
    message.set_header_field(4, connector.sending_facility.as_str());
    message.set_header_field(5, connector.receiving_application.as_str());
    message.set_header_field(6, connector.receiving_facility.as_str());
    message.set_header_field(
        7,
        format_hl7_timestamp(&chrono::Local::now(), include_millis, include_time_zone),
    );
    if message.control_id().is_none() {
        message.set_header_field(10, generate_control_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_populate_header_uses_connector_and_config() {
        let connector = Connector::sender("pharmacy", "localhost", 2575)
            .with_sending("VPMS", "MAIN")
            .with_receiving("CUBEX", "PHARM")
            .with_timestamp_format(true, false);
        let mut message = Hl7Message::new("RDE", "O11", "RDE_O11");
        message.set_header_field(10, "");

        populate_header(&mut message, &connector, MessageConfig::new().include_time_zone(true));

        assert_eq!(message.sending_application(), Some("VPMS"));
        assert_eq!(message.sending_facility(), Some("MAIN"));
        assert_eq!(message.receiving_application(), Some("CUBEX"));
        assert_eq!(message.receiving_facility(), Some("PHARM"));
        // YYYYMMDDHHMMSS.SSS+ZZZZ
        let timestamp = message.header().field(7).unwrap();
        assert_eq!(timestamp.len(), 23);
        assert_eq!(&timestamp[14..15], ".");
        assert!(message.control_id().is_some());
    }

    #[test]
    fn test_settings_defaults_and_durations() {
        let settings: DispatcherSettings = serde_json::from_str(r#"{"ack_timeout_ms": 500}"#).unwrap();
        assert_eq!(settings.ack_timeout(), Duration::from_millis(500));
        assert_eq!(settings.retry_interval(), Duration::from_secs(30));
        assert_eq!(settings.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
    }
}
