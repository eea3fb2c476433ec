//! 入站监听器
//!
//! 每个接收方连接器一个监听任务，每个连接一个读取任务。
//! 每帧消息先保存审计记录，再交给接收应用，最后在同一连接上回复确认。

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use hl7_core::{Connector, Hl7Error, Result};
use hl7_mllp::ack::{self, AckCode, ErrorCode, Rejection};
use hl7_mllp::{Hl7Message, Hl7Parser, MllpCodec};
use hl7_store::MessageService;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::statistics::RuntimeStats;

/// 接收应用
///
/// 返回 `Err(Rejection)` 时向发送方回复 AE 或 AR。
#[async_trait]
pub trait ReceivingApplication: Send + Sync {
    async fn receive(&self, message: &Hl7Message, connector: &Connector) -> std::result::Result<(), Rejection>;
}

/// 监听参数
#[derive(Debug, Clone)]
pub(crate) struct BindOptions {
    pub host: String,
    pub retry_interval: Duration,
    pub timeout: Duration,
    pub max_frame_length: usize,
    pub user: String,
}

/// 绑定监听端口，端口被占用时重试直到超时
pub(crate) async fn bind(connector: &Connector, options: &BindOptions, shutdown: &CancellationToken) -> Result<TcpListener> {
    let port = connector
        .listen_port()
        .ok_or_else(|| Hl7Error::Unsupported(format!("{} is not a receiver", connector)))?;
    let address = format!("{}:{}", options.host, port);
    let started = Instant::now();

    loop {
        match TcpListener::bind(&address).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && started.elapsed() < options.timeout => {
                warn!(connector = %connector.reference, "Port {} in use, retrying: {}", port, e);
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        return Err(Hl7Error::Interrupted(format!("Listening on {} was cancelled", address)));
                    }
                    _ = sleep(options.retry_interval) => {}
                }
            }
            Err(e) => return Err(Hl7Error::Network(e)),
        }
    }
}

/// 运行中的监听器
pub(crate) struct ListenerHandle {
    pub connector: Connector,
    pub local_addr: SocketAddr,
    pub stats: Arc<RuntimeStats>,
    pub application: Arc<dyn ReceivingApplication>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn start(
        listener: TcpListener,
        connector: Connector,
        application: Arc<dyn ReceivingApplication>,
        service: Arc<dyn MessageService>,
        options: BindOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let stats = Arc::new(RuntimeStats::new());
        let tracker = TaskTracker::new();
        let context = Arc::new(ConnectionContext {
            connector: connector.clone(),
            application: application.clone(),
            service,
            stats: stats.clone(),
            parser: Hl7Parser::new(),
            user: options.user.clone(),
        });

        info!(connector = %connector.reference, "Listening on {}", local_addr);
        let task = tokio::spawn(accept_loop(
            listener,
            context,
            options.max_frame_length,
            cancel.clone(),
            tracker.clone(),
        ));

        Ok(Self {
            connector,
            local_addr,
            stats,
            application,
            cancel,
            tracker,
            task,
        })
    }

    /// 停止监听并等待所有连接上正在处理的消息完成
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(connector = %self.connector.reference, "Listener task failed: {}", e);
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!(connector = %self.connector.reference, "Listener on {} stopped", self.local_addr);
    }
}

struct ConnectionContext {
    connector: Connector,
    application: Arc<dyn ReceivingApplication>,
    service: Arc<dyn MessageService>,
    stats: Arc<RuntimeStats>,
    parser: Hl7Parser,
    user: String,
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    max_frame_length: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let reference = context.connector.reference.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(connector = %reference, "Accepted connection from {}", peer);
                    let framed = Framed::new(stream, MllpCodec::with_max_frame_length(max_frame_length));
                    tracker.spawn(handle_connection(framed, peer, context.clone(), cancel.clone()));
                }
                Err(e) => {
                    warn!(connector = %reference, "Failed to accept connection: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
        }
    }
    // 监听套接字在此释放
    drop(listener);
}

async fn handle_connection(
    mut framed: Framed<TcpStream, MllpCodec>,
    peer: SocketAddr,
    context: Arc<ConnectionContext>,
    cancel: CancellationToken,
) {
    let reference = context.connector.reference.clone();
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };

        match frame {
            None => {
                debug!(connector = %reference, "Connection from {} closed", peer);
                break;
            }
            Some(Err(e)) => {
                // 帧格式错误后无法再同步，回复 NAK 并关闭连接
                warn!(connector = %reference, "Invalid frame from {}: {}", peer, e);
                context.stats.error(Utc::now(), e.to_string()).await;
                let rejection = Rejection::reject(ErrorCode::SegmentSequenceError, e.to_string());
                let nak = ack::build_generic(&context.connector, rejection.code, Some(&rejection));
                let _ = framed.send(Bytes::from(nak.to_bytes())).await;
                break;
            }
            Some(Ok(payload)) => {
                let reply = context.process(payload).await;
                if let Err(e) = framed.send(Bytes::from(reply.to_bytes())).await {
                    warn!(connector = %reference, "Failed to send acknowledgement to {}: {}", peer, e);
                    break;
                }
            }
        }
    }
}

impl ConnectionContext {
    /// 处理一帧消息，返回要回复的确认
    async fn process(&self, payload: BytesMut) -> Hl7Message {
        let reference = &self.connector.reference;
        let now = Utc::now();

        let message = match self.parser.decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(connector = %reference, "Failed to decode message: {}", e);
                self.stats.error(now, e.to_string()).await;
                let rejection = Rejection::reject(ErrorCode::SegmentSequenceError, e.to_string());
                return ack::build_generic(&self.connector, rejection.code, Some(&rejection));
            }
        };

        let record = match self.service.save(&message, &self.connector, &self.user).await {
            Ok(record) => record,
            Err(e) => {
                error!(connector = %reference, "Failed to save message {}: {}", message.name(), e);
                self.stats.error(now, e.to_string()).await;
                let rejection = Rejection::error(format!("Failed to save message: {}", e));
                return ack::build(&message, rejection.code, Some(&rejection));
            }
        };
        debug!(connector = %reference, id = record.id, "Received message {}", record.name);

        match self.application.receive(&message, &self.connector).await {
            Ok(()) => {
                self.stats.processed(now).await;
                ack::build(&message, AckCode::AA, None)
            }
            Err(rejection) => {
                warn!(
                    connector = %reference,
                    id = record.id,
                    "Message {} rejected with {}: {}", record.name, rejection.code, rejection.text
                );
                self.stats.error(now, rejection.text.clone()).await;
                ack::build(&message, rejection.code, Some(&rejection))
            }
        }
    }
}
