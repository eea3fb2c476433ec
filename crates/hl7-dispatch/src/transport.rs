//! 出站传输层
//!
//! 工作任务通过 `Transport` 建立连接，测试中可替换为脚本化实现。

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use hl7_core::{Hl7Error, Result};
use hl7_mllp::MllpCodec;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

/// 建立到远程系统的连接
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Connection>>;
}

/// 已建立的 MLLP 连接
#[async_trait]
pub trait Connection: Send + Sync {
    /// 发送一帧
    async fn send(&mut self, payload: Bytes) -> Result<()>;

    /// 读取下一帧，对端关闭连接时返回网络错误
    async fn receive(&mut self) -> Result<BytesMut>;
}

/// 基于TCP的传输
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    max_frame_length: usize,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, max_frame_length: usize) -> Self {
        Self {
            connect_timeout,
            max_frame_length,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Connection>> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                Hl7Error::Timeout(format!(
                    "Failed to connect to {}:{} within {}ms",
                    host,
                    port,
                    self.connect_timeout.as_millis()
                ))
            })??;
        stream.set_nodelay(true)?;
        debug!("Connected to {}:{}", host, port);

        Ok(Box::new(TcpConnection {
            framed: Framed::new(stream, MllpCodec::with_max_frame_length(self.max_frame_length)),
        }))
    }
}

/// TCP 连接
pub struct TcpConnection {
    framed: Framed<TcpStream, MllpCodec>,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, payload: Bytes) -> Result<()> {
        self.framed.send(payload).await
    }

    async fn receive(&mut self) -> Result<BytesMut> {
        match self.framed.next().await {
            Some(frame) => frame,
            None => Err(Hl7Error::Network(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed by remote host",
            ))),
        }
    }
}
