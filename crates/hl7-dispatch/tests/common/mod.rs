//! 集成测试共用的脚本化传输和辅助函数

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hl7_core::{Connector, ConnectorRef, Hl7Error, MessageStatus, Result};
use hl7_dispatch::{Connection, DispatcherSettings, Transport};
use hl7_mllp::ack::{self, AckCode, ErrorCode, Rejection};
use hl7_mllp::{Hl7Message, Hl7Parser};
use hl7_store::MessageService;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 远程系统的行为
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// 回复 AA
    Accept,
    /// 拒绝连接
    Refuse,
    /// 回复 AE
    Error(String),
    /// 回复 AR（不支持的消息类型）
    Reject(String),
    /// 等待指定时间后回复 AA
    Delay(Duration),
    /// 从不回复
    Silent,
    /// 回复原消息（非 ACK）
    Echo,
    /// 写入永远不完成，如对方停止读取
    Blocked,
}

#[derive(Debug)]
struct State {
    behaviour: Behaviour,
    delivered: Vec<Hl7Message>,
    connects: usize,
    in_flight: usize,
}

/// 脚本化传输，记录收到的每条消息
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                behaviour,
                delivered: Vec::new(),
                connects: 0,
                in_flight: 0,
            })),
        }
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        self.state.lock().unwrap().behaviour = behaviour;
    }

    /// 已收到消息的控制ID（按接收顺序）
    pub fn delivered(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .delivered
            .iter()
            .map(|m| m.control_id().unwrap_or_default().to_string())
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// 已发送但尚未回复的消息数
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Connection>> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if let Behaviour::Refuse = state.behaviour {
            return Err(Hl7Error::Network(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("Connection refused: {}:{}", host, port),
            )));
        }
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            pending: None,
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<State>>,
    pending: Option<(Behaviour, Hl7Message)>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, payload: Bytes) -> Result<()> {
        let blocked = matches!(self.state.lock().unwrap().behaviour, Behaviour::Blocked);
        if blocked {
            std::future::pending::<()>().await;
        }
        let message = Hl7Parser::new().decode(&payload)?;
        let mut state = self.state.lock().unwrap();
        state.delivered.push(message.clone());
        state.in_flight += 1;
        self.pending = Some((state.behaviour.clone(), message));
        Ok(())
    }

    async fn receive(&mut self) -> Result<BytesMut> {
        let (behaviour, message) = self
            .pending
            .take()
            .ok_or_else(|| Hl7Error::InvalidState("Nothing sent".to_string()))?;
        let reply = match behaviour {
            Behaviour::Accept | Behaviour::Refuse => ack::build(&message, AckCode::AA, None),
            Behaviour::Error(text) => {
                let rejection = Rejection::error(text);
                ack::build(&message, AckCode::AE, Some(&rejection))
            }
            Behaviour::Reject(text) => {
                let rejection = Rejection::reject(ErrorCode::UnsupportedMessageType, text);
                ack::build(&message, AckCode::AR, Some(&rejection))
            }
            Behaviour::Delay(delay) => {
                tokio::time::sleep(delay).await;
                ack::build(&message, AckCode::AA, None)
            }
            Behaviour::Silent | Behaviour::Blocked => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Behaviour::Echo => message,
        };
        self.state.lock().unwrap().in_flight -= 1;
        Ok(BytesMut::from(&reply.to_bytes()[..]))
    }
}

/// 测试用的短间隔配置
pub fn settings() -> DispatcherSettings {
    DispatcherSettings {
        connect_timeout_ms: 500,
        ack_timeout_ms: 500,
        poll_interval_ms: 50,
        retry_interval_ms: 50,
        bind_host: "127.0.0.1".to_string(),
        bind_retry_interval_ms: 50,
        bind_timeout_ms: 500,
        ..DispatcherSettings::default()
    }
}

pub fn sender(reference: &str) -> Connector {
    Connector::sender(reference, "127.0.0.1", 2575)
        .with_sending("VPMS", "MAIN")
        .with_receiving("CUBEX", "PHARM")
}

/// 创建控制ID为指定值的消息
pub fn order(control_id: &str) -> Hl7Message {
    let mut message = Hl7Message::new("RDE", "O11", "RDE_O11");
    message.set_header_field(10, control_id);
    message
}

/// 轮询直到条件满足，超时则失败
pub async fn wait_until<F, Fut>(description: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("Timed out waiting for {}", description);
}

pub async fn count(service: &Arc<dyn MessageService>, reference: &ConnectorRef, status: MessageStatus) -> u64 {
    service.get_messages(reference, status).await.unwrap()
}
