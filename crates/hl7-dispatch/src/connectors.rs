//! 连接器注册表

use async_trait::async_trait;
use hl7_core::{Connector, ConnectorRef};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

/// 连接器查询接口
#[async_trait]
pub trait Connectors: Send + Sync {
    /// 按引用查找连接器
    async fn get_connector(&self, reference: &ConnectorRef) -> Option<Connector>;

    /// 所有已配置的连接器
    async fn get_connectors(&self) -> Vec<Connector>;
}

/// 连接器变化事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// 新增或替换
    Updated(Connector),
    /// 删除
    Removed(ConnectorRef),
}

/// 内存连接器注册表
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<ConnectorRef, Connector>>,
    events: broadcast::Sender<ConnectorEvent>,
}

impl ConnectorRegistry {
    /// 创建空的注册表
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connectors: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// 使用初始连接器创建注册表
    pub fn with_connectors(connectors: impl IntoIterator<Item = Connector>) -> Self {
        let registry = Self::new();
        let map = connectors
            .into_iter()
            .map(|connector| (connector.reference.clone(), connector))
            .collect();
        Self {
            connectors: RwLock::new(map),
            ..registry
        }
    }

    /// 新增或整体替换连接器
    pub async fn replace(&self, connector: Connector) {
        info!("Registering connector: {}", connector);
        self.connectors
            .write()
            .await
            .insert(connector.reference.clone(), connector.clone());
        // 没有订阅者时发送失败，可以忽略
        let _ = self.events.send(ConnectorEvent::Updated(connector));
    }

    /// 删除连接器
    pub async fn remove(&self, reference: &ConnectorRef) -> Option<Connector> {
        let removed = self.connectors.write().await.remove(reference);
        if removed.is_some() {
            info!("Removed connector: {}", reference);
            let _ = self.events.send(ConnectorEvent::Removed(reference.clone()));
        }
        removed
    }

    /// 订阅连接器变化
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events.subscribe()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connectors for ConnectorRegistry {
    async fn get_connector(&self, reference: &ConnectorRef) -> Option<Connector> {
        self.connectors.read().await.get(reference).cloned()
    }

    async fn get_connectors(&self) -> Vec<Connector> {
        let mut connectors: Vec<Connector> = self.connectors.read().await.values().cloned().collect();
        connectors.sort_by(|a, b| a.reference.cmp(&b.reference));
        connectors
    }
}
