//! 错误定义模块

use thiserror::Error;

/// 消息分发子系统统一错误类型
#[derive(Error, Debug)]
pub enum Hl7Error {
    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("无效状态: {0}")]
    InvalidState(String),

    #[error("不支持的操作: {0}")]
    Unsupported(String),

    #[error("持久化错误: {0}")]
    Persistence(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("超时: {0}")]
    Timeout(String),

    #[error("连接器未找到: {0}")]
    NotFound(String),

    #[error("操作被中断: {0}")]
    Interrupted(String),

    #[error("配置错误: {0}")]
    Config(String),
}

impl Hl7Error {
    /// 是否为传输层错误（连接失败、超时、连接重置）
    pub fn is_transport(&self) -> bool {
        matches!(self, Hl7Error::Network(_) | Hl7Error::Timeout(_))
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Hl7Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(Hl7Error::from(refused).is_transport());
        assert!(Hl7Error::Timeout("ack".to_string()).is_transport());
        assert!(!Hl7Error::Protocol("bad frame".to_string()).is_transport());
        assert!(!Hl7Error::Persistence("disk full".to_string()).is_transport());
    }
}
