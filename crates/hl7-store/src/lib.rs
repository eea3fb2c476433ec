//! # HL7消息存储模块
//!
//! 持久化出站与入站HL7消息，提供SQLite实现和内存实现。
//! 出站消息按连接器先进先出，`next` 以原子方式认领待发送消息。

pub mod connection;
pub mod memory;
pub mod models;
pub mod queries;
pub mod service;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use memory::InMemoryMessageService;
pub use queries::SqlMessageService;
pub use service::MessageService;
