//! # HL7消息分发模块
//!
//! 通过 MLLP 在外部系统之间收发 HL7 v2.x 消息：
//! - 连接器注册表，配置变化时通知分发器
//! - 每个发送方连接器一个出站工作任务，按创建顺序投递并等待确认
//! - 每个接收方连接器一个入站监听器，保存消息后交给接收应用并回复确认
//! - 运行时统计信息
//! - 管理用 RESTful API

pub mod api;
pub mod connectors;
pub mod dispatcher;
pub mod receiver;
pub mod sender;
pub mod statistics;
pub mod transport;

pub use api::{create_api_routes, ApiServer, ApiState};
pub use connectors::{ConnectorEvent, ConnectorRegistry, Connectors};
pub use dispatcher::{DispatcherSettings, MessageDispatcher};
pub use receiver::ReceivingApplication;
pub use statistics::Statistics;
pub use transport::{Connection, TcpTransport, Transport};
