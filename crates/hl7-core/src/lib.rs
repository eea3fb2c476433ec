//! # HL7 Core
//!
//! 消息分发子系统的核心模块，提供连接器模型、消息记录、错误定义和通用工具。

pub mod error;
pub mod models;
pub mod utils;

pub use error::{Hl7Error, Result};
pub use models::*;
