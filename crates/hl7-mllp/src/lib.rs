//! # HL7 MLLP 模块
//!
//! 提供 HL7 v2.x 消息在 TCP 上传输所需的编解码功能，包括：
//! - MLLP 帧编解码器（`0x0B <消息> 0x1C 0x0D`）
//! - ER7 管道格式消息的解析与编码
//! - ACK/NAK 确认消息的生成与解析

pub mod ack;
pub mod codec;
pub mod message;

pub use ack::{AckCode, Acknowledgement, ErrorCode, ErrorDetail, Rejection};
pub use codec::MllpCodec;
pub use message::{Delimiters, Hl7Message, Hl7Parser, Segment};
