//! MLLP 帧编解码器
//!
//! 每条消息的帧格式为 `0x0B <消息字节> 0x1C 0x0D`。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hl7_core::{Hl7Error, Result};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// 块起始标记 (VT)
pub const START_BLOCK: u8 = 0x0B;
/// 块结束标记 (FS)
pub const END_BLOCK: u8 = 0x1C;
/// 结束标记之后的回车符
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// 默认最大帧长度 (1 MiB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// MLLP 编解码器
#[derive(Debug, Clone)]
pub struct MllpCodec {
    max_frame_length: usize,
}

impl MllpCodec {
    pub fn new() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    fn too_long(&self) -> Hl7Error {
        Hl7Error::Protocol(format!(
            "Frame exceeds maximum length of {} bytes",
            self.max_frame_length
        ))
    }
}

impl Default for MllpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MllpCodec {
    type Item = BytesMut;
    type Error = Hl7Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] != START_BLOCK {
            return Err(Hl7Error::Protocol(format!(
                "Missing start of block, found 0x{:02X}",
                src[0]
            )));
        }

        let end = match src[1..].iter().position(|b| *b == END_BLOCK) {
            Some(pos) => pos + 1,
            None => {
                if src.len() - 1 > self.max_frame_length {
                    return Err(self.too_long());
                }
                return Ok(None);
            }
        };

        if end - 1 > self.max_frame_length {
            return Err(self.too_long());
        }

        // 等待结束标记后的回车符
        if src.len() < end + 2 {
            return Ok(None);
        }

        if src[end + 1] != CARRIAGE_RETURN {
            return Err(Hl7Error::Protocol(format!(
                "Invalid end of block, expected 0x0D but found 0x{:02X}",
                src[end + 1]
            )));
        }

        let mut frame = src.split_to(end + 2);
        frame.advance(1);
        frame.truncate(frame.len() - 2);
        debug!("Decoded MLLP frame: {} bytes", frame.len());
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(Hl7Error::Protocol(format!(
                "Connection closed mid-frame with {} bytes unread",
                src.len()
            ))),
        }
    }
}

impl Encoder<Bytes> for MllpCodec {
    type Error = Hl7Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_length {
            return Err(self.too_long());
        }
        dst.reserve(item.len() + 3);
        dst.put_u8(START_BLOCK);
        dst.extend_from_slice(&item);
        dst.put_u8(END_BLOCK);
        dst.put_u8(CARRIAGE_RETURN);
        Ok(())
    }
}
