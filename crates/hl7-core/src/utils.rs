//! 通用工具函数

use chrono::{DateTime, TimeZone};
use flate2::Crc;
use uuid::Uuid;

/// 错误信息的最大长度
pub const MAX_ERROR_LENGTH: usize = 5000;

/// HL7 v2 ER7 编码的 MIME 类型
pub const HL7_MIME_TYPE: &str = "application/hl7-v2+er7";

/// 计算 CRC-32 校验和
pub fn checksum(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

/// 生成消息控制ID (MSH-10)，最长20个字符
pub fn generate_control_id() -> String {
    Uuid::new_v4().simple().to_string().chars().take(20).collect()
}

/// 按连接器配置格式化 HL7 时间戳: YYYYMMDDHHMMSS[.SSS][+/-ZZZZ]
pub fn format_hl7_timestamp<Tz>(time: &DateTime<Tz>, include_millis: bool, include_time_zone: bool) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let mut result = time.format("%Y%m%d%H%M%S").to_string();
    if include_millis {
        result.push_str(&time.format(".%3f").to_string());
    }
    if include_time_zone {
        result.push_str(&time.format("%z").to_string());
    }
    result
}

/// 截断错误信息，避免超出存储限制
pub fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_LENGTH) {
        Some((index, _)) => error[..index].to_string(),
        None => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn test_checksum_detects_change() {
        let original = b"MSH|^~\\&|VPMS|MAIN\rPID|1||123";
        let mut corrupted = original.to_vec();
        corrupted[5] = b'x';
        assert_eq!(checksum(original), checksum(original));
        assert_ne!(checksum(original), checksum(&corrupted));
        // CRC-32 of "123456789"
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_format_hl7_timestamp() {
        let offset = FixedOffset::east_opt(10 * 3600).unwrap();
        let time = offset.with_ymd_and_hms(2014, 8, 25, 9, 2, 15).unwrap()
            + chrono::Duration::milliseconds(42);

        assert_eq!(format_hl7_timestamp(&time, false, false), "20140825090215");
        assert_eq!(format_hl7_timestamp(&time, true, false), "20140825090215.042");
        assert_eq!(format_hl7_timestamp(&time, false, true), "20140825090215+1000");
        assert_eq!(format_hl7_timestamp(&time, true, true), "20140825090215.042+1000");
    }

    #[test]
    fn test_truncate_error() {
        let short = "connection refused";
        assert_eq!(truncate_error(short), short);

        let long = "é".repeat(MAX_ERROR_LENGTH + 10);
        assert_eq!(truncate_error(&long).chars().count(), MAX_ERROR_LENGTH);
    }

    #[test]
    fn test_generate_control_id() {
        let id = generate_control_id();
        assert_eq!(id.len(), 20);
        assert_ne!(id, generate_control_id());
    }
}
