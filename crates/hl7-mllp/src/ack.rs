//! HL7 确认消息 (ACK)
//!
//! 解析远程系统返回的 ACK，以及为入站消息生成 ACK/NAK。

use hl7_core::Connector;
use std::fmt;

use crate::message::{Delimiters, Hl7Message, Segment};

/// 确认代码 (MSA-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckCode {
    /// Application Accept
    AA,
    /// Application Error
    AE,
    /// Application Reject
    AR,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::AA => "AA",
            AckCode::AE => "AE",
            AckCode::AR => "AR",
        }
    }

    /// 增强模式的 CA/CE/CR 按对应的应用确认处理
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AA" | "CA" => Some(AckCode::AA),
            "AE" | "CE" => Some(AckCode::AE),
            "AR" | "CR" => Some(AckCode::AR),
            _ => None,
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, AckCode::AA)
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HL7 错误代码表 (HL70357)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MessageAccepted,
    SegmentSequenceError,
    RequiredFieldMissing,
    DataTypeError,
    TableValueNotFound,
    UnsupportedMessageType,
    UnsupportedEventCode,
    UnsupportedProcessingId,
    UnsupportedVersionId,
    UnknownKeyIdentifier,
    DuplicateKeyIdentifier,
    ApplicationRecordLocked,
    ApplicationInternalError,
}

impl ErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::MessageAccepted => 0,
            ErrorCode::SegmentSequenceError => 100,
            ErrorCode::RequiredFieldMissing => 101,
            ErrorCode::DataTypeError => 102,
            ErrorCode::TableValueNotFound => 103,
            ErrorCode::UnsupportedMessageType => 200,
            ErrorCode::UnsupportedEventCode => 201,
            ErrorCode::UnsupportedProcessingId => 202,
            ErrorCode::UnsupportedVersionId => 203,
            ErrorCode::UnknownKeyIdentifier => 204,
            ErrorCode::DuplicateKeyIdentifier => 205,
            ErrorCode::ApplicationRecordLocked => 206,
            ErrorCode::ApplicationInternalError => 207,
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            ErrorCode::MessageAccepted => "Message accepted",
            ErrorCode::SegmentSequenceError => "Segment sequence error",
            ErrorCode::RequiredFieldMissing => "Required field missing",
            ErrorCode::DataTypeError => "Data type error",
            ErrorCode::TableValueNotFound => "Table value not found",
            ErrorCode::UnsupportedMessageType => "Unsupported message type",
            ErrorCode::UnsupportedEventCode => "Unsupported event code",
            ErrorCode::UnsupportedProcessingId => "Unsupported processing id",
            ErrorCode::UnsupportedVersionId => "Unsupported version id",
            ErrorCode::UnknownKeyIdentifier => "Unknown key identifier",
            ErrorCode::DuplicateKeyIdentifier => "Duplicate key identifier",
            ErrorCode::ApplicationRecordLocked => "Application record locked",
            ErrorCode::ApplicationInternalError => "Application internal error",
        }
    }
}

/// 接收应用拒绝消息时返回的信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: AckCode,
    pub error_code: ErrorCode,
    pub text: String,
}

impl Rejection {
    /// 应用错误 (AE)，可重试
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            code: AckCode::AE,
            error_code: ErrorCode::ApplicationInternalError,
            text: text.into(),
        }
    }

    /// 应用拒绝 (AR)
    pub fn reject(error_code: ErrorCode, text: impl Into<String>) -> Self {
        Self {
            code: AckCode::AR,
            error_code,
            text: text.into(),
        }
    }
}

/// ERR 段中的错误信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDetail {
    pub hl7_error_code: Option<String>,
    pub application_error_code: Option<String>,
    pub diagnostic_information: Option<String>,
    pub user_message: Option<String>,
}

impl ErrorDetail {
    fn from_segment(segment: &Segment, delimiters: &Delimiters) -> Self {
        let text = |index: usize| {
            segment
                .field(index)
                .filter(|v| !v.is_empty())
                .map(|v| delimiters.unescape(v))
        };
        Self {
            hl7_error_code: format_cwe(segment, 3, delimiters),
            application_error_code: format_cwe(segment, 5, delimiters),
            diagnostic_information: text(7),
            user_message: text(8),
        }
    }
}

/// 格式化 CWE 字段: "标识 - 文本" 加可选的原始文本
fn format_cwe(segment: &Segment, index: usize, delimiters: &Delimiters) -> Option<String> {
    let component = |n: usize| {
        segment
            .component(index, n, delimiters)
            .map(|v| delimiters.unescape(v))
    };
    let mut result = match (component(1), component(2)) {
        (Some(id), Some(text)) => format!("{} - {}", id, text),
        (Some(id), None) => id,
        (None, Some(text)) => text,
        (None, None) => return None,
    };
    if let Some(original) = component(9) {
        result.push_str("\nOriginal Text: ");
        result.push_str(&original);
    }
    Some(result)
}

/// 远程系统返回的确认消息
#[derive(Debug, Clone)]
pub struct Acknowledgement {
    pub code: AckCode,
    pub control_id: Option<String>,
    pub text: Option<String>,
    pub errors: Vec<ErrorDetail>,
    message: Hl7Message,
}

impl Acknowledgement {
    /// 从消息中提取确认信息，非 ACK 消息返回 None
    pub fn from_message(message: &Hl7Message) -> Option<Self> {
        if message.message_code() != Some("ACK") {
            return None;
        }
        let delimiters = message.delimiters();
        let msa = message.segment("MSA")?;
        let code = AckCode::parse(msa.component(1, 1, delimiters)?)?;
        let errors = message
            .segments_of("ERR")
            .map(|segment| ErrorDetail::from_segment(segment, delimiters))
            .collect();

        Some(Self {
            code,
            control_id: msa.field(2).filter(|v| !v.is_empty()).map(str::to_string),
            text: msa
                .field(3)
                .filter(|v| !v.is_empty())
                .map(|v| delimiters.unescape(v)),
            errors,
            message: message.clone(),
        })
    }

    pub fn is_accept(&self) -> bool {
        self.code.is_accept()
    }

    /// 生成错误描述，用于记录到消息的错误信息中
    pub fn error_message(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        if let Some(text) = &self.text {
            lines.push(text.clone());
        }
        for error in &self.errors {
            if let Some(code) = &error.hl7_error_code {
                lines.push(format!("HL7 Error Code: {}", code));
            }
            if let Some(code) = &error.application_error_code {
                lines.push(format!("Application Error Code: {}", code));
            }
            if let Some(diagnostic) = &error.diagnostic_information {
                lines.push(format!("Diagnostic Information: {}", diagnostic));
            }
            if let Some(user_message) = &error.user_message {
                lines.push(format!("User Message: {}", user_message));
            }
        }
        if lines.is_empty() {
            return format!("Message body: {}", self.message.to_display_string());
        }
        lines.join("\n")
    }
}

/// 收到非 ACK 回复时的错误描述
pub fn unsupported_response(response: &Hl7Message) -> String {
    format!(
        "Unsupported response: {}\nMessage: {}",
        response.name(),
        response.to_display_string()
    )
}

/// 为收到的消息生成确认
pub fn build(original: &Hl7Message, code: AckCode, rejection: Option<&Rejection>) -> Hl7Message {
    let header = |index: usize| original.header().field(index).unwrap_or_default().to_string();
    let mut ack = new_ack(
        original.trigger_event().unwrap_or_default(),
        original.version().unwrap_or("2.5"),
    );
    ack.set_header_field(3, header(5));
    ack.set_header_field(4, header(6));
    ack.set_header_field(5, header(3));
    ack.set_header_field(6, header(4));
    add_status(
        &mut ack,
        code,
        original.control_id().unwrap_or_default(),
        rejection,
    );
    ack
}

/// 无法解析原始消息时，根据连接器生成确认
pub fn build_generic(connector: &Connector, code: AckCode, rejection: Option<&Rejection>) -> Hl7Message {
    let mut ack = new_ack("", "2.5");
    ack.set_header_field(3, connector.receiving_application.as_str());
    ack.set_header_field(4, connector.receiving_facility.as_str());
    ack.set_header_field(5, connector.sending_application.as_str());
    ack.set_header_field(6, connector.sending_facility.as_str());
    add_status(&mut ack, code, "", rejection);
    ack
}

fn new_ack(trigger_event: &str, version: &str) -> Hl7Message {
    let mut ack = Hl7Message::new("ACK", trigger_event, "ACK");
    ack.set_header_field(12, version);
    ack
}

fn add_status(ack: &mut Hl7Message, code: AckCode, control_id: &str, rejection: Option<&Rejection>) {
    ack.add_segment(Segment::with_fields("MSA", [code.as_str(), control_id]));
    if let Some(rejection) = rejection {
        let d = *ack.delimiters();
        let c = d.component;
        let error_code = format!(
            "{}{c}{}{c}HL70357{c}{c}{c}{c}{c}{c}{}",
            rejection.error_code.code(),
            rejection.error_code.text(),
            d.escape(&rejection.text),
        );
        ack.add_segment(Segment::with_fields("ERR", ["", "", error_code.as_str(), "E"]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Hl7Parser;

    const ORDER: &str = "MSH|^~\\&|VPMS|MAIN|CUBEX|PHARM|20140825090215||RDE^O11^RDE_O11|1200022|P|2.5\rPID|1";

    fn parse(text: &str) -> Hl7Message {
        Hl7Parser::new().parse(text).unwrap()
    }

    #[test]
    fn test_build_accept() {
        let original = parse(ORDER);
        let ack = build(&original, AckCode::AA, None);

        assert_eq!(ack.name(), "ACK_O11");
        assert_eq!(ack.sending_application(), Some("CUBEX"));
        assert_eq!(ack.sending_facility(), Some("PHARM"));
        assert_eq!(ack.receiving_application(), Some("VPMS"));
        assert_eq!(ack.receiving_facility(), Some("MAIN"));

        let parsed = Acknowledgement::from_message(&parse(&ack.encode())).unwrap();
        assert_eq!(parsed.code, AckCode::AA);
        assert_eq!(parsed.control_id.as_deref(), Some("1200022"));
        assert!(parsed.errors.is_empty());
    }

    #[test]
    fn test_build_error_formats_message() {
        let original = parse(ORDER);
        let rejection = Rejection::error("simulated application exception");
        let ack = build(&original, rejection.code, Some(&rejection));

        let parsed = Acknowledgement::from_message(&parse(&ack.encode())).unwrap();
        assert_eq!(parsed.code, AckCode::AE);
        assert_eq!(
            parsed.error_message(),
            "HL7 Error Code: 207 - Application internal error\n\
             Original Text: simulated application exception"
        );
    }

    #[test]
    fn test_build_reject_escapes_text() {
        let original = parse(ORDER);
        let rejection = Rejection::reject(ErrorCode::UnsupportedMessageType, "no RDE^O11 | here");
        let ack = build(&original, rejection.code, Some(&rejection));

        let parsed = Acknowledgement::from_message(&parse(&ack.encode())).unwrap();
        assert_eq!(parsed.code, AckCode::AR);
        assert_eq!(
            parsed.error_message(),
            "HL7 Error Code: 200 - Unsupported message type\nOriginal Text: no RDE^O11 | here"
        );
    }

    #[test]
    fn test_error_message_includes_all_err_fields() {
        let ack = parse(
            "MSH|^~\\&|CUBEX|PHARM|VPMS|MAIN|20140825090216||ACK^O11^ACK|99|P|2.5\r\
             MSA|AE|1200022|Patient unknown\r\
             ERR|||204^Unknown key identifier|E|PX1^Bad patient||diag info|call support",
        );
        let parsed = Acknowledgement::from_message(&ack).unwrap();
        assert_eq!(
            parsed.error_message(),
            "Patient unknown\n\
             HL7 Error Code: 204 - Unknown key identifier\n\
             Application Error Code: PX1 - Bad patient\n\
             Diagnostic Information: diag info\n\
             User Message: call support"
        );
    }

    #[test]
    fn test_error_message_falls_back_to_body() {
        let ack = parse("MSH|^~\\&|CUBEX|PHARM|VPMS|MAIN|20140825090216||ACK|99|P|2.5\rMSA|AR|1200022");
        let parsed = Acknowledgement::from_message(&ack).unwrap();
        assert_eq!(
            parsed.error_message(),
            "Message body: MSH|^~\\&|CUBEX|PHARM|VPMS|MAIN|20140825090216||ACK|99|P|2.5\nMSA|AR|1200022"
        );
    }

    #[test]
    fn test_non_ack_is_not_acknowledgement() {
        let response = parse(ORDER);
        assert!(Acknowledgement::from_message(&response).is_none());
        assert_eq!(
            unsupported_response(&response),
            "Unsupported response: RDE_O11\nMessage: MSH|^~\\&|VPMS|MAIN|CUBEX|PHARM|20140825090215||RDE^O11^RDE_O11|1200022|P|2.5\nPID|1"
        );
    }

    #[test]
    fn test_build_generic_uses_connector() {
        let connector = Connector::receiver("lab", 2576)
            .with_sending("LABSYS", "LAB")
            .with_receiving("VPMS", "MAIN");
        let rejection = Rejection::error("Missing start of block");
        let nak = build_generic(&connector, AckCode::AE, Some(&rejection));
        assert_eq!(nak.sending_application(), Some("VPMS"));
        assert_eq!(nak.receiving_application(), Some("LABSYS"));

        let parsed = Acknowledgement::from_message(&nak).unwrap();
        assert_eq!(parsed.code, AckCode::AE);
        assert_eq!(parsed.control_id, None);
    }

    #[test]
    fn test_enhanced_codes_map_to_application_codes() {
        assert_eq!(AckCode::parse("CA"), Some(AckCode::AA));
        assert_eq!(AckCode::parse("CR"), Some(AckCode::AR));
        assert_eq!(AckCode::parse("XX"), None);
    }
}
