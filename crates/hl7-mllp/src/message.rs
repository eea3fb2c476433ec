//! HL7 v2.x 消息模型
//!
//! 以 ER7（管道分隔）格式保存消息，保留原始字段文本，
//! 因此 `parse` 之后 `encode` 得到与输入完全相同的文本。

use chrono::Utc;
use hl7_core::utils::{format_hl7_timestamp, generate_control_id};
use hl7_core::{Hl7Error, Result};

/// HL7 分隔符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Delimiters {
    /// MSH-2 编码字符
    pub fn encoding_characters(&self) -> String {
        [self.component, self.repetition, self.escape, self.subcomponent]
            .iter()
            .collect()
    }

    /// 对文本中的分隔符进行转义
    pub fn escape(&self, text: &str) -> String {
        let e = self.escape;
        let mut result = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                c if c == self.escape => result.push_str(&format!("{e}E{e}")),
                c if c == self.field => result.push_str(&format!("{e}F{e}")),
                c if c == self.component => result.push_str(&format!("{e}S{e}")),
                c if c == self.repetition => result.push_str(&format!("{e}R{e}")),
                c if c == self.subcomponent => result.push_str(&format!("{e}T{e}")),
                '\r' => result.push_str(&format!("{e}X0D{e}")),
                '\n' => result.push_str(&format!("{e}X0A{e}")),
                c => result.push(c),
            }
        }
        result
    }

    /// 还原转义序列
    pub fn unescape(&self, text: &str) -> String {
        let mut result = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find(self.escape) {
            result.push_str(&rest[..start]);
            let after = &rest[start + self.escape.len_utf8()..];
            match after.find(self.escape) {
                Some(end) => {
                    let sequence = &after[..end];
                    match sequence {
                        "E" => result.push(self.escape),
                        "F" => result.push(self.field),
                        "S" => result.push(self.component),
                        "R" => result.push(self.repetition),
                        "T" => result.push(self.subcomponent),
                        "X0D" | "X0d" => result.push('\r'),
                        "X0A" | "X0a" => result.push('\n'),
                        ".br" => result.push('\n'),
                        other => {
                            // 未知序列原样保留
                            result.push(self.escape);
                            result.push_str(other);
                            result.push(self.escape);
                        }
                    }
                    rest = &after[end + self.escape.len_utf8()..];
                }
                None => {
                    result.push(self.escape);
                    rest = after;
                }
            }
        }
        result.push_str(rest);
        result
    }
}

/// HL7 段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    id: String,
    // MSH 从 MSH-2 开始存储，其余段从第1个字段开始
    fields: Vec<String>,
}

impl Segment {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            fields: Vec::new(),
        }
    }

    /// 使用字段列表创建段（字段从序号1开始；MSH 从 MSH-2 开始）
    pub fn with_fields<I, S>(id: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.to_string(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn is_header(&self) -> bool {
        self.id == "MSH"
    }

    fn position(&self, index: usize) -> Option<usize> {
        if self.is_header() {
            index.checked_sub(2)
        } else {
            index.checked_sub(1)
        }
    }

    /// 按 HL7 序号取字段原始文本。MSH-1 (字段分隔符) 不存储在段中，返回 None。
    pub fn field(&self, index: usize) -> Option<&str> {
        self.position(index)
            .and_then(|pos| self.fields.get(pos))
            .map(String::as_str)
    }

    /// 按 HL7 序号设置字段，必要时补齐空字段
    pub fn set_field(&mut self, index: usize, value: impl Into<String>) {
        if let Some(pos) = self.position(index) {
            if self.fields.len() <= pos {
                self.fields.resize(pos + 1, String::new());
            }
            self.fields[pos] = value.into();
        }
    }

    /// 取字段的第 `component` 个组件（从1开始），空值返回 None
    pub fn component(&self, index: usize, component: usize, delimiters: &Delimiters) -> Option<&str> {
        let field = self.field(index)?;
        let first_repetition = field.split(delimiters.repetition).next()?;
        first_repetition
            .split(delimiters.component)
            .nth(component.checked_sub(1)?)
            .filter(|value| !value.is_empty())
    }

    fn encode(&self, delimiters: &Delimiters, out: &mut String) {
        out.push_str(&self.id);
        for field in &self.fields {
            out.push(delimiters.field);
            out.push_str(field);
        }
    }
}

/// 解析后的 HL7 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hl7Message {
    delimiters: Delimiters,
    segments: Vec<Segment>,
    separator: &'static str,
    trailing_separator: bool,
}

impl Hl7Message {
    /// 创建新消息，MSH 使用默认分隔符、新的控制ID和当前时间
    pub fn new(message_code: &str, trigger_event: &str, structure: &str) -> Self {
        let delimiters = Delimiters::default();
        let mut msh = Segment::with_fields("MSH", [delimiters.encoding_characters()]);
        msh.set_field(7, format_hl7_timestamp(&Utc::now(), false, false));
        let message_type = if structure.is_empty() {
            format!("{}{}{}", message_code, delimiters.component, trigger_event)
        } else {
            format!(
                "{}{c}{}{c}{}",
                message_code,
                trigger_event,
                structure,
                c = delimiters.component
            )
        };
        msh.set_field(9, message_type);
        msh.set_field(10, generate_control_id());
        msh.set_field(11, "P");
        msh.set_field(12, "2.5");

        Self {
            delimiters,
            segments: vec![msh],
            separator: "\r",
            trailing_separator: false,
        }
    }

    pub fn delimiters(&self) -> &Delimiters {
        &self.delimiters
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// MSH 段
    pub fn header(&self) -> &Segment {
        &self.segments[0]
    }

    /// 设置 MSH 字段
    pub fn set_header_field(&mut self, index: usize, value: impl Into<String>) {
        self.segments[0].set_field(index, value);
    }

    /// 查找第一个指定类型的段
    pub fn segment(&self, id: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id == id)
    }

    /// 所有指定类型的段
    pub fn segments_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |s| s.id == id)
    }

    pub fn add_segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    fn header_component(&self, index: usize, component: usize) -> Option<&str> {
        self.header().component(index, component, &self.delimiters)
    }

    pub fn sending_application(&self) -> Option<&str> {
        self.header_component(3, 1)
    }

    pub fn sending_facility(&self) -> Option<&str> {
        self.header_component(4, 1)
    }

    pub fn receiving_application(&self) -> Option<&str> {
        self.header_component(5, 1)
    }

    pub fn receiving_facility(&self) -> Option<&str> {
        self.header_component(6, 1)
    }

    /// 消息代码 (MSH-9.1)，例如 ADT
    pub fn message_code(&self) -> Option<&str> {
        self.header_component(9, 1)
    }

    /// 触发事件 (MSH-9.2)，例如 A01
    pub fn trigger_event(&self) -> Option<&str> {
        self.header_component(9, 2)
    }

    /// 消息控制ID (MSH-10)
    pub fn control_id(&self) -> Option<&str> {
        self.header().field(10).filter(|v| !v.is_empty())
    }

    /// 处理ID (MSH-11)
    pub fn processing_id(&self) -> Option<&str> {
        self.header_component(11, 1)
    }

    /// 版本 (MSH-12)
    pub fn version(&self) -> Option<&str> {
        self.header_component(12, 1)
    }

    /// 消息名称，例如 ADT_A01
    pub fn name(&self) -> String {
        match (self.message_code(), self.trigger_event()) {
            (Some(code), Some(trigger)) => format!("{}_{}", code, trigger),
            (Some(code), None) => code.to_string(),
            _ => "UNKNOWN".to_string(),
        }
    }

    /// 编码为 ER7 文本
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push_str(self.separator);
            }
            segment.encode(&self.delimiters, &mut out);
        }
        if self.trailing_separator {
            out.push_str(self.separator);
        }
        out
    }

    /// 编码为字节
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }

    /// 便于日志阅读的格式（段之间换行）
    pub fn to_display_string(&self) -> String {
        self.segments
            .iter()
            .map(|s| {
                let mut out = String::new();
                s.encode(&self.delimiters, &mut out);
                out
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// HL7 解析器
#[derive(Debug, Clone)]
pub struct Hl7Parser {
    require_header_fields: bool,
}

impl Default for Hl7Parser {
    fn default() -> Self {
        Self {
            require_header_fields: true,
        }
    }
}

impl Hl7Parser {
    /// 创建新的HL7解析器，要求 MSH-9 与 MSH-10 存在
    pub fn new() -> Self {
        Self::default()
    }

    /// 只检查消息结构的宽松解析器
    pub fn lenient() -> Self {
        Self {
            require_header_fields: false,
        }
    }

    /// 从字节解码（UTF-8）
    pub fn decode(&self, bytes: &[u8]) -> Result<Hl7Message> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Hl7Error::Protocol(format!("Message is not valid UTF-8: {}", e)))?;
        self.parse(text)
    }

    /// 解析HL7消息
    pub fn parse(&self, message: &str) -> Result<Hl7Message> {
        if !message.starts_with("MSH") {
            return Err(Hl7Error::Protocol(
                "Message must start with MSH segment".to_string(),
            ));
        }

        let delimiters = Self::parse_delimiters(message)?;

        let separator = if message.contains("\r\n") {
            "\r\n"
        } else if message.contains('\r') {
            "\r"
        } else if message.contains('\n') {
            "\n"
        } else {
            "\r"
        };
        let trailing_separator = message.ends_with(separator);
        let body = message.strip_suffix(separator).unwrap_or(message);

        let segments = body
            .split(separator)
            .map(|line| Self::parse_segment(line, &delimiters))
            .collect::<Result<Vec<_>>>()?;

        let result = Hl7Message {
            delimiters,
            segments,
            separator,
            trailing_separator,
        };

        if self.require_header_fields {
            if result.message_code().is_none() {
                return Err(Hl7Error::Protocol("Missing message type (MSH-9)".to_string()));
            }
            if result.control_id().is_none() {
                return Err(Hl7Error::Protocol(
                    "Missing message control ID (MSH-10)".to_string(),
                ));
            }
        }
        Ok(result)
    }

    fn parse_delimiters(message: &str) -> Result<Delimiters> {
        let mut chars = message.chars().skip(3);
        let field = chars
            .next()
            .ok_or_else(|| Hl7Error::Protocol("Missing field separator (MSH-1)".to_string()))?;
        let encoding: Vec<char> = chars.take_while(|c| *c != field).collect();
        if encoding.len() < 3 {
            return Err(Hl7Error::Protocol(
                "Invalid encoding characters (MSH-2)".to_string(),
            ));
        }
        let defaults = Delimiters::default();
        Ok(Delimiters {
            field,
            component: encoding[0],
            repetition: encoding[1],
            escape: encoding[2],
            subcomponent: encoding.get(3).copied().unwrap_or(defaults.subcomponent),
        })
    }

    /// 解析单个段
    fn parse_segment(line: &str, delimiters: &Delimiters) -> Result<Segment> {
        let mut parts = line.split(delimiters.field);
        let id = parts.next().unwrap_or_default();
        if id.len() != 3 || !id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
            return Err(Hl7Error::Protocol(format!("Invalid segment: {:?}", line)));
        }
        Ok(Segment {
            id: id.to_string(),
            fields: parts.map(str::to_string).collect(),
        })
    }
}
