//! 服务器配置
//!
//! 从配置文件和环境变量（`HL7__` 前缀，`__` 分隔）加载，例如
//! `HL7__DATABASE__URL=sqlite://hl7.db`。

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use hl7_core::Connector;
use hl7_dispatch::DispatcherSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::{error, info};

/// 服务器完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 分发器配置
    pub dispatcher: DispatcherSettings,
    /// 管理API配置
    pub api: ApiConfig,
    /// 连接器
    pub connectors: Vec<Connector>,
    /// 接收方接受的消息类型（MSH-9.1），为空时接受所有消息
    pub accepted_message_types: Vec<String>,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 连接字符串
    pub url: String,
    /// 最大连接数
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://hl7.db".to_string(),
            max_connections: 8,
        }
    }
}

/// 管理API配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    /// 监听地址
    pub address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// 加载配置，未指定文件时只使用默认值和环境变量
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("HL7")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        let config: ServerConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        match path {
            Some(path) => info!("Configuration loaded from: {}", path),
            None => info!("Configuration loaded from environment"),
        }
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.check() {
            error!("Configuration validation failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            bail!("Database url cannot be empty");
        }
        if self.database.max_connections == 0 {
            bail!("Database max connections cannot be 0");
        }
        if self.api.enabled {
            self.api
                .address
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid API address: {}", self.api.address))?;
        }

        let mut references = HashSet::new();
        for connector in &self.connectors {
            if connector.reference.as_str().is_empty() {
                bail!("Connector reference cannot be empty");
            }
            if !references.insert(connector.reference.clone()) {
                bail!("Duplicate connector reference: {}", connector.reference);
            }
            if let Some((host, port)) = connector.remote() {
                if host.trim().is_empty() {
                    bail!("Connector {} has no host", connector.reference);
                }
                if port == 0 {
                    bail!("Connector {} port cannot be 0", connector.reference);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hl7_core::ConnectorKind;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.connectors.is_empty());
        assert_eq!(config.dispatcher, DispatcherSettings::default());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
accepted_message_types = ["ORU", "ADT"]

[database]
url = "sqlite::memory:"

[dispatcher]
ack_timeout_ms = 5000

[api]
enabled = false

[[connectors]]
reference = "pharmacy"
type = "sender"
host = "cubex.local"
port = 2575
sending_application = "VPMS"
sending_facility = "MAIN"
receiving_application = "CUBEX"
receiving_facility = "PHARM"
include_millis = true

[[connectors]]
reference = "lab"
type = "receiver"
port = 2576
sending_application = "LABSYS"
sending_facility = "LAB"
receiving_application = "VPMS"
receiving_facility = "MAIN"
"#,
        );

        let config = ServerConfig::load(file.path().to_str()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.database.max_connections, 8);
        assert_eq!(config.dispatcher.ack_timeout_ms, 5000);
        assert_eq!(config.dispatcher.retry_interval_ms, 30_000);
        assert!(!config.api.enabled);
        assert_eq!(config.accepted_message_types, vec!["ORU", "ADT"]);

        assert_eq!(config.connectors.len(), 2);
        let pharmacy = &config.connectors[0];
        assert!(pharmacy.include_millis);
        assert_eq!(pharmacy.remote(), Some(("cubex.local", 2575)));
        assert!(!pharmacy.is_suspended());
        assert_eq!(config.connectors[1].kind, ConnectorKind::Receiver { port: 2576 });
    }

    #[test]
    fn test_duplicate_references_are_rejected() {
        let config = ServerConfig {
            connectors: vec![
                Connector::sender("pharmacy", "cubex.local", 2575),
                Connector::receiver("pharmacy", 2576),
            ],
            ..ServerConfig::default()
        };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("Duplicate connector reference"));
    }

    #[test]
    fn test_sender_requires_host_and_port() {
        let config = ServerConfig {
            connectors: vec![Connector::sender("pharmacy", "", 2575)],
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            connectors: vec![Connector::sender("pharmacy", "cubex.local", 0)],
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        // 接收方端口 0 表示由系统分配
        let config = ServerConfig {
            connectors: vec![Connector::receiver("lab", 0)],
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_api_address() {
        let mut config = ServerConfig::default();
        config.api.address = "not an address".to_string();
        assert!(config.validate().is_err());

        config.api.enabled = false;
        assert!(config.validate().is_ok());
    }
}
