//! 配置文件模型（agent.json / host.json）。
//!
//! 约定：
//! - 所有字段带默认值，缺少字段或缺少整个文件时使用默认配置
//! - 时间类字段以毫秒/秒为单位的整数表示，便于手工编辑
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{MessageCodec, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_PREFIX, DEFAULT_SEPARATOR};
use crate::request::DEFAULT_QUEUE_CAPACITY;

/// 协议参数（主机与来宾必须一致）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub prefix: String,
    pub separator: char,
    pub max_chunk_size: usize,
    /// 主机轮询来宾响应的间隔（毫秒）。
    pub poll_interval_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            separator: DEFAULT_SEPARATOR,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            poll_interval_ms: 500,
        }
    }
}

impl ProtocolConfig {
    pub fn codec(&self) -> MessageCodec {
        MessageCodec::new(self.prefix.clone(), self.separator, self.max_chunk_size)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// 注册表根键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryHive {
    HkeyLocalMachine,
    HkeyCurrentUser,
}

/// 来宾代理配置。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub protocol: ProtocolConfig,
    pub hive: RegistryHive,
    /// 主机写入、来宾读取的键。
    pub from_host_key: String,
    /// 来宾写入、主机读取的键。
    pub to_host_key: String,
    pub queue_capacity: usize,
    /// 变化通知丢失时的兜底轮询间隔（毫秒）。
    pub fallback_poll_ms: u64,
    /// 应用配置文档的外部命令；`{file}` 会被替换为文档路径。
    pub configure_command: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            hive: RegistryHive::HkeyLocalMachine,
            from_host_key: r"SOFTWARE\Microsoft\Virtual Machine\External".to_string(),
            to_host_key: r"SOFTWARE\Microsoft\Virtual Machine\Guest".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            fallback_poll_ms: 5_000,
            configure_command: vec![
                "winget.exe".to_string(),
                "configure".to_string(),
                "--file".to_string(),
                "{file}".to_string(),
                "--accept-configuration-agreements".to_string(),
                "--disable-interactivity".to_string(),
            ],
        }
    }
}

impl AgentConfig {
    pub fn fallback_poll(&self) -> Duration {
        Duration::from_millis(self.fallback_poll_ms)
    }
}

/// 主机 CLI 配置。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub protocol: ProtocolConfig,
    /// 等待最终响应的默认超时（秒）。
    pub response_timeout_secs: u64,
    /// 会话检查点目录；为空时使用 ProgramData 下的默认目录。
    pub state_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            response_timeout_secs: 60,
            state_dir: None,
        }
    }
}

impl HostConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// 读取 JSON 配置；文件不存在时返回默认值。
///
/// 异常处理：
/// - 文件存在但读取/解析失败时返回错误（不静默回退到默认值）
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let bytes = std::fs::read(path).with_context(|| format!("读取配置失败: {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("解析配置 JSON 失败: {}", path.display()))
}
