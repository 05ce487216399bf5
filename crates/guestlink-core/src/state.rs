//! 主机侧会话检查点（sessions/<vm>.json）。
//!
//! 目的：
//! - 记录下一个可用的通信 ID 计数器，主机 CLI 重启后不会复用旧 ID
//!   （来宾存储里可能还留着旧 ID 的响应）
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::paths::ensure_dir;

/// 会话检查点。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub vm_id: String,
    pub next_communication_id: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SessionCheckpoint {
    pub fn new(vm_id: impl Into<String>, next_communication_id: u32) -> Self {
        Self {
            vm_id: vm_id.into(),
            next_communication_id,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    /// 读取检查点；文件不存在返回 `None`。
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path).with_context(|| format!("读取会话检查点失败: {}", path.display()))?;
        let checkpoint = serde_json::from_slice(&bytes)
            .with_context(|| format!("解析会话检查点失败: {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    /// 写入检查点（先写临时文件再替换）。
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("序列化会话检查点失败")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).with_context(|| format!("写入失败: {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("替换失败: {}", path.display()))?;
        Ok(())
    }
}
