//! 基于注册表键的 KVP 存储（来宾侧）。
//!
//! Hyper-V 集成服务在来宾内把数据交换映射为两个注册表键：
//! - `HKLM\SOFTWARE\Microsoft\Virtual Machine\External`：主机写入的条目
//! - `HKLM\SOFTWARE\Microsoft\Virtual Machine\Guest`：来宾写给主机的条目
//!
//! 每个条目对应一个 REG_SZ 值；其他类型的值忽略。
//!
//! 权限要求：
//! - 写入 HKLM 需要管理员/SYSTEM；测试使用 HKCU 下的临时键
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::BTreeMap;
use std::io;

use guestlink_core::config::RegistryHive;
use guestlink_core::store::{KvpStore, StoreError};
use winreg::enums::{RegType, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_ALL_ACCESS};
use winreg::types::FromRegValue;
use winreg::RegKey;

/// 将 [`RegistryHive`] 转换为 winreg 根键。
pub fn predef(hive: RegistryHive) -> RegKey {
    match hive {
        RegistryHive::HkeyLocalMachine => RegKey::predef(HKEY_LOCAL_MACHINE),
        RegistryHive::HkeyCurrentUser => RegKey::predef(HKEY_CURRENT_USER),
    }
}

/// 可读的根键名（用于日志与错误信息）。
pub fn hive_name(hive: RegistryHive) -> &'static str {
    match hive {
        RegistryHive::HkeyLocalMachine => "HKLM",
        RegistryHive::HkeyCurrentUser => "HKCU",
    }
}

/// 注册表 KVP 存储。
pub struct RegistryKvpStore {
    key: RegKey,
    display: String,
}

impl RegistryKvpStore {
    /// 打开（不存在则创建）指定键。
    ///
    /// 异常处理：
    /// - 打开/创建失败返回 [`StoreError::Open`]，属于启动期致命错误
    pub fn open(hive: RegistryHive, path: &str) -> Result<Self, StoreError> {
        let display = format!("{}\\{}", hive_name(hive), path);
        let (key, _disp) = predef(hive)
            .create_subkey_with_flags(path, KEY_ALL_ACCESS)
            .map_err(|e| StoreError::Open(format!("{display}: {e}")))?;
        Ok(Self { key, display })
    }

    pub fn display(&self) -> &str {
        &self.display
    }
}

impl KvpStore for RegistryKvpStore {
    fn write(&self, name: &str, value: &str) -> Result<(), StoreError> {
        self.key.set_value(name, &value).map_err(|e| StoreError::Write {
            name: name.to_string(),
            message: format!("{}: {e}", self.display),
        })
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        match self.key.delete_value(name) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Delete {
                name: name.to_string(),
                message: format!("{}: {e}", self.display),
            }),
        }
    }

    fn read_all(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let mut entries = BTreeMap::new();
        for item in self.key.enum_values() {
            let (name, value) = item.map_err(|e| StoreError::Read(format!("{}: {e}", self.display)))?;
            if !name.starts_with(prefix) || value.vtype != RegType::REG_SZ {
                continue;
            }
            match String::from_reg_value(&value) {
                Ok(text) => {
                    entries.insert(name, text);
                }
                Err(e) => tracing::debug!(name = %name, error = %e, "跳过无法解码的注册表值"),
            }
        }
        Ok(entries)
    }
}
