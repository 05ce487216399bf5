//! 注册表变化源：`RegNotifyChangeKeyValue` + 自动复位事件。
//!
//! 每次 `wait_for_change` 重新登记一次异步通知（登记在触发后失效），然后等待事件；
//! `release` 直接置位事件，因此在等待之前调用也不会丢失。
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use guestlink_core::config::RegistryHive;
use guestlink_core::notifier::ChangeSource;
use guestlink_core::store::StoreError;
use tracing::warn;
use windows::core::{HSTRING, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::System::Registry::{
    RegCloseKey, RegNotifyChangeKeyValue, RegOpenKeyExW, HKEY, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE,
    KEY_NOTIFY, REG_NOTIFY_CHANGE_LAST_SET, REG_NOTIFY_THREAD_AGNOSTIC,
};
use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject, INFINITE};

/// 内核事件句柄，可跨线程使用。
struct OwnedEvent(HANDLE);

unsafe impl Send for OwnedEvent {}
unsafe impl Sync for OwnedEvent {}

impl Drop for OwnedEvent {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

struct OwnedKey(HKEY);

unsafe impl Send for OwnedKey {}
unsafe impl Sync for OwnedKey {}

impl Drop for OwnedKey {
    fn drop(&mut self) {
        unsafe {
            let _ = RegCloseKey(self.0);
        }
    }
}

/// 注册表键变化源。
pub struct RegistryChangeSource {
    key: OwnedKey,
    event: OwnedEvent,
    display: String,
}

impl RegistryChangeSource {
    /// 以 `KEY_NOTIFY` 打开已存在的键并创建自动复位事件。
    ///
    /// 异常处理：
    /// - 键不存在或无权限返回 [`StoreError::Open`]
    pub fn open(hive: RegistryHive, path: &str) -> Result<Self, StoreError> {
        let (root, hive_name) = match hive {
            RegistryHive::HkeyLocalMachine => (HKEY_LOCAL_MACHINE, "HKLM"),
            RegistryHive::HkeyCurrentUser => (HKEY_CURRENT_USER, "HKCU"),
        };
        let display = format!("{hive_name}\\{path}");

        let mut hkey = HKEY::default();
        let status = unsafe { RegOpenKeyExW(root, &HSTRING::from(path), 0, KEY_NOTIFY, &mut hkey) };
        status
            .ok()
            .map_err(|e| StoreError::Open(format!("{display}: {e}")))?;
        let key = OwnedKey(hkey);

        let event = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }
            .map_err(|e| StoreError::Open(format!("创建事件失败: {e}")))?;

        Ok(Self {
            key,
            event: OwnedEvent(event),
            display,
        })
    }
}

impl ChangeSource for RegistryChangeSource {
    fn wait_for_change(&self) -> Result<(), StoreError> {
        let filter = REG_NOTIFY_CHANGE_LAST_SET | REG_NOTIFY_THREAD_AGNOSTIC;
        let status = unsafe { RegNotifyChangeKeyValue(self.key.0, true, filter, self.event.0, true) };
        status
            .ok()
            .map_err(|e| StoreError::Notify(format!("{}: {e}", self.display)))?;

        let wait = unsafe { WaitForSingleObject(self.event.0, INFINITE) };
        if wait != WAIT_OBJECT_0 {
            return Err(StoreError::Notify(format!("{}: 等待事件返回 {:?}", self.display, wait)));
        }
        Ok(())
    }

    fn release(&self) {
        if let Err(e) = unsafe { SetEvent(self.event.0) } {
            warn!(key = %self.display, error = %e, "置位通知事件失败");
        }
    }
}
