//! KVP 存储抽象与内存实现。
//!
//! [`KvpStore`] 只描述协议真正依赖的三个动作：写入、删除、按前缀枚举。
//! 具体绑定：
//! - 来宾侧：注册表键（见 `guestlink-windows::registry`）
//! - 主机侧：按虚拟机划分的 Hyper-V 数据交换服务（见 `guestlink-windows::vmkvp`）
//! - 测试/回环：[`MemoryKvpStore`]
//!
//! 约束：
//! - `read_all` 会被高频轮询调用，不能阻塞超过正常查询耗时
//! - 删除属于“尽力而为”的清理动作，调用方记录失败后继续执行
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::warn;

use crate::notifier::ChangeSource;

/// 存储访问错误。
#[derive(Debug, Error)]
pub enum StoreError {
    /// 无法打开/创建底层存储（例如注册表键），属于启动期致命错误。
    #[error("打开存储失败: {0}")]
    Open(String),
    #[error("写入 {name} 失败: {message}")]
    Write { name: String, message: String },
    #[error("删除 {name} 失败: {message}")]
    Delete { name: String, message: String },
    #[error("读取存储失败: {0}")]
    Read(String),
    /// 平台调用返回了失败码（例如 WMI 返回值或异步作业错误码）。
    #[error("平台调用失败 (code={code}): {description}")]
    Platform { code: u32, description: String },
    #[error("等待存储变化失败: {0}")]
    Notify(String),
}

/// 一个方向（或一台虚拟机）上的 KVP 存储。
pub trait KvpStore: Send + Sync {
    /// 写入（或覆盖）一个条目。
    fn write(&self, name: &str, value: &str) -> Result<(), StoreError>;

    /// 删除一个条目；条目不存在视为成功。
    fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// 枚举名称以 `prefix` 开头的全部条目。
    fn read_all(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError>;

    /// 删除名称以 `prefix` 开头的全部条目，返回成功删除的数量。
    ///
    /// 单个条目删除失败只记录日志，不中断其余条目的删除。
    fn delete_matching(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for name in self.read_all(prefix)?.into_keys() {
            match self.delete(&name) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(name = %name, error = %e, "删除条目失败"),
            }
        }
        Ok(deleted)
    }
}

impl<S: KvpStore + ?Sized> KvpStore for Arc<S> {
    fn write(&self, name: &str, value: &str) -> Result<(), StoreError> {
        (**self).write(name, value)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        (**self).delete(name)
    }

    fn read_all(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        (**self).read_all(prefix)
    }
}

/// 尽力删除：失败只记录告警。
pub fn delete_best_effort(store: &dyn KvpStore, name: &str) {
    if let Err(e) = store.delete(name) {
        warn!(name = %name, error = %e, "清理条目失败（忽略）");
    }
}

/// 进程内 KVP 存储。
///
/// 用途：
/// - 单元/集成测试中模拟注册表或 Hyper-V 数据交换服务
/// - 作为 [`ChangeSource`]，在条目变化时唤醒监视线程
///
/// 克隆得到的句柄共享同一份数据。
#[derive(Debug, Clone, Default)]
pub struct MemoryKvpStore {
    shared: Arc<MemoryShared>,
}

#[derive(Debug, Default)]
struct MemoryShared {
    state: Mutex<MemoryState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, String>,
    version: u64,
    observed_version: u64,
    releases: u64,
    observed_releases: u64,
    fail_writes: bool,
    fail_deletes: bool,
    fail_reads: bool,
}

impl MemoryKvpStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self, state: &mut MemoryState) {
        state.version += 1;
        self.shared.changed.notify_all();
    }

    /// 当前全部条目的快照。
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().entries.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 让后续写入返回错误（模拟平台写入失败）。
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// 让后续删除返回错误（模拟“无法替对端删除”）。
    pub fn set_fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }
}

impl KvpStore for MemoryKvpStore {
    fn write(&self, name: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(StoreError::Write {
                name: name.to_string(),
                message: "injected failure".to_string(),
            });
        }
        state.entries.insert(name.to_string(), value.to_string());
        self.bump(&mut state);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.fail_deletes {
            return Err(StoreError::Delete {
                name: name.to_string(),
                message: "injected failure".to_string(),
            });
        }
        if state.entries.remove(name).is_some() {
            self.bump(&mut state);
        }
        Ok(())
    }

    fn read_all(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let state = self.lock();
        if state.fail_reads {
            return Err(StoreError::Read("injected failure".to_string()));
        }
        Ok(state
            .entries
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect())
    }
}

impl ChangeSource for MemoryKvpStore {
    /// 阻塞直到出现上次观察之后的新写入/删除，或 [`ChangeSource::release`] 被调用。
    fn wait_for_change(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        while state.version == state.observed_version && state.releases == state.observed_releases {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.observed_version = state.version;
        state.observed_releases = state.releases;
        Ok(())
    }

    fn release(&self) {
        let mut state = self.lock();
        state.releases += 1;
        self.shared.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_all_filters_by_prefix() {
        let store = MemoryKvpStore::new();
        store.write("DevSetup{1}~1~1", "a").unwrap();
        store.write("DevSetup{2}~1~1", "b").unwrap();
        store.write("Other", "c").unwrap();
        let all = store.read_all("DevSetup{").unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.read_all("").unwrap().contains_key("Other"));
    }

    #[test]
    fn delete_matching_removes_only_prefixed_entries() {
        let store = MemoryKvpStore::new();
        store.write("DevSetup{1}~1~2", "a").unwrap();
        store.write("DevSetup{1}~2~2", "b").unwrap();
        store.write("DevSetup{10}~1~1", "c").unwrap();
        assert_eq!(store.delete_matching("DevSetup{1}~").unwrap(), 2);
        assert!(store.contains("DevSetup{10}~1~1"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn injected_failures_surface_as_errors() {
        let store = MemoryKvpStore::new();
        store.set_fail_writes(true);
        assert!(matches!(store.write("a", "b"), Err(StoreError::Write { .. })));
        store.set_fail_writes(false);
        store.write("a", "b").unwrap();
        store.set_fail_deletes(true);
        assert!(store.delete("a").is_err());
        delete_best_effort(&store, "a");
        assert!(store.contains("a"));
        store.set_fail_reads(true);
        assert!(store.read_all("").is_err());
    }

    #[test]
    fn wait_for_change_wakes_on_write_and_on_release() {
        let store = MemoryKvpStore::new();
        let writer = store.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            writer.write("k", "v").unwrap();
        });
        store.wait_for_change().unwrap();
        handle.join().unwrap();

        let releaser = store.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            releaser.release();
        });
        store.wait_for_change().unwrap();
        handle.join().unwrap();
    }
}
