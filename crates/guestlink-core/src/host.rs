//! 主机侧通道：向虚拟机写入请求分片，读取来宾写出的响应。
//!
//! 主机无法替来宾删除条目，只能清理自己写出的分片；已写出的分片名记录在通道内，
//! 收到对应响应或通道释放时删除。
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::codec::MessageCodec;
use crate::store::{delete_best_effort, KvpStore, StoreError};

/// 主机侧通道。
pub struct HostChannel {
    outbound: Arc<dyn KvpStore>,
    inbound: Arc<dyn KvpStore>,
    codec: MessageCodec,
    written: Mutex<BTreeSet<String>>,
}

impl HostChannel {
    /// 参数：
    /// - outbound：主机写入、来宾读取的存储
    /// - inbound：来宾写入、主机读取的存储
    ///
    /// 同一个虚拟机存储可以同时作为两个方向传入。
    pub fn new(outbound: Arc<dyn KvpStore>, inbound: Arc<dyn KvpStore>, codec: MessageCodec) -> Self {
        Self {
            outbound,
            inbound,
            codec,
            written: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    fn written(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 分片写出一条消息。
    ///
    /// 步骤：
    /// - 按分片数生成全部分片名，逐个预先删除（可能是上次运行残留）
    /// - 写入分片，并记录分片名以便之后清理
    ///
    /// 异常处理：
    /// - 任一分片写入失败即返回错误；已写入的分片仍会在清理时删除
    pub fn write_message(&self, communication_id: &str, payload: &str) -> Result<usize, StoreError> {
        let chunks = self.codec.encode(communication_id, payload);
        for (name, _) in &chunks {
            delete_best_effort(self.outbound.as_ref(), name);
        }
        for (name, value) in &chunks {
            self.written().insert(name.clone());
            self.outbound.write(name, value)?;
        }
        debug!(communication_id, chunks = chunks.len(), "请求已写出");
        Ok(chunks.len())
    }

    /// 读取来宾写出的全部完整消息（逻辑 ID → 内容）。
    pub fn read_messages(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let raw = self.inbound.read_all(&self.codec.message_id_start())?;
        Ok(self.codec.merge(&raw))
    }

    /// 删除某个通信 ID 下由主机写出的分片。
    pub fn cleanup(&self, communication_id: &str) {
        let names: Vec<String> = {
            let mut written = self.written();
            let matching: Vec<String> = written
                .iter()
                .filter(|name| {
                    self.codec
                        .parse_chunk_name(name)
                        .is_some_and(|chunk| chunk.logical_id == communication_id)
                })
                .cloned()
                .collect();
            for name in &matching {
                written.remove(name);
            }
            matching
        };
        for name in &names {
            delete_best_effort(self.outbound.as_ref(), name);
        }
    }

    /// 删除全部由主机写出且尚未清理的分片。
    pub fn cleanup_all(&self) {
        let names = std::mem::take(&mut *self.written());
        if names.is_empty() {
            return;
        }
        for name in &names {
            delete_best_effort(self.outbound.as_ref(), name);
        }
        info!(count = names.len(), "已清理主机写出的分片");
    }

    /// 当前仍待清理的分片名。
    pub fn pending_cleanup(&self) -> Vec<String> {
        self.written().iter().cloned().collect()
    }
}

impl Drop for HostChannel {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}
