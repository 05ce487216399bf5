//! 来宾侧通道：从主机方向的存储读取请求，向来宾方向的存储写出响应。
//!
//! 约束：
//! - 请求读取后立即删除其全部分片，同一请求只会被交付一次
//! - 存储错误只记录日志，视为“本轮没有消息”
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::{CancellationToken, Deadline};
use crate::codec::MessageCodec;
use crate::message::{RequestMessage, ResponseMessage};
use crate::notifier::{ChangeNotifier, WaitOutcome};
use crate::store::{delete_best_effort, KvpStore, StoreError};

/// 通知丢失时的兜底轮询间隔。
pub const DEFAULT_FALLBACK_POLL: Duration = Duration::from_secs(5);

/// 来宾侧通道。
pub struct GuestChannel<N: ChangeNotifier> {
    inbound: Arc<dyn KvpStore>,
    outbound: Arc<dyn KvpStore>,
    notifier: N,
    codec: MessageCodec,
    fallback_poll: Duration,
    /// 已交付的逻辑 ID；分片从存储中消失后移除。
    consumed: Mutex<HashSet<String>>,
}

/// 离开作用域时停止通知器。
struct StopGuard<'a, N: ChangeNotifier>(&'a N);

impl<N: ChangeNotifier> Drop for StopGuard<'_, N> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

impl<N: ChangeNotifier> GuestChannel<N> {
    /// 参数：
    /// - inbound：主机写入、来宾读取的存储
    /// - outbound：来宾写入、主机读取的存储
    /// - notifier：inbound 的变化通知
    pub fn new(
        inbound: Arc<dyn KvpStore>,
        outbound: Arc<dyn KvpStore>,
        notifier: N,
        codec: MessageCodec,
    ) -> Self {
        Self {
            inbound,
            outbound,
            notifier,
            codec,
            fallback_poll: DEFAULT_FALLBACK_POLL,
            consumed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_fallback_poll(mut self, interval: Duration) -> Self {
        self.fallback_poll = interval.max(Duration::from_millis(1));
        self
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    /// 等待下一条完整请求。
    ///
    /// 参数：
    /// - cancel：取消令牌
    /// - max_wait：最长等待时间
    ///
    /// 返回值：
    /// - `Some(请求)`：请求的全部分片已从存储删除
    /// - `None`：已取消或超时
    pub fn wait_for_message(
        &self,
        cancel: &CancellationToken,
        max_wait: Duration,
    ) -> Option<RequestMessage> {
        if let Err(e) = self.notifier.start() {
            warn!(error = %e, "启动变化通知失败，改为轮询");
        }
        let _stop = StopGuard(&self.notifier);

        let deadline = Deadline::after(max_wait);
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(message) = self.take_next_message() {
                return Some(message);
            }
            let remaining = deadline.remaining()?;
            let slice = self.fallback_poll.min(remaining);
            if self.notifier.wait(cancel, slice) == WaitOutcome::Cancelled {
                return None;
            }
        }
    }

    /// 取出计数器最小的一条完整请求并删除其分片。
    ///
    /// 分片删除失败时请求仍留在存储中，记入已交付集合，不会再次交付。
    fn take_next_message(&self) -> Option<RequestMessage> {
        let raw = match self.inbound.read_all(&self.codec.message_id_start()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "读取主机消息失败");
                return None;
            }
        };

        let mut consumed = self.consumed.lock().unwrap_or_else(PoisonError::into_inner);
        let present: HashSet<&str> = raw
            .keys()
            .filter_map(|name| self.codec.parse_chunk_name(name))
            .map(|chunk| chunk.logical_id)
            .collect();
        consumed.retain(|id| present.contains(id.as_str()));

        let (request_id, request_data) = self
            .codec
            .merge(&raw)
            .into_iter()
            .filter(|(id, _)| !consumed.contains(id))
            .min_by_key(|(id, _)| {
                (
                    self.codec.counter_from_communication_id(id).unwrap_or(u32::MAX),
                    id.clone(),
                )
            })?;

        // 同一逻辑 ID 的所有分片（包括总数不同的残留分片）一并删除
        for name in raw.keys() {
            if self.owns_chunk(name, &request_id) {
                delete_best_effort(self.inbound.as_ref(), name);
            }
        }
        consumed.insert(request_id.clone());
        debug!(request_id = %request_id, len = request_data.len(), "收到主机请求");
        Some(RequestMessage {
            request_id,
            request_data,
        })
    }

    fn owns_chunk(&self, name: &str, logical_id: &str) -> bool {
        self.codec
            .parse_chunk_name(name)
            .is_some_and(|chunk| chunk.logical_id == logical_id)
    }

    /// 分片写出一条响应（进度或最终响应）。
    ///
    /// 写入前先删除同名旧分片，避免与上一次运行的残留混淆。
    pub fn send_response(&self, response: &ResponseMessage) -> Result<(), StoreError> {
        let id = &response.communication_id;
        self.delete_chunks(id);
        for (name, value) in self.codec.encode(id, &response.response_data) {
            self.outbound.write(&name, &value)?;
        }
        debug!(communication_id = %id, "响应已写出");
        Ok(())
    }

    /// 删除来宾自己写出的某条响应（主机确认收到后调用）。
    pub fn delete_response(&self, communication_id: &str) {
        let removed = self.delete_chunks(communication_id);
        debug!(communication_id, removed, "已删除确认过的响应");
    }

    /// 删除某个逻辑 ID 的全部分片；名称前缀相同的其他消息（如其进度消息）不受影响。
    fn delete_chunks(&self, logical_id: &str) -> usize {
        let prefix = format!("{logical_id}{}", self.codec.separator());
        let names = match self.outbound.read_all(&prefix) {
            Ok(raw) => raw.into_keys(),
            Err(e) => {
                warn!(logical_id, error = %e, "读取旧分片失败");
                return 0;
            }
        };
        let mut removed = 0;
        for name in names.filter(|name| self.owns_chunk(name, logical_id)) {
            match self.outbound.delete(&name) {
                Ok(()) => removed += 1,
                Err(e) => warn!(name = %name, error = %e, "删除旧分片失败"),
            }
        }
        removed
    }

    /// 启动时清理两个方向上的全部协议条目。
    pub fn purge_stale(&self) -> usize {
        let start = self.codec.message_id_start();
        let mut removed = 0;
        for (direction, store) in [("inbound", &self.inbound), ("outbound", &self.outbound)] {
            match store.delete_matching(&start) {
                Ok(n) => removed += n,
                Err(e) => warn!(direction, error = %e, "清理残留消息失败"),
            }
        }
        if removed > 0 {
            info!(removed, "已清理上次运行残留的消息");
        }
        removed
    }
}
