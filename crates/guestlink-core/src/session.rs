//! 主机侧会话：通信 ID 计数器、响应去重与确认。
//!
//! 流程：
//! - `send_request` 取下一个计数器，分片写出请求
//! - `wait_for_responses` 每隔 `poll_interval` 读取来宾存储，返回本通信 ID 下新出现的
//!   进度消息（按序号升序）与最终响应（最后）
//! - 每条新交付的消息都会回一个 `Ack` 请求，来宾据此删除该消息
//!
//! 主机不能删除来宾写出的条目，所以已交付的消息 ID 会保留在去重集合中，
//! 直到它从存储中消失。
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::{CancellationToken, Deadline};
use crate::host::HostChannel;
use crate::message::{request_id_of, RequestBody, RequestEnvelope, ResponseEnvelope, ResponseMessage};
use crate::store::StoreError;

/// 默认轮询间隔。
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("序列化请求失败: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("操作已取消")]
    Cancelled,
    #[error("等待 {communication_id} 的响应超时")]
    TimedOut { communication_id: String },
    #[error("响应无法解析 ({communication_id}): {message}")]
    InvalidResponse { communication_id: String, message: String },
}

/// 与单台虚拟机中来宾代理的会话。
pub struct GuestSession {
    channel: HostChannel,
    next_counter: Mutex<u32>,
    processed: Mutex<HashSet<String>>,
    poll_interval: Duration,
}

impl GuestSession {
    pub fn new(channel: HostChannel) -> Self {
        Self {
            channel,
            next_counter: Mutex::new(1),
            processed: Mutex::new(HashSet::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn channel(&self) -> &HostChannel {
        &self.channel
    }

    fn counter(&self) -> MutexGuard<'_, u32> {
        self.next_counter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn processed(&self) -> MutexGuard<'_, HashSet<String>> {
        self.processed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 下一个将要使用的计数器。
    pub fn next_communication_id_counter(&self) -> u32 {
        *self.counter()
    }

    /// 抬高下一个计数器（只增不减），用于跨进程续用通信 ID。
    pub fn set_next_communication_id_counter(&self, counter: u32) {
        let mut next = self.counter();
        if counter > *next {
            *next = counter;
        }
    }

    fn take_counter(&self) -> u32 {
        let mut next = self.counter();
        let counter = *next;
        *next = next.checked_add(1).unwrap_or(1);
        counter
    }

    /// 发送请求，返回所用的通信 ID 计数器。
    pub fn send_request(&self, payload: &str, cancel: &CancellationToken) -> Result<u32, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        let counter = self.take_counter();
        let communication_id = self.channel.codec().communication_id(counter);
        self.channel.write_message(&communication_id, payload)?;
        Ok(counter)
    }

    /// 等待某次请求的响应。
    ///
    /// 参数：
    /// - counter：`send_request` 返回的计数器
    /// - request_id：若给出，只接受信封 `RequestId` 相同的响应
    /// - timeout：最长等待时间
    /// - expect_progress：是否同时收取进度消息
    /// - cancel：取消令牌
    ///
    /// 返回值：
    /// - 新交付的消息，进度按序号升序在前，最终响应在后
    /// - 超时或取消时为空
    pub fn wait_for_responses(
        &self,
        counter: u32,
        request_id: Option<&str>,
        timeout: Duration,
        expect_progress: bool,
        cancel: &CancellationToken,
    ) -> Vec<ResponseMessage> {
        let communication_id = self.channel.codec().communication_id(counter);
        let deadline = Deadline::after(timeout);
        loop {
            if cancel.is_cancelled() {
                return Vec::new();
            }
            match self.channel.read_messages() {
                Ok(messages) => {
                    let delivered = self.deliver(&communication_id, messages, request_id, expect_progress, cancel);
                    if !delivered.is_empty() {
                        return delivered;
                    }
                }
                Err(e) => warn!(error = %e, "读取来宾消息失败"),
            }
            let Some(remaining) = deadline.remaining() else {
                return Vec::new();
            };
            if cancel.wait_timeout(self.poll_interval.min(remaining)) {
                return Vec::new();
            }
        }
    }

    /// 从一次读取结果中挑出新消息，确认并刷新去重集合。
    fn deliver(
        &self,
        communication_id: &str,
        messages: BTreeMap<String, String>,
        request_id: Option<&str>,
        expect_progress: bool,
        cancel: &CancellationToken,
    ) -> Vec<ResponseMessage> {
        let codec = self.channel.codec();
        let mut progress: Vec<(u32, String, String)> = Vec::new();
        let mut final_response = None;
        for (id, data) in &messages {
            if id == communication_id {
                final_response = Some((id.clone(), data.clone()));
            } else if expect_progress {
                if let Some((owner, sequence)) = codec.parse_progress_name(id) {
                    if owner == communication_id {
                        progress.push((sequence, id.clone(), data.clone()));
                    }
                }
            }
        }
        progress.sort_by_key(|(sequence, _, _)| *sequence);

        let candidates = progress
            .into_iter()
            .map(|(_, id, data)| (id, data))
            .chain(final_response);

        let mut processed = self.processed();
        // 只保留仍在存储中的已处理 ID
        processed.retain(|id| messages.contains_key(id));

        let mut delivered = Vec::new();
        for (id, data) in candidates {
            if processed.contains(&id) {
                continue;
            }
            if let Some(expected) = request_id {
                if request_id_of(&data).as_deref() != Some(expected) {
                    debug!(communication_id = %id, "忽略 RequestId 不匹配的旧响应");
                    continue;
                }
            }
            processed.insert(id.clone());
            delivered.push(ResponseMessage {
                communication_id: id,
                response_data: data,
            });
        }
        drop(processed);

        if !delivered.is_empty() {
            for message in &delivered {
                self.acknowledge(&message.communication_id, cancel);
            }
            // 已收到响应，来宾已经消费了本通信 ID 下的请求分片
            self.channel.cleanup(communication_id);
        }
        delivered
    }

    fn acknowledge(&self, delivered_id: &str, cancel: &CancellationToken) {
        let ack = RequestEnvelope::new(RequestBody::Ack {
            ack_communication_id: delivered_id.to_string(),
        });
        let result = ack
            .to_json()
            .map_err(SessionError::from)
            .and_then(|payload| self.send_request(&payload, cancel));
        if let Err(e) = result {
            warn!(delivered_id, error = %e, "发送确认失败");
        }
    }

    /// 发送一条请求并等待最终响应。
    ///
    /// 进度消息与最终响应都会依次交给 `on_response`。
    ///
    /// 异常处理：
    /// - 写入失败、取消、超时均返回错误
    /// - 最终响应不是合法信封时返回 [`SessionError::InvalidResponse`]
    pub fn run_request(
        &self,
        request: &RequestEnvelope,
        timeout: Duration,
        cancel: &CancellationToken,
        mut on_response: impl FnMut(&ResponseMessage),
    ) -> Result<ResponseEnvelope, SessionError> {
        let payload = request.to_json()?;
        let counter = self.send_request(&payload, cancel)?;
        let communication_id = self.channel.codec().communication_id(counter);
        info!(
            communication_id = %communication_id,
            request_type = request.body.type_name(),
            "请求已发送"
        );

        let deadline = Deadline::after(timeout);
        loop {
            let Some(remaining) = deadline.remaining() else {
                return Err(SessionError::TimedOut { communication_id });
            };
            let responses =
                self.wait_for_responses(counter, Some(&request.request_id), remaining, true, cancel);
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            for response in &responses {
                on_response(response);
                if response.communication_id == communication_id {
                    return ResponseEnvelope::from_json(&response.response_data).map_err(|e| {
                        SessionError::InvalidResponse {
                            communication_id: communication_id.clone(),
                            message: e.to_string(),
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageCodec;
    use crate::message::ResponseBody;
    use crate::store::{KvpStore, MemoryKvpStore};
    use std::sync::Arc;
    use std::time::Instant;

    struct Fixture {
        to_guest: MemoryKvpStore,
        from_guest: MemoryKvpStore,
        session: GuestSession,
    }

    fn fixture() -> Fixture {
        let to_guest = MemoryKvpStore::new();
        let from_guest = MemoryKvpStore::new();
        let channel = HostChannel::new(
            Arc::new(to_guest.clone()),
            Arc::new(from_guest.clone()),
            MessageCodec::default(),
        );
        let session = GuestSession::new(channel).with_poll_interval(Duration::from_millis(10));
        Fixture {
            to_guest,
            from_guest,
            session,
        }
    }

    fn guest_writes(store: &MemoryKvpStore, id: &str, data: &str) {
        for (name, value) in MessageCodec::default().encode(id, data) {
            store.write(&name, &value).unwrap();
        }
    }

    fn response_json(request_id: &str, message: &str) -> String {
        ResponseEnvelope::new(
            request_id,
            ResponseBody::Progress {
                message: message.to_string(),
            },
        )
        .to_json()
        .unwrap()
    }

    fn ack_targets(store: &MemoryKvpStore) -> Vec<String> {
        let codec = MessageCodec::default();
        let mut targets: Vec<String> = codec
            .merge(&store.snapshot())
            .into_values()
            .filter_map(|raw| match RequestEnvelope::from_json(&raw).ok()?.body {
                RequestBody::Ack { ack_communication_id } => Some(ack_communication_id),
                _ => None,
            })
            .collect();
        targets.sort();
        targets
    }

    #[test]
    fn counter_only_moves_forward() {
        let f = fixture();
        let cancel = CancellationToken::new();
        assert_eq!(f.session.send_request("a", &cancel).unwrap(), 1);
        f.session.set_next_communication_id_counter(10);
        f.session.set_next_communication_id_counter(5);
        assert_eq!(f.session.send_request("b", &cancel).unwrap(), 10);
        assert_eq!(f.session.next_communication_id_counter(), 11);
        assert!(f.to_guest.contains("DevSetup{10}~1~1"));
    }

    #[test]
    fn cancelled_send_writes_nothing() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(f.session.send_request("a", &cancel), Err(SessionError::Cancelled)));
        assert!(f.to_guest.is_empty());
    }

    #[test]
    fn progress_is_ordered_and_final_comes_last() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let counter = f.session.send_request("req", &cancel).unwrap();
        for n in [3, 1, 2] {
            guest_writes(
                &f.from_guest,
                &format!("DevSetup{{{counter}}}_Progress_{n}"),
                &response_json("r", &n.to_string()),
            );
        }
        guest_writes(&f.from_guest, &format!("DevSetup{{{counter}}}"), &response_json("r", "final"));

        let got = f
            .session
            .wait_for_responses(counter, Some("r"), Duration::from_secs(1), true, &cancel);
        let ids: Vec<&str> = got.iter().map(|m| m.communication_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "DevSetup{1}_Progress_1",
                "DevSetup{1}_Progress_2",
                "DevSetup{1}_Progress_3",
                "DevSetup{1}",
            ]
        );
        // 请求分片已清理，只剩下四个确认请求
        assert!(!f.to_guest.contains("DevSetup{1}~1~1"));
        assert_eq!(ack_targets(&f.to_guest).len(), 4);
    }

    #[test]
    fn delivered_messages_are_not_repeated_while_still_present() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let counter = f.session.send_request("req", &cancel).unwrap();
        guest_writes(&f.from_guest, "DevSetup{1}_Progress_1", &response_json("r", "p1"));

        let first = f
            .session
            .wait_for_responses(counter, Some("r"), Duration::from_secs(1), true, &cancel);
        assert_eq!(first.len(), 1);
        let again = f
            .session
            .wait_for_responses(counter, Some("r"), Duration::from_millis(50), true, &cancel);
        assert!(again.is_empty());

        guest_writes(&f.from_guest, "DevSetup{1}", &response_json("r", "done"));
        let last = f
            .session
            .wait_for_responses(counter, Some("r"), Duration::from_secs(1), true, &cancel);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].communication_id, "DevSetup{1}");
        assert_eq!(ack_targets(&f.to_guest), vec!["DevSetup{1}", "DevSetup{1}_Progress_1"]);
    }

    #[test]
    fn responses_for_other_request_ids_are_ignored() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let counter = f.session.send_request("req", &cancel).unwrap();
        guest_writes(&f.from_guest, "DevSetup{1}", &response_json("older-run", "x"));
        let got = f
            .session
            .wait_for_responses(counter, Some("current"), Duration::from_millis(50), true, &cancel);
        assert!(got.is_empty());
        let any = f
            .session
            .wait_for_responses(counter, None, Duration::from_millis(50), false, &cancel);
        assert_eq!(any.len(), 1);
    }

    #[test]
    fn progress_is_skipped_when_not_expected() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let counter = f.session.send_request("req", &cancel).unwrap();
        guest_writes(&f.from_guest, "DevSetup{1}_Progress_1", &response_json("r", "p"));
        let got = f
            .session
            .wait_for_responses(counter, None, Duration::from_millis(50), false, &cancel);
        assert!(got.is_empty());
    }

    #[test]
    fn timeout_and_cancellation_return_empty() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let started = Instant::now();
        assert!(f
            .session
            .wait_for_responses(7, None, Duration::from_millis(60), true, &cancel)
            .is_empty());
        assert!(started.elapsed() >= Duration::from_millis(60));

        cancel.cancel();
        let started = Instant::now();
        assert!(f
            .session
            .wait_for_responses(7, None, Duration::from_secs(30), true, &cancel)
            .is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn run_request_times_out_without_guest() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let request = RequestEnvelope::new(RequestBody::GetVersion);
        let err = f
            .session
            .run_request(&request, Duration::from_millis(50), &cancel, |_| {})
            .unwrap_err();
        assert!(matches!(err, SessionError::TimedOut { .. }));
    }

    #[test]
    fn unbounded_run_request_ends_on_cancel() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let remote = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let request = RequestEnvelope::new(RequestBody::GetVersion);
        let err = f
            .session
            .run_request(&request, Duration::MAX, &cancel, |_| {})
            .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        handle.join().unwrap();
    }

    #[test]
    fn unbounded_wait_returns_available_responses() {
        let f = fixture();
        let cancel = CancellationToken::new();
        guest_writes(&f.from_guest, "DevSetup{3}", &response_json("r", "done"));
        let got = f.session.wait_for_responses(3, None, Duration::MAX, true, &cancel);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].communication_id, "DevSetup{3}");
    }
}
