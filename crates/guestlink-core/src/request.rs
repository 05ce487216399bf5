//! 来宾侧请求管理：状态查询直接执行，其余请求进入有界队列由单个工作线程顺序执行。
//!
//! 规则：
//! - 状态请求（`is_status_request`）在调用线程上立即执行，不受队列影响
//! - 非状态请求入队；队列已满时回复 `TooManyRequests`，请求被丢弃
//! - 任意时刻至多一个工作线程；执行期间不持有队列锁
//! - 执行失败或 panic 只记录日志并回复错误响应，工作线程继续处理下一条
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cancel::{CancellationToken, Deadline};
use crate::codec::PROGRESS_MARKER;
use crate::guest::GuestChannel;
use crate::message::{AgentState, RequestMessage, ResponseEnvelope, ResponseMessage, STATUS_FAILED};
use crate::notifier::ChangeNotifier;
use crate::store::StoreError;

/// 默认队列容量。
pub const DEFAULT_QUEUE_CAPACITY: usize = 3;

/// 请求执行结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResponse {
    /// 响应内容（通常是序列化后的响应信封）。
    pub data: String,
    /// 为 `false` 时不回写响应（例如确认请求）。
    pub send_response: bool,
}

impl HostResponse {
    pub fn reply(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            send_response: true,
        }
    }

    pub fn silent() -> Self {
        Self {
            data: String::new(),
            send_response: false,
        }
    }
}

/// 来宾向主机回写响应的出口。
pub trait ResponseSink: Send + Sync {
    fn send_response(&self, response: &ResponseMessage) -> Result<(), StoreError>;

    /// 删除已被主机确认的响应。
    fn delete_response(&self, communication_id: &str);
}

impl<N: ChangeNotifier> ResponseSink for GuestChannel<N> {
    fn send_response(&self, response: &ResponseMessage) -> Result<(), StoreError> {
        GuestChannel::send_response(self, response)
    }

    fn delete_response(&self, communication_id: &str) {
        GuestChannel::delete_response(self, communication_id)
    }
}

/// 一条待执行的主机请求。
pub trait HostRequest: Send {
    /// 信封中的 `RequestId`，用于响应关联。
    fn request_id(&self) -> &str;

    /// 请求所在的通信 ID，响应写回同一 ID。
    fn communication_id(&self) -> &str;

    fn request_type(&self) -> &str;

    /// 状态请求不进入队列。
    fn is_status_request(&self) -> bool;

    fn execute(
        &mut self,
        progress: &ProgressHandler,
        cancel: &CancellationToken,
    ) -> anyhow::Result<HostResponse>;
}

/// 创建请求时可用的上下文。
#[derive(Clone)]
pub struct RequestContext {
    pub message: RequestMessage,
    /// 创建时刻的执行中/排队中请求快照。
    pub state: AgentState,
    pub sink: Arc<dyn ResponseSink>,
}

/// 将原始请求消息转换为可执行请求。
///
/// 无法解析的消息也应返回一个请求（通常是回复错误的状态请求）。
pub trait RequestFactory: Send + Sync {
    fn create(&self, context: RequestContext) -> Box<dyn HostRequest>;
}

/// 进度上报：以 `<通信ID>_Progress_<n>` 写出，`n` 从 1 开始递增。
pub struct ProgressHandler {
    sink: Arc<dyn ResponseSink>,
    communication_id: String,
    sequence: AtomicU32,
}

impl ProgressHandler {
    pub fn new(sink: Arc<dyn ResponseSink>, communication_id: impl Into<String>) -> Self {
        Self {
            sink,
            communication_id: communication_id.into(),
            sequence: AtomicU32::new(0),
        }
    }

    pub fn communication_id(&self) -> &str {
        &self.communication_id
    }

    /// 写出一条进度消息，返回其序号。
    pub fn report(&self, data: impl Into<String>) -> Result<u32, StoreError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let response = ResponseMessage {
            communication_id: format!("{}{PROGRESS_MARKER}{sequence}", self.communication_id),
            response_data: data.into(),
        };
        self.sink.send_response(&response)?;
        Ok(sequence)
    }

    /// 已写出的进度条数。
    pub fn reported(&self) -> u32 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Box<dyn HostRequest>>,
    running: bool,
    current: Option<String>,
}

impl QueueState {
    fn snapshot(&self) -> AgentState {
        AgentState {
            running: self.current.clone(),
            queued: self.pending.iter().map(|r| describe(r.as_ref())).collect(),
        }
    }
}

fn describe(request: &dyn HostRequest) -> String {
    format!("{}({})", request.request_type(), request.communication_id())
}

struct Shared {
    sink: Arc<dyn ResponseSink>,
    factory: Arc<dyn RequestFactory>,
    capacity: usize,
    queue: Mutex<QueueState>,
    idle: Condvar,
    cancel: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 请求管理器。
#[derive(Clone)]
pub struct RequestManager {
    shared: Arc<Shared>,
}

impl RequestManager {
    pub fn new(
        sink: Arc<dyn ResponseSink>,
        factory: Arc<dyn RequestFactory>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                factory,
                capacity: capacity.max(1),
                queue: Mutex::new(QueueState::default()),
                idle: Condvar::new(),
                cancel,
            }),
        }
    }

    /// 当前执行中/排队中的请求快照。
    pub fn state(&self) -> AgentState {
        self.shared.lock().snapshot()
    }

    pub fn queued_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// 处理一条收到的请求。
    pub fn handle(&self, message: RequestMessage) {
        let context = RequestContext {
            message,
            state: self.state(),
            sink: Arc::clone(&self.shared.sink),
        };
        let request = self.shared.factory.create(context);

        if request.is_status_request() {
            debug!(request = %describe(request.as_ref()), "执行状态请求");
            execute_and_respond(&self.shared, request);
            return;
        }

        let mut queue = self.shared.lock();
        if queue.pending.len() >= self.shared.capacity {
            drop(queue);
            warn!(request = %describe(request.as_ref()), "请求队列已满，拒绝请求");
            let response = ResponseEnvelope::too_many_requests(request.request_id());
            send_envelope(&self.shared, request.communication_id(), &response);
            return;
        }
        info!(request = %describe(request.as_ref()), queued = queue.pending.len() + 1, "请求入队");
        queue.pending.push_back(request);
        if queue.running {
            return;
        }

        queue.running = true;
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("guestlink-request-worker".to_string())
            .spawn(move || worker_loop(&shared));
        if let Err(e) = spawned {
            queue.running = false;
            let orphan = queue.pending.pop_back();
            drop(queue);
            error!(error = %e, "创建请求工作线程失败");
            if let Some(request) = orphan {
                let response = ResponseEnvelope::error(
                    request.request_id(),
                    STATUS_FAILED,
                    format!("无法启动请求执行线程: {e}"),
                );
                send_envelope(&self.shared, request.communication_id(), &response);
            }
        }
    }

    /// 等待队列清空且工作线程退出。
    ///
    /// 返回值：
    /// - `true`：已空闲
    /// - `false`：超时
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Deadline::after(timeout);
        let mut queue = self.shared.lock();
        while queue.running || !queue.pending.is_empty() {
            let Some(remaining) = deadline.remaining() else {
                return false;
            };
            let (guard, _) = self
                .shared
                .idle
                .wait_timeout(queue, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
        true
    }

    /// 循环读取来宾通道并分发请求，直到取消。
    pub fn serve<N: ChangeNotifier>(&self, channel: &GuestChannel<N>, poll: Duration) {
        info!("开始处理主机请求");
        while !self.shared.cancel.is_cancelled() {
            if let Some(message) = channel.wait_for_message(&self.shared.cancel, poll) {
                self.handle(message);
            }
        }
        info!("停止处理主机请求");
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let request = {
            let mut queue = shared.lock();
            let next = if shared.cancel.is_cancelled() {
                None
            } else {
                queue.pending.pop_front()
            };
            match next {
                Some(request) => {
                    queue.current = Some(describe(request.as_ref()));
                    request
                }
                None => {
                    if shared.cancel.is_cancelled() && !queue.pending.is_empty() {
                        warn!(dropped = queue.pending.len(), "已取消，丢弃排队中的请求");
                        queue.pending.clear();
                    }
                    queue.running = false;
                    queue.current = None;
                    shared.idle.notify_all();
                    return;
                }
            }
        };
        execute_and_respond(shared, request);
        shared.lock().current = None;
    }
}

fn execute_and_respond(shared: &Shared, mut request: Box<dyn HostRequest>) {
    let communication_id = request.communication_id().to_string();
    let progress = ProgressHandler::new(Arc::clone(&shared.sink), communication_id.clone());
    let outcome = catch_unwind(AssertUnwindSafe(|| request.execute(&progress, &shared.cancel)));
    match outcome {
        Ok(Ok(response)) => {
            if response.send_response {
                let message = ResponseMessage {
                    communication_id: communication_id.clone(),
                    response_data: response.data,
                };
                if let Err(e) = shared.sink.send_response(&message) {
                    error!(communication_id = %communication_id, error = %e, "写出响应失败");
                }
            }
            debug!(request = %describe(request.as_ref()), "请求执行完成");
        }
        Ok(Err(e)) => {
            error!(request = %describe(request.as_ref()), error = %format!("{e:#}"), "请求执行失败");
            let response = ResponseEnvelope::error(request.request_id(), STATUS_FAILED, format!("{e:#}"));
            send_envelope(shared, &communication_id, &response);
        }
        Err(_) => {
            error!(request = %describe(request.as_ref()), "请求执行发生 panic");
            let response = ResponseEnvelope::error(request.request_id(), STATUS_FAILED, "请求执行异常终止");
            send_envelope(shared, &communication_id, &response);
        }
    }
}

fn send_envelope(shared: &Shared, communication_id: &str, response: &ResponseEnvelope) {
    let data = match response.to_json() {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "序列化响应失败");
            return;
        }
    };
    let message = ResponseMessage {
        communication_id: communication_id.to_string(),
        response_data: data,
    };
    if let Err(e) = shared.sink.send_response(&message) {
        error!(communication_id, error = %e, "写出响应失败");
    }
}
