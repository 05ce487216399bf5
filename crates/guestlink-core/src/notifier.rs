//! 存储变化通知。
//!
//! 结构：
//! - [`ChangeSource`]：对操作系统阻塞原语的抽象（注册表变化通知、内存存储的条件变量）
//! - [`ChangeWatcher`]：后台线程循环等待变化源，每次变化调用一次回调
//! - [`ChangeEvent`]：自动复位事件，等待成功后立即清除
//! - [`EventNotifier`]：监视器 + 事件，实现 [`ChangeNotifier`] 供来宾通道使用
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::cancel::{CancellationToken, Deadline};
use crate::store::StoreError;

/// 事件等待的轮询粒度：取消之后最迟在一个粒度内返回。
pub const WAIT_QUANTUM: Duration = Duration::from_millis(50);

/// 变化源出错后的重试间隔，避免出错时空转。
const SOURCE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// 等待结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Changed,
    Cancelled,
    TimedOut,
}

/// 可阻塞等待“存储发生变化”的底层原语。
pub trait ChangeSource: Send + Sync + 'static {
    /// 阻塞直到存储发生变化或 [`ChangeSource::release`] 被调用。
    ///
    /// `release` 若发生在本次调用之前，也必须让本次调用立即返回。
    fn wait_for_change(&self) -> Result<(), StoreError>;

    /// 唤醒阻塞在 `wait_for_change` 中的线程。
    fn release(&self);
}

impl<S: ChangeSource> ChangeSource for Arc<S> {
    fn wait_for_change(&self) -> Result<(), StoreError> {
        (**self).wait_for_change()
    }

    fn release(&self) {
        (**self).release()
    }
}

/// 自动复位事件。
#[derive(Debug, Default)]
pub struct ChangeEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl ChangeEvent {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.signalled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self) {
        *self.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.lock() = false;
    }

    /// 等待事件被置位，成功时自动复位。
    ///
    /// 参数：
    /// - cancel：取消令牌，按 [`WAIT_QUANTUM`] 粒度检查
    /// - max_wait：最长等待时间
    pub fn wait(&self, cancel: &CancellationToken, max_wait: Duration) -> WaitOutcome {
        let deadline = Deadline::after(max_wait);
        let mut signalled = self.lock();
        loop {
            if *signalled {
                *signalled = false;
                return WaitOutcome::Changed;
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            let Some(remaining) = deadline.remaining() else {
                return WaitOutcome::TimedOut;
            };
            let slice = WAIT_QUANTUM.min(remaining);
            let (guard, _) = self
                .cond
                .wait_timeout(signalled, slice)
                .unwrap_or_else(PoisonError::into_inner);
            signalled = guard;
        }
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct WatcherState {
    running: bool,
    generation: u64,
}

/// 变化监视器：后台线程等待变化源，每次变化调用回调。
///
/// 状态：Stopped ⇄ Started。
/// - `start` 幂等，已启动时直接返回
/// - `stop` 通过 [`ChangeSource::release`] 唤醒阻塞中的线程并等待其退出
/// - 回调 panic 与变化源错误只记录日志
pub struct ChangeWatcher<S: ChangeSource> {
    source: Arc<S>,
    callback: Callback,
    state: Arc<Mutex<WatcherState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: ChangeSource> ChangeWatcher<S> {
    pub fn new(source: S, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            source: Arc::new(source),
            callback: Arc::new(callback),
            state: Arc::new(Mutex::new(WatcherState::default())),
            worker: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).running
    }

    /// 启动监视线程。
    ///
    /// 返回值：
    /// - `Ok(true)`：本次调用启动了线程
    /// - `Ok(false)`：已在运行
    ///
    /// 异常处理：
    /// - 线程创建失败返回 [`StoreError::Notify`]，状态回到 Stopped
    pub fn start(&self) -> Result<bool, StoreError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.running {
                return Ok(false);
            }
            state.running = true;
            state.generation += 1;
            state.generation
        };

        // 上一轮的线程已在 stop 中被唤醒，这里确保它真正退出
        if let Some(previous) = worker.take() {
            join_quietly(previous);
        }

        let source = Arc::clone(&self.source);
        let callback = Arc::clone(&self.callback);
        let state = Arc::clone(&self.state);
        let spawned = std::thread::Builder::new()
            .name("guestlink-watcher".to_string())
            .spawn(move || watch_loop(&*source, &*callback, &state, generation));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                debug!(generation, "变化监视已启动");
                Ok(true)
            }
            Err(e) => {
                self.state.lock().unwrap_or_else(PoisonError::into_inner).running = false;
                Err(StoreError::Notify(format!("创建监视线程失败: {e}")))
            }
        }
    }

    /// 停止监视线程；未启动时无操作。
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.source.release();

        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            // 回调内部调用 stop 时不能 join 自己
            if handle.thread().id() != std::thread::current().id() {
                join_quietly(handle);
            }
        }
        debug!("变化监视已停止");
    }
}

impl<S: ChangeSource> Drop for ChangeWatcher<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_quietly(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("监视线程异常退出");
    }
}

fn is_current(state: &Mutex<WatcherState>, generation: u64) -> bool {
    let state = state.lock().unwrap_or_else(PoisonError::into_inner);
    state.running && state.generation == generation
}

fn watch_loop<S: ChangeSource + ?Sized>(
    source: &S,
    callback: &(dyn Fn() + Send + Sync),
    state: &Mutex<WatcherState>,
    generation: u64,
) {
    while is_current(state, generation) {
        match source.wait_for_change() {
            Ok(()) => {
                if !is_current(state, generation) {
                    break;
                }
                if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                    error!("变化回调发生 panic，已忽略");
                }
            }
            Err(e) => {
                warn!(error = %e, "等待存储变化失败，稍后重试");
                std::thread::sleep(SOURCE_RETRY_DELAY);
            }
        }
    }
}

/// 来宾通道依赖的通知能力。
pub trait ChangeNotifier: Send + Sync {
    fn start(&self) -> Result<(), StoreError>;

    fn stop(&self);

    /// 等待下一次变化、取消或超时。
    fn wait(&self, cancel: &CancellationToken, max_wait: Duration) -> WaitOutcome;
}

/// 基于 [`ChangeWatcher`] + [`ChangeEvent`] 的通知器。
pub struct EventNotifier<S: ChangeSource> {
    watcher: ChangeWatcher<S>,
    event: Arc<ChangeEvent>,
}

impl<S: ChangeSource> EventNotifier<S> {
    pub fn new(source: S) -> Self {
        let event = Arc::new(ChangeEvent::new());
        let signal = Arc::clone(&event);
        Self {
            watcher: ChangeWatcher::new(source, move || signal.set()),
            event,
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_running()
    }
}

impl<S: ChangeSource> ChangeNotifier for EventNotifier<S> {
    fn start(&self) -> Result<(), StoreError> {
        self.watcher.start().map(|_| ())
    }

    fn stop(&self) {
        self.watcher.stop();
    }

    fn wait(&self, cancel: &CancellationToken, max_wait: Duration) -> WaitOutcome {
        self.event.wait(cancel, max_wait)
    }
}

impl<N: ChangeNotifier + ?Sized> ChangeNotifier for Arc<N> {
    fn start(&self) -> Result<(), StoreError> {
        (**self).start()
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn wait(&self, cancel: &CancellationToken, max_wait: Duration) -> WaitOutcome {
        (**self).wait(cancel, max_wait)
    }
}
