//! 协作式取消令牌。
//!
//! 说明：
//! - 所有阻塞等待（来宾侧等待消息、主机侧轮询、请求执行）都接受同一种令牌
//! - 令牌可克隆，克隆体共享同一取消状态；`cancel` 之后不可恢复
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// 等待截止时间；超时过大无法表示时视为没有截止。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// 剩余时间；已到期返回 `None`，没有截止时返回 `Duration::MAX`。
    pub fn remaining(&self) -> Option<Duration> {
        match self.0 {
            None => Some(Duration::MAX),
            Some(at) => {
                let now = Instant::now();
                (now < at).then(|| at - now)
            }
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.0.is_none()
    }
}

/// 取消令牌。
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发出取消信号，并唤醒所有正在 [`CancellationToken::wait_timeout`] 中休眠的线程。
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 休眠至多 `timeout`，期间若被取消则立即返回。
    ///
    /// 返回值：
    /// - `true`：令牌已取消
    /// - `false`：正常超时
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Deadline::after(timeout);
        let mut cancelled = self.inner.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            if deadline.is_unbounded() {
                cancelled = self.inner.cond.wait(cancelled).unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            let Some(remaining) = deadline.remaining() else {
                return false;
            };
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(cancelled, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            cancelled = guard;
        }
        true
    }
}
