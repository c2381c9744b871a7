use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::FlareError;

type Callback<T> = Box<dyn FnOnce(&Result<T, FlareError>) + Send + 'static>;

/// 异步操作的完成令牌。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 写入、连接、TLS 握手都在反应器线程上完成，应用线程需要一个可查询、可等待、可取消的句柄；
/// - 同一个令牌既能被阻塞等待（测试与简单客户端），也能作为 `Future` 交给异步运行时。
///
/// ## 逻辑（How）
/// - 共享状态由 `parking_lot::Mutex` 保护，`Condvar` 唤醒阻塞等待者，`Waker` 列表唤醒异步等待者；
/// - 第一次 `complete` 生效，之后的完成尝试返回 `false` 并被忽略。
///
/// ## 契约（What）
/// - 克隆得到的句柄共享同一结果；
/// - `on_complete` 注册的回调在完成它的线程上同步执行，若已完成则在注册线程上立即执行，
///   回调内应只做轻量工作；
/// - `cancel` 以 [`FlareError::Cancelled`] 完成令牌，关心取消的一方通过 `on_complete` 观察。
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

struct State<T> {
    result: Option<Result<T, FlareError>>,
    wakers: Vec<Waker>,
    callbacks: Vec<Callback<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    /// 创建未完成的令牌。
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    result: None,
                    wakers: Vec::new(),
                    callbacks: Vec::new(),
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// 创建已成功完成的令牌。
    pub fn succeeded(value: T) -> Self {
        let completion = Self::new();
        completion.complete(Ok(value));
        completion
    }

    /// 创建已失败的令牌。
    pub fn failed(error: FlareError) -> Self {
        let completion = Self::new();
        completion.complete(Err(error));
        completion
    }

    /// 以给定结果完成令牌；已完成时返回 `false`。
    pub fn complete(&self, result: Result<T, FlareError>) -> bool {
        let (wakers, callbacks) = {
            let mut state = self.shared.state.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result.clone());
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.callbacks),
            )
        };
        self.shared.ready.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(&result);
        }
        true
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, error: FlareError) -> bool {
        self.complete(Err(error))
    }

    /// 取消尚未完成的操作。
    pub fn cancel(&self) -> bool {
        self.fail(FlareError::Cancelled { op: "operation" })
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().result.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.shared.state.lock().result,
            Some(Err(FlareError::Cancelled { .. }))
        )
    }

    /// 读取结果但不等待。
    pub fn peek(&self) -> Option<Result<T, FlareError>> {
        self.shared.state.lock().result.clone()
    }

    /// 阻塞直至完成。
    pub fn wait(&self) -> Result<T, FlareError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = state.result.as_ref() {
                return result.clone();
            }
            self.shared.ready.wait(&mut state);
        }
    }

    /// 最多阻塞 `timeout`；超时返回 `None`。
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, FlareError>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = state.result.as_ref() {
                return Some(result.clone());
            }
            if self
                .shared
                .ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.result.clone();
            }
        }
    }

    /// 注册完成回调。
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T, FlareError>) + Send + 'static,
    {
        let result = {
            let mut state = self.shared.state.lock();
            match state.result.clone() {
                Some(result) => result,
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&result);
    }
}

impl<T: Clone + Send + 'static> Future for Completion<T> {
    type Output = Result<T, FlareError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if let Some(result) = state.result.as_ref() {
            return Poll::Ready(result.clone());
        }
        if !state.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = self.shared.state.lock().result.is_some();
        f.debug_struct("Completion").field("done", &done).finish()
    }
}
