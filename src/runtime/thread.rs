//! 可被调度器拦截的线程
//!
//! `spawn` 启动一个普通操作系统线程。在非阻塞纤程中 join 它时，
//! 等待交给当前线程的调度器，线程结束时通过唤醒句柄恢复等待者。

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self as std_thread, Thread};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::fiber::{Fiber, FiberId};
use super::scheduler::{self, Blocker, Unblocker};
use crate::error::{panic_message, FiberError, Misuse, Result};

/// 线程与 join 方共享的结果槽
struct Packet<T> {
    state: Mutex<PacketState<T>>,
    done: Condvar,
}

struct PacketState<T> {
    result: Option<Result<T>>,
    finished: bool,
    /// 阻塞在调度器里等待本线程的纤程
    waiters: Vec<(Unblocker, FiberId)>,
}

impl<T> Packet<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(PacketState {
                result: None,
                finished: false,
                waiters: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    fn publish(&self, result: Result<T>) {
        let waiters = {
            let mut state = self.state.lock();
            state.result = Some(result);
            state.finished = true;
            std::mem::take(&mut state.waiters)
        };
        self.done.notify_all();
        for (unblocker, fiber) in waiters {
            unblocker.unblock(fiber);
        }
    }

    fn remove_waiter(&self, fiber: FiberId) {
        self.state.lock().waiters.retain(|(_, id)| *id != fiber);
    }
}

/// 启动线程
///
/// 线程闭包返回后会关闭该线程自己安装的调度器，再公布结果
pub fn spawn<F, T>(f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let packet = Arc::new(Packet::new());
    let theirs = Arc::clone(&packet);

    let native = std_thread::Builder::new().spawn(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let value = f();
            scheduler::close_scheduler().map(|_| value)
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(&*payload);
                warn!(%message, "spawned thread panicked");
                Err(FiberError::ThreadPanicked(message))
            }
        };
        theirs.publish(result);
    })?;

    let thread = native.thread().clone();
    debug!(thread = ?thread.id(), "thread spawned");
    Ok(JoinHandle { thread, packet })
}

/// 线程句柄
pub struct JoinHandle<T> {
    thread: Thread,
    packet: Arc<Packet<T>>,
}

impl<T> JoinHandle<T> {
    /// 底层线程
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    /// 线程是否已经结束
    pub fn is_finished(&self) -> bool {
        self.packet.state.lock().finished
    }

    /// 等待线程结束并取得结果
    pub fn join(self) -> Result<T> {
        self.wait(None)?;
        self.take()
    }

    /// 最多等待 `timeout`；超时返回 None，句柄仍然可以再次 join
    pub fn join_timeout(&mut self, timeout: Duration) -> Result<Option<T>> {
        if !self.wait(Some(timeout))? {
            return Ok(None);
        }
        self.take().map(Some)
    }

    fn take(&self) -> Result<T> {
        self.packet
            .state
            .lock()
            .result
            .take()
            .ok_or(FiberError::Misuse(Misuse::AlreadyJoined))?
    }

    /// 等待结束，返回线程是否已结束
    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);

        let Some(scheduler) = scheduler::intercepting_scheduler() else {
            let mut state = self.packet.state.lock();
            while !state.finished {
                match deadline {
                    None => self.packet.done.wait(&mut state),
                    Some(deadline) => {
                        if self.packet.done.wait_until(&mut state, deadline).timed_out() {
                            return Ok(state.finished);
                        }
                    }
                }
            }
            return Ok(true);
        };

        let fiber = Fiber::current().id();
        let blocker = Blocker::ThreadJoin(self.thread.id());
        loop {
            {
                let mut state = self.packet.state.lock();
                if state.finished {
                    return Ok(true);
                }
                state.waiters.push((scheduler.unblocker(), fiber));
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                self.packet.remove_waiter(fiber);
                return Ok(self.is_finished());
            }

            debug!(fiber = %fiber, %blocker, "join handed to scheduler");
            let blocked = scheduler.block(&blocker, remaining);
            self.packet.remove_waiter(fiber);
            blocked?;
        }
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("thread", &self.thread.id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_returns_value() {
        let handle = spawn(|| 6 * 7).unwrap();
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn test_join_panicked_thread() {
        let handle = spawn(|| -> u32 { panic!("worker failed") }).unwrap();
        match handle.join().unwrap_err() {
            FiberError::ThreadPanicked(message) => assert_eq!(message, "worker failed"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_join_timeout() {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let mut handle = spawn(move || {
            rx.recv().ok();
            "done"
        })
        .unwrap();

        assert!(handle.join_timeout(Duration::from_millis(10)).unwrap().is_none());
        assert!(!handle.is_finished());

        tx.send(()).unwrap();
        assert_eq!(handle.join_timeout(Duration::from_secs(5)).unwrap(), Some("done"));

        let err = handle.join_timeout(Duration::from_millis(1)).unwrap_err();
        assert_eq!(err.misuse(), Some(Misuse::AlreadyJoined));
    }

    #[test]
    fn test_join_inside_plain_fiber() {
        // 没有调度器时 join 直接阻塞线程
        let fiber = Fiber::new(|_| {
            let handle = spawn(|| 5u8)?;
            Ok(crate::runtime::value::Value::new(handle.join()?))
        })
        .unwrap();
        let out = fiber.resume(crate::runtime::value::Value::nil()).unwrap();
        assert_eq!(out.downcast::<u8>().unwrap(), 5);
    }
}
