//! 调度器钩子
//!
//! 每个线程最多安装一个调度器。非阻塞纤程执行会阻塞线程的操作
//! （sleep、线程 join、I/O 等待）时，改为调用调度器对应的钩子挂起自己，
//! 由调度器在条件满足后再恢复。

use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use tracing::{debug, warn};

use super::fiber::{Builder, Entry, Fiber, FiberId};
use super::io::Interest;
use super::machine::Machine;
use super::value::Value;
use crate::error::Result;

/// 纤程阻塞的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    /// 等待线程结束
    ThreadJoin(ThreadId),
    /// 调用方自定义的等待
    Custom(String),
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::ThreadJoin(id) => write!(f, "join {id:?}"),
            Blocker::Custom(reason) => f.write_str(reason),
        }
    }
}

/// 唤醒句柄，可以在任意线程上唤醒阻塞在某个调度器里的纤程
#[derive(Clone)]
pub struct Unblocker {
    sink: Arc<dyn Fn(FiberId) + Send + Sync>,
}

impl Unblocker {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(FiberId) + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// 唤醒纤程；纤程已不在等待时忽略
    pub fn unblock(&self, fiber: FiberId) {
        (self.sink)(fiber);
    }
}

impl fmt::Debug for Unblocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unblocker")
    }
}

/// 调度器钩子
///
/// 阻塞类钩子在纤程内被调用，应当挂起调用者，并在条件满足后恢复它。
/// 钩子返回的错误原样交给发起阻塞调用的纤程。
pub trait Scheduler {
    /// 阻塞当前纤程直到被唤醒或超时；被唤醒返回 true，超时返回 false
    ///
    /// 允许虚假唤醒，调用方需要重新检查等待条件
    fn block(&self, blocker: &Blocker, timeout: Option<Duration>) -> Result<bool>;

    /// 获取唤醒句柄
    fn unblocker(&self) -> Unblocker;

    /// 睡眠；None 表示直到被唤醒
    fn kernel_sleep(&self, duration: Option<Duration>) -> Result<()>;

    /// 等待描述符就绪，超时返回 None
    fn io_wait(&self, fd: RawFd, interest: Interest, timeout: Option<Duration>)
        -> Result<Option<Interest>>;

    /// 在调度器下启动一个非阻塞纤程并立即运行到它第一次挂起
    fn fiber(&self, body: Box<Entry>) -> Result<Fiber> {
        let fiber = Builder::new().blocking(false).spawn_boxed(body)?;
        fiber.resume(Value::nil())?;
        Ok(fiber)
    }

    /// 运行事件循环，直到没有纤程在等待
    fn run(&self) -> Result<()>;

    /// 关闭调度器，默认先把剩余的纤程运行完
    fn close(&self) -> Result<()> {
        self.run()
    }
}

/// 安装或清除当前线程的调度器，返回之前安装的调度器
///
/// 旧调度器在仍处于安装状态时先被关闭，关闭失败时不做替换
pub fn set_scheduler(scheduler: Option<Rc<dyn Scheduler>>) -> Result<Option<Rc<dyn Scheduler>>> {
    let machine = Machine::local();
    if let Some(previous) = machine.scheduler() {
        debug!("closing previously installed scheduler");
        previous.close()?;
    }
    if scheduler.is_some() {
        // 在 Machine 之后注册，线程结束时先于 Machine 析构
        let _ = EXIT_GUARD.try_with(|_| ());
    }
    debug!(installed = scheduler.is_some(), "setting fiber scheduler");
    Ok(machine.replace_scheduler(scheduler))
}

/// 当前线程安装的调度器
pub fn current_scheduler() -> Option<Rc<dyn Scheduler>> {
    Machine::local().scheduler()
}

/// 当前纤程应当使用的调度器：只有非阻塞纤程会被拦截
pub fn intercepting_scheduler() -> Option<Rc<dyn Scheduler>> {
    let machine = Machine::local();
    if machine.current().blocking.get() {
        return None;
    }
    machine.scheduler()
}

/// 关闭并卸载当前线程的调度器，线程结束时调用
pub fn close_scheduler() -> Result<()> {
    set_scheduler(None).map(drop)
}

/// 线程结束时关闭仍然安装着的调度器，让已调度的纤程运行完
///
/// 主线程退出时不运行线程局部析构，需要显式调用 [`close_scheduler`]
struct ExitGuard;

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let installed = Machine::try_local().is_some_and(|m| m.scheduler().is_some());
        if !installed {
            return;
        }
        debug!("closing scheduler at thread exit");
        if let Err(err) = close_scheduler() {
            warn!(%err, "scheduler failed to close at thread exit");
        }
    }
}

thread_local! {
    static EXIT_GUARD: ExitGuard = const { ExitGuard };
}
