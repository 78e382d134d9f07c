//! 纤程 (Fiber) 结构
//!
//! 纤程是绑定在一段独立栈上的可挂起执行单元，只能在创建它的线程上运行。
//! 状态迁移由 [`Machine`](super::machine::Machine) 完成，这里只保存状态和句柄。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::thread::{self, ThreadId};

use dashmap::DashMap;

use super::context::Context;
use super::machine::Machine;
use super::scheduler;
use super::stack::Stack;
use super::value::Value;
use crate::error::{FiberError, Misuse, Result};

/// 纤程 ID 计数器（0 保留）
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// 纤程 ID 到所属线程的映射，用于识别跨线程调用
static OWNERS: LazyLock<DashMap<FiberId, ThreadId>> = LazyLock::new(DashMap::new);

/// 纤程入口闭包
pub type Entry = dyn FnOnce(Value) -> Result<Value> + 'static;

/// 纤程 ID，进程内唯一，可以在线程间传递
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 获取数值形式
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 纤程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// 已创建，尚未开始执行
    Created,
    /// 正在运行（每个线程同一时刻只有一个）
    Running,
    /// 已挂起，等待恢复
    Suspended,
    /// 已终止，不能再次运行
    Terminated,
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberState::Created => "created",
            FiberState::Running => "running",
            FiberState::Suspended => "suspended",
            FiberState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// 纤程内部状态
pub(crate) struct FiberInner {
    /// 纤程唯一 ID
    pub id: FiberId,
    /// 可选名称（用于调试）
    pub name: Option<String>,
    /// 是否为线程的根纤程
    pub is_root: bool,
    /// 阻塞型纤程不会被调度器拦截
    pub blocking: Cell<bool>,
    /// 当前状态
    state: Cell<FiberState>,
    /// 执行上下文
    pub context: Context,
    /// 独占的栈，终止时归还
    pub stack: RefCell<Option<Stack>>,
    /// 入口闭包，只调用一次
    body: RefCell<Option<Box<Entry>>>,
    /// 通过 resume 进入本纤程的纤程
    resumer: RefCell<Option<Weak<FiberInner>>>,
    /// 本纤程正在 resume 的纤程
    resuming: RefCell<Option<Weak<FiberInner>>>,
    /// 最近一次通过 transfer 进入本纤程的纤程
    transferer: RefCell<Option<Weak<FiberInner>>>,
    /// 是否挂起在 yield 中
    yielding: Cell<bool>,
}

impl FiberInner {
    /// 创建线程的根纤程
    pub fn root() -> Self {
        Self::new(None, true, true, None, None, FiberState::Running)
    }

    /// 创建普通纤程
    pub fn spawn(name: Option<String>, blocking: bool, stack: Stack, body: Box<Entry>) -> Self {
        Self::new(
            name,
            false,
            blocking,
            Some(stack),
            Some(body),
            FiberState::Created,
        )
    }

    fn new(
        name: Option<String>,
        is_root: bool,
        blocking: bool,
        stack: Option<Stack>,
        body: Option<Box<Entry>>,
        state: FiberState,
    ) -> Self {
        let id = FiberId::next();
        OWNERS.insert(id, thread::current().id());
        Self {
            id,
            name,
            is_root,
            blocking: Cell::new(blocking),
            state: Cell::new(state),
            context: Context::new(),
            stack: RefCell::new(stack),
            body: RefCell::new(body),
            resumer: RefCell::new(None),
            resuming: RefCell::new(None),
            transferer: RefCell::new(None),
            yielding: Cell::new(false),
        }
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    #[inline]
    pub fn set_state(&self, state: FiberState) {
        self.state.set(state);
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.state() == FiberState::Terminated
    }

    #[inline]
    pub fn is_yielding(&self) -> bool {
        self.yielding.get()
    }

    #[inline]
    pub fn set_yielding(&self, yielding: bool) {
        self.yielding.set(yielding);
    }

    pub fn take_body(&self) -> Option<Box<Entry>> {
        self.body.borrow_mut().take()
    }

    pub fn take_stack(&self) -> Option<Stack> {
        self.stack.borrow_mut().take()
    }

    pub fn resumer(&self) -> Option<Rc<FiberInner>> {
        live(&self.resumer)
    }

    pub fn set_resumer(&self, fiber: Option<&Rc<FiberInner>>) {
        *self.resumer.borrow_mut() = fiber.map(Rc::downgrade);
    }

    pub fn take_resumer(&self) -> Option<Rc<FiberInner>> {
        self.resumer.borrow_mut().take().and_then(|w| w.upgrade())
    }

    pub fn has_resumer(&self) -> bool {
        self.resumer().is_some()
    }

    pub fn resuming(&self) -> Option<Rc<FiberInner>> {
        live(&self.resuming)
    }

    pub fn set_resuming(&self, fiber: Option<&Rc<FiberInner>>) {
        *self.resuming.borrow_mut() = fiber.map(Rc::downgrade);
    }

    pub fn is_resuming(&self) -> bool {
        self.resuming().is_some()
    }

    pub fn set_transferer(&self, fiber: &Rc<FiberInner>) {
        *self.transferer.borrow_mut() = Some(Rc::downgrade(fiber));
    }

    pub fn take_transferer(&self) -> Option<Rc<FiberInner>> {
        self.transferer.borrow_mut().take().and_then(|w| w.upgrade())
    }
}

/// 读取弱引用，已释放或已终止的纤程视为不存在
fn live(slot: &RefCell<Option<Weak<FiberInner>>>) -> Option<Rc<FiberInner>> {
    slot.borrow()
        .as_ref()
        .and_then(Weak::upgrade)
        .filter(|f| !f.is_terminated())
}

impl Drop for FiberInner {
    fn drop(&mut self) {
        OWNERS.remove(&self.id);
    }
}

impl fmt::Debug for FiberInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("blocking", &self.blocking.get())
            .finish()
    }
}

/// 纤程句柄
///
/// 克隆句柄不会复制纤程；句柄只能在创建纤程的线程上使用
#[derive(Clone)]
pub struct Fiber {
    inner: Rc<FiberInner>,
}

impl Fiber {
    pub(crate) fn from_inner(inner: Rc<FiberInner>) -> Self {
        Self { inner }
    }

    /// 用默认配置创建非阻塞纤程，不会立即执行
    pub fn new<F>(body: F) -> Result<Fiber>
    where
        F: FnOnce(Value) -> Result<Value> + 'static,
    {
        Builder::new().spawn(body)
    }

    /// 创建纤程构建器
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// 当前线程正在运行的纤程
    pub fn current() -> Fiber {
        Fiber::from_inner(Machine::local().current())
    }

    /// 当前线程的根纤程
    pub fn root() -> Fiber {
        Fiber::from_inner(Machine::local().root())
    }

    /// 按 ID 查找本线程的纤程
    ///
    /// 属于其他线程的 ID 返回 [`Misuse::CrossThread`]，找不到则视为已终止
    pub fn from_id(id: FiberId) -> Result<Fiber> {
        if let Some(inner) = Machine::local().lookup(id) {
            return Ok(Fiber::from_inner(inner));
        }
        match OWNERS.get(&id) {
            Some(owner) if *owner != thread::current().id() => Err(Misuse::CrossThread.into()),
            _ => Err(FiberError::Dead { fiber: id }),
        }
    }

    /// 恢复纤程，当前纤程挂起直到目标 yield 或终止
    pub fn resume(&self, value: Value) -> Result<Value> {
        Machine::local().resume(&self.inner, value)
    }

    /// 对称地把控制权交给纤程，不建立返回关系
    pub fn transfer(&self, value: Value) -> Result<Value> {
        Machine::local().transfer(&self.inner, value)
    }

    /// 挂起当前纤程，把值交还给恢复它的纤程
    pub fn yield_now(value: Value) -> Result<Value> {
        Machine::local().yield_now(value)
    }

    /// 在当前线程安装的调度器下运行 `body`
    pub fn schedule<F>(body: F) -> Result<Fiber>
    where
        F: FnOnce(Value) -> Result<Value> + 'static,
    {
        let scheduler = scheduler::current_scheduler().ok_or(FiberError::NoScheduler)?;
        tracing::debug!("scheduling fiber through installed scheduler");
        scheduler.fiber(Box::new(body))
    }

    /// 人为消耗当前纤程的栈空间，用于测试接近栈上限时的行为
    pub fn consume_stack(bytes: usize) -> Result<()> {
        Machine::local().consume_stack(bytes)
    }

    /// 纤程 ID
    #[inline]
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// 纤程名称
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// 纤程状态
    #[inline]
    pub fn state(&self) -> FiberState {
        self.inner.state()
    }

    /// 是否尚未终止
    #[inline]
    pub fn is_alive(&self) -> bool {
        !self.inner.is_terminated()
    }

    /// 是否为根纤程
    #[inline]
    pub fn is_root(&self) -> bool {
        self.inner.is_root
    }

    /// 是否为阻塞型纤程
    #[inline]
    pub fn is_blocking(&self) -> bool {
        self.inner.blocking.get()
    }

    /// 本纤程当前正在 resume 的纤程
    pub fn resuming_fiber(&self) -> Option<Fiber> {
        self.inner.resuming().map(Fiber::from_inner)
    }

    /// 通过 resume 进入本纤程、等待它返回的纤程
    pub fn resumer(&self) -> Option<Fiber> {
        self.inner.resumer().map(Fiber::from_inner)
    }

    /// 栈容量，根纤程和已终止纤程返回 None
    pub fn stack_capacity(&self) -> Option<usize> {
        self.inner.stack.borrow().as_ref().map(Stack::capacity)
    }

    /// 已人为消耗的栈字节数
    pub fn stack_consumed(&self) -> Option<usize> {
        self.inner.stack.borrow().as_ref().map(Stack::consumed)
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Fiber {}

impl std::hash::Hash for Fiber {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// 纤程构建器
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    blocking: bool,
}

impl Builder {
    /// 创建构建器（默认非阻塞、默认栈大小）
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置名称
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 设置栈大小
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// 设置是否为阻塞型纤程
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// 创建纤程
    pub fn spawn<F>(self, body: F) -> Result<Fiber>
    where
        F: FnOnce(Value) -> Result<Value> + 'static,
    {
        self.spawn_boxed(Box::new(body))
    }

    /// 用已装箱的入口创建纤程
    pub fn spawn_boxed(self, body: Box<Entry>) -> Result<Fiber> {
        let inner = Machine::local().spawn(self.name, self.stack_size, self.blocking, body)?;
        Ok(Fiber::from_inner(inner))
    }
}
