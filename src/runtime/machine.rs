//! 线程执行上下文 (Machine)
//!
//! 每个操作系统线程懒加载一个 Machine，记录根纤程、当前纤程、
//! 待释放的栈和调度器槽位，并实现 resume / transfer / yield 的控制转移。
//!
//! 纤程之间的值通过单个信箱传递：切换前写入，切换回来后由被恢复的一方取走。
//! 同一线程上任何时刻只有一次切换在进行，单槽位足够。

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use super::context::{self, Context};
use super::fiber::{Entry, FiberId, FiberInner, FiberState};
use super::scheduler::Scheduler;
use super::stack::StackPool;
use super::value::Value;
use crate::config::{self, RuntimeConfig};
use crate::error::{panic_message, FiberError, Misuse, Result};

thread_local! {
    static MACHINE: Rc<Machine> = Rc::new(Machine::new(config::current_config()));
}

/// 线程执行上下文
pub struct Machine {
    /// 创建时的配置快照
    config: RuntimeConfig,
    /// 根纤程（线程原本的栈）
    root: Rc<FiberInner>,
    /// 当前正在运行的纤程
    current: RefCell<Rc<FiberInner>>,
    /// 本线程创建的纤程
    fibers: RefCell<HashMap<FiberId, Weak<FiberInner>>>,
    /// 切换时传递的值或错误
    mailbox: RefCell<Option<Result<Value>>>,
    /// 终止纤程的栈，切换到别的栈之后再释放
    graveyard: RefCell<Vec<super::stack::Stack>>,
    /// 空闲栈缓存
    pool: RefCell<StackPool>,
    /// 终止纤程最后一次切出时写入的栈指针，不再使用
    scratch: Context,
    /// 当前线程安装的调度器
    scheduler: RefCell<Option<Rc<dyn Scheduler>>>,
    /// 完成的切换次数
    switches: Cell<u64>,
}

impl Machine {
    fn new(config: RuntimeConfig) -> Self {
        let root = Rc::new(FiberInner::root());
        debug!(root = %root.id, stack_size = config.stack_size, "initialising fiber machine for thread");
        Self {
            pool: RefCell::new(StackPool::new(config.stack_pool_capacity)),
            config,
            current: RefCell::new(Rc::clone(&root)),
            root,
            fibers: RefCell::new(HashMap::new()),
            mailbox: RefCell::new(None),
            graveyard: RefCell::new(Vec::new()),
            scratch: Context::new(),
            scheduler: RefCell::new(None),
            switches: Cell::new(0),
        }
    }

    /// 获取当前线程的 Machine，首次调用时创建
    pub fn local() -> Rc<Machine> {
        MACHINE.with(Rc::clone)
    }

    /// 获取当前线程的 Machine；线程正在销毁且 Machine 已释放时返回 None
    pub(crate) fn try_local() -> Option<Rc<Machine>> {
        MACHINE.try_with(Rc::clone).ok()
    }

    /// 配置快照
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 当前正在运行的纤程
    pub(crate) fn current(&self) -> Rc<FiberInner> {
        Rc::clone(&self.current.borrow())
    }

    /// 根纤程
    pub(crate) fn root(&self) -> Rc<FiberInner> {
        Rc::clone(&self.root)
    }

    /// 完成的切换次数
    #[inline]
    pub fn switch_count(&self) -> u64 {
        self.switches.get()
    }

    /// 按 ID 查找本线程仍然存活的纤程
    pub(crate) fn lookup(&self, id: FiberId) -> Option<Rc<FiberInner>> {
        if id == self.root.id {
            return Some(self.root());
        }
        let mut fibers = self.fibers.borrow_mut();
        match fibers.get(&id).and_then(Weak::upgrade) {
            Some(fiber) if !fiber.is_terminated() => Some(fiber),
            Some(_) => None,
            None => {
                fibers.remove(&id);
                None
            }
        }
    }

    /// 创建纤程：分配栈并布置初始帧，不开始执行
    pub(crate) fn spawn(
        &self,
        name: Option<String>,
        stack_size: Option<usize>,
        blocking: bool,
        body: Box<Entry>,
    ) -> Result<Rc<FiberInner>> {
        self.reap();

        let size = stack_size.unwrap_or(self.config.stack_size);
        let stack = self
            .pool
            .borrow_mut()
            .allocate(size, self.config.guard_page)?;
        let top = stack.top();

        let fiber = Rc::new(FiberInner::spawn(name, blocking, stack, body));
        let sp = unsafe {
            context::prepare(
                top,
                fiber_entry,
                Rc::as_ptr(&fiber).cast_mut().cast::<c_void>(),
            )
        };
        fiber.context.set_sp(sp);

        let mut fibers = self.fibers.borrow_mut();
        fibers.retain(|_, f| f.strong_count() > 0);
        fibers.insert(fiber.id, Rc::downgrade(&fiber));
        drop(fibers);

        debug!(fiber = %fiber.id, name = ?fiber.name, blocking, "fiber created");
        Ok(fiber)
    }

    /// 恢复 `target`，当前纤程成为它的恢复者
    pub(crate) fn resume(&self, target: &Rc<FiberInner>, value: Value) -> Result<Value> {
        let current = self.current();

        if target.is_terminated() {
            return Err(FiberError::Dead { fiber: target.id });
        }
        if Rc::ptr_eq(&current, target) {
            return Err(Misuse::ResumeCurrent.into());
        }
        if target.has_resumer() {
            return Err(Misuse::DoubleResume.into());
        }
        if target.is_resuming() {
            return Err(Misuse::ResumeResuming.into());
        }
        if target.state() != FiberState::Created && !target.is_yielding() {
            return Err(Misuse::ResumeTransferring.into());
        }

        current.set_resuming(Some(target));
        target.set_resumer(Some(&current));
        target.set_yielding(false);

        trace!(from = %current.id, to = %target.id, "resume");
        self.switch(&current, target, Ok(value))
    }

    /// 对称地转移到 `target`，不建立恢复关系
    pub(crate) fn transfer(&self, target: &Rc<FiberInner>, value: Value) -> Result<Value> {
        let current = self.current();

        if target.is_terminated() {
            return Err(FiberError::Dead { fiber: target.id });
        }
        if Rc::ptr_eq(&current, target) {
            return Err(Misuse::TransferToCurrent.into());
        }
        if target.is_resuming() {
            return Err(Misuse::TransferToResuming.into());
        }
        if target.is_yielding() {
            return Err(Misuse::TransferToYielding.into());
        }

        target.set_transferer(&current);

        trace!(from = %current.id, to = %target.id, "transfer");
        self.switch(&current, target, Ok(value))
    }

    /// 挂起当前纤程，回到它的恢复者
    pub(crate) fn yield_now(&self, value: Value) -> Result<Value> {
        let current = self.current();

        if current.is_root {
            return Err(Misuse::YieldFromRoot.into());
        }
        let resumer = current.take_resumer().ok_or(Misuse::YieldNotResumed)?;
        resumer.set_resuming(None);
        current.set_yielding(true);

        trace!(from = %current.id, to = %resumer.id, "yield");
        self.switch(&current, &resumer, Ok(value))
    }

    /// 人为消耗当前纤程的栈
    pub(crate) fn consume_stack(&self, bytes: usize) -> Result<()> {
        let current = self.current();
        let marker = 0u8;
        let sp = std::hint::black_box(&marker) as *const u8 as usize;

        let mut slot = current.stack.borrow_mut();
        let stack = slot.as_mut().ok_or(Misuse::NoManagedStack)?;
        let depth = stack.depth_at(sp);
        stack.consume(bytes, depth).inspect_err(|err| {
            debug!(fiber = %current.id, bytes, depth, %err, "stack consumption refused");
        })
    }

    /// 调度器槽位
    pub(crate) fn scheduler(&self) -> Option<Rc<dyn Scheduler>> {
        self.scheduler.borrow().clone()
    }

    /// 替换调度器槽位，返回旧值
    pub(crate) fn replace_scheduler(
        &self,
        scheduler: Option<Rc<dyn Scheduler>>,
    ) -> Option<Rc<dyn Scheduler>> {
        self.scheduler.replace(scheduler)
    }

    /// 执行一次切换，返回切换回来时收到的值
    fn switch(&self, from: &Rc<FiberInner>, to: &Rc<FiberInner>, message: Result<Value>) -> Result<Value> {
        self.post(message);
        from.set_state(FiberState::Suspended);
        to.set_state(FiberState::Running);
        *self.current.borrow_mut() = Rc::clone(to);
        self.switches.set(self.switches.get() + 1);

        let save = from.context.sp_slot();
        let target = to.context.sp();
        unsafe { context::switch(save, target) };

        // 已回到 from 的栈上
        self.reap();
        self.take_message()
    }

    /// 终止当前纤程，返回接下来要切换到的栈指针
    fn finish(&self, fiber: &Rc<FiberInner>, outcome: Result<Value>) -> *mut u8 {
        fiber.set_state(FiberState::Terminated);
        fiber.set_yielding(false);
        if let Some(stack) = fiber.take_stack() {
            self.graveyard.borrow_mut().push(stack);
        }

        let target = self.return_target(fiber);
        match &outcome {
            Ok(_) => debug!(fiber = %fiber.id, to = %target.id, "fiber terminated"),
            Err(err) => warn!(fiber = %fiber.id, to = %target.id, %err, "fiber terminated with failure"),
        }

        self.post(outcome);
        target.set_state(FiberState::Running);
        *self.current.borrow_mut() = Rc::clone(&target);
        self.switches.set(self.switches.get() + 1);
        target.context.sp()
    }

    /// 终止纤程之后控制权的去向：恢复者，其次是仍在 transfer 中等待的转移者，
    /// 最后是根纤程 resume 链的末端
    fn return_target(&self, fiber: &Rc<FiberInner>) -> Rc<FiberInner> {
        if let Some(resumer) = fiber.take_resumer() {
            resumer.set_resuming(None);
            return resumer;
        }

        if let Some(transferer) = fiber.take_transferer() {
            if transferer.state() == FiberState::Suspended
                && !transferer.is_yielding()
                && !transferer.is_resuming()
            {
                return transferer;
            }
        }

        let mut target = self.root();
        while let Some(next) = target.resuming() {
            target = next;
        }
        target
    }

    fn post(&self, message: Result<Value>) {
        *self.mailbox.borrow_mut() = Some(message);
    }

    fn take_message(&self) -> Result<Value> {
        self.mailbox.borrow_mut().take().unwrap_or_else(|| Ok(Value::nil()))
    }

    /// 释放已终止纤程的栈
    fn reap(&self) {
        let dead = std::mem::take(&mut *self.graveyard.borrow_mut());
        if dead.is_empty() {
            return;
        }
        let mut pool = self.pool.borrow_mut();
        for stack in dead {
            pool.release(stack);
        }
    }

    fn scratch_slot(&self) -> *mut *mut u8 {
        self.scratch.sp_slot()
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("root", &self.root.id)
            .field("current", &self.current.borrow().id)
            .field("switches", &self.switches.get())
            .field("pooled_stacks", &self.pool.borrow().len())
            .finish()
    }
}

/// 新纤程在自己栈上的入口
unsafe extern "C" fn fiber_entry(arg: *mut c_void) -> ! {
    let next = run_fiber(arg.cast_const().cast::<FiberInner>());
    let scratch = MACHINE.with(|m| m.scratch_slot());
    unsafe { context::switch(scratch, next) };
    // 已终止的纤程不会再被切换回来
    std::process::abort()
}

/// 运行入口闭包直到结束；返回前释放本栈上持有的所有引用
fn run_fiber(expected: *const FiberInner) -> *mut u8 {
    let machine = Machine::local();
    let fiber = machine.current();
    debug_assert!(ptr::eq(Rc::as_ptr(&fiber), expected));
    machine.reap();

    let input = machine.take_message();
    let outcome = match (input, fiber.take_body()) {
        (Ok(value), Some(body)) => match panic::catch_unwind(AssertUnwindSafe(move || body(value))) {
            Ok(result) => result,
            Err(payload) => Err(FiberError::Panicked {
                fiber: fiber.id,
                message: panic_message(&*payload),
            }),
        },
        (Err(err), _) => Err(err),
        (Ok(value), None) => Ok(value),
    };

    machine.finish(&fiber, outcome)
}
