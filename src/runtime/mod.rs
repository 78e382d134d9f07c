//! 纤程运行时模块
//!
//! 每个操作系统线程独立运行一组有栈协程（纤程），切换完全由调用方显式触发。
//!
//! 核心组件：
//! - Stack: mmap 分配的独占栈，带保护页
//! - Context: 平台相关的上下文切换原语
//! - Fiber: 纤程句柄与状态
//! - Machine: 线程执行上下文，实现 resume / transfer / yield
//! - Scheduler: 调度器钩子，把阻塞操作转换为协作式挂起

pub mod blocking;
pub mod context;
pub mod cooperative;
pub mod fiber;
pub mod io;
pub mod machine;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod value;

pub use blocking::{io_wait, sleep};
pub use cooperative::CooperativeScheduler;
pub use fiber::{Builder, Entry, Fiber, FiberId, FiberState};
pub use io::Interest;
pub use machine::Machine;
pub use scheduler::{
    current_scheduler, intercepting_scheduler, set_scheduler, Blocker, Scheduler, Unblocker,
};
pub use stack::{Stack, StackPool};
pub use value::Value;
