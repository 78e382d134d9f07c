//! 错误类型
//!
//! 纤程运行时所有可失败操作都返回 [`FiberError`]

use std::any::Any;
use std::io;

use thiserror::Error;

use crate::runtime::FiberId;

/// 运行时结果类型
pub type Result<T> = std::result::Result<T, FiberError>;

/// 纤程运行时错误
#[derive(Debug, Error)]
pub enum FiberError {
    /// 试图恢复或转移到已终止的纤程
    #[error("attempt to resume a terminated fiber {fiber}")]
    Dead { fiber: FiberId },

    /// 结构性误用
    #[error(transparent)]
    Misuse(#[from] Misuse),

    /// 栈空间不足
    #[error("stack overflow: requested {requested} bytes, {available} bytes available")]
    StackOverflow { requested: usize, available: usize },

    /// 纤程入口闭包发生未捕获的 panic
    #[error("fiber {fiber} panicked: {message}")]
    Panicked { fiber: FiberId, message: String },

    /// 被 join 的线程发生 panic
    #[error("joined thread panicked: {0}")]
    ThreadPanicked(String),

    /// 当前线程没有安装调度器
    #[error("no scheduler is installed on this thread")]
    NoScheduler,

    /// 栈内存分配失败
    #[error("failed to allocate fiber stack: {0}")]
    StackAllocation(#[source] io::Error),

    /// 底层 I/O 错误
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FiberError {
    /// 是否为已终止纤程错误
    pub fn is_dead(&self) -> bool {
        matches!(self, FiberError::Dead { .. })
    }

    /// 是否为结构性误用
    pub fn is_misuse(&self) -> bool {
        matches!(self, FiberError::Misuse(_))
    }

    /// 返回误用原因
    pub fn misuse(&self) -> Option<Misuse> {
        match self {
            FiberError::Misuse(m) => Some(*m),
            _ => None,
        }
    }
}

/// 纤程的结构性误用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Misuse {
    #[error("attempt to resume the current fiber")]
    ResumeCurrent,
    #[error("attempt to resume a resumed fiber (double resume)")]
    DoubleResume,
    #[error("attempt to resume a resuming fiber")]
    ResumeResuming,
    #[error("attempt to resume a transferring fiber")]
    ResumeTransferring,
    #[error("attempt to transfer to the current fiber")]
    TransferToCurrent,
    #[error("attempt to transfer to a resuming fiber")]
    TransferToResuming,
    #[error("attempt to transfer to a yielding fiber")]
    TransferToYielding,
    #[error("can't yield from root fiber")]
    YieldFromRoot,
    #[error("attempt to yield on a not resumed fiber")]
    YieldNotResumed,
    #[error("fiber called across threads")]
    CrossThread,
    #[error("the root fiber has no managed stack")]
    NoManagedStack,
    #[error("thread result was already taken")]
    AlreadyJoined,
}

/// 从 panic 负载中提取可读消息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}
