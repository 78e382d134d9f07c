//! spindle: 有栈协作式纤程运行时
//!
//! ```no_run
//! use spindle::{Fiber, Value};
//!
//! let fiber = Fiber::new(|v| {
//!     let n = v.downcast::<i32>().unwrap_or(0);
//!     let m = Fiber::yield_now(Value::new(n + 1))?;
//!     Ok(m)
//! })?;
//! let first = fiber.resume(Value::new(1))?;
//! assert_eq!(first.downcast::<i32>().ok(), Some(2));
//! fiber.resume(Value::nil())?;
//! # Ok::<(), spindle::FiberError>(())
//! ```

pub mod config;
pub mod error;
pub mod logger;
pub mod runtime;

pub use config::{configure, current_config, RuntimeConfig};
pub use error::{FiberError, Misuse, Result};
pub use runtime::{
    current_scheduler, io_wait, set_scheduler, sleep, thread, Blocker, Builder,
    CooperativeScheduler, Fiber, FiberId, FiberState, Interest, Scheduler, Unblocker, Value,
};
