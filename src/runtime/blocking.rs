//! 阻塞操作拦截
//!
//! 非阻塞纤程在安装了调度器的线程上调用这些函数时，等待交给调度器；
//! 否则直接阻塞当前线程。

use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use tracing::trace;

use super::io::{self, Interest};
use super::scheduler::intercepting_scheduler;
use crate::error::Result;

/// 睡眠指定时长
pub fn sleep(duration: Duration) -> Result<()> {
    match intercepting_scheduler() {
        Some(scheduler) => {
            trace!(?duration, "sleep intercepted by scheduler");
            scheduler.kernel_sleep(Some(duration))
        }
        None => {
            thread::sleep(duration);
            Ok(())
        }
    }
}

/// 等待描述符就绪，超时返回 None
pub fn io_wait(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> Result<Option<Interest>> {
    if let Some(scheduler) = intercepting_scheduler() {
        trace!(fd, ?interest, ?timeout, "io wait intercepted by scheduler");
        return scheduler.io_wait(fd, interest, timeout);
    }

    let mut fds = [libc::pollfd {
        fd,
        events: interest.events(),
        revents: 0,
    }];
    if io::poll_fds(&mut fds, timeout)? == 0 {
        return Ok(None);
    }
    Ok(Interest::from_revents(interest, fds[0].revents))
}
