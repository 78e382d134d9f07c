//! I/O 就绪等待
//!
//! 基于 poll(2) 的最小封装，供没有调度器时的直接等待和协作调度器的事件循环使用

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// 等待的 I/O 事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    /// 转换为 poll 事件掩码
    pub fn events(self) -> libc::c_short {
        match self {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
            Interest::ReadWrite => libc::POLLIN | libc::POLLOUT,
        }
    }

    /// 根据 poll 返回的事件计算实际就绪的部分
    ///
    /// 挂断和错误视为请求的方向全部就绪，由后续读写报告具体错误
    pub fn from_revents(requested: Interest, revents: libc::c_short) -> Option<Interest> {
        let failed = revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0;
        let readable = requested.is_readable() && (failed || revents & libc::POLLIN != 0);
        let writable = requested.is_writable() && (failed || revents & libc::POLLOUT != 0);
        match (readable, writable) {
            (true, true) => Some(Interest::ReadWrite),
            (true, false) => Some(Interest::Readable),
            (false, true) => Some(Interest::Writable),
            (false, false) => None,
        }
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        matches!(self, Interest::Readable | Interest::ReadWrite)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, Interest::Writable | Interest::ReadWrite)
    }
}

/// 调用 poll，被信号打断时按剩余时间重试
///
/// `timeout` 为 None 时无限等待。返回就绪的描述符数量，0 表示超时
pub fn poll_fds(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis(remaining)) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// 超时转换为毫秒，向上取整，避免把很短的超时变成忙等
fn millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(t) => {
            let ms = t.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// 自管道：其他线程写入一个字节，唤醒阻塞在 poll 上的事件循环
#[derive(Debug)]
pub struct WakePipe {
    read: RawFd,
    write: RawFd,
}

impl WakePipe {
    /// 创建非阻塞、close-on-exec 的管道
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let pipe = Self {
            read: fds[0],
            write: fds[1],
        };
        set_nonblocking_cloexec(pipe.read)?;
        set_nonblocking_cloexec(pipe.write)?;
        Ok(pipe)
    }

    /// 读端描述符
    #[inline]
    pub fn read_fd(&self) -> RawFd {
        self.read
    }

    /// 写入一个字节；管道已满说明已有未处理的唤醒，直接忽略
    pub fn notify(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(self.write, (&byte as *const u8).cast(), 1);
        }
    }

    /// 读空管道
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_from_revents() {
        assert_eq!(
            Interest::from_revents(Interest::ReadWrite, libc::POLLIN),
            Some(Interest::Readable)
        );
        assert_eq!(Interest::from_revents(Interest::Writable, libc::POLLIN), None);
        assert_eq!(
            Interest::from_revents(Interest::ReadWrite, libc::POLLHUP),
            Some(Interest::ReadWrite)
        );
    }

    #[test]
    fn test_millis_rounds_up() {
        assert_eq!(millis(None), -1);
        assert_eq!(millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(millis(Some(Duration::from_millis(20))), 20);
    }

    #[test]
    fn test_wake_pipe() {
        let pipe = WakePipe::new().unwrap();
        let mut fds = [libc::pollfd {
            fd: pipe.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];

        assert_eq!(poll_fds(&mut fds, Some(Duration::ZERO)).unwrap(), 0);

        pipe.notify();
        pipe.notify();
        assert_eq!(poll_fds(&mut fds, Some(Duration::from_secs(1))).unwrap(), 1);

        pipe.drain();
        fds[0].revents = 0;
        assert_eq!(poll_fds(&mut fds, Some(Duration::ZERO)).unwrap(), 0);
    }
}
