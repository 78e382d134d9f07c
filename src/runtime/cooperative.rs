//! 协作调度器
//!
//! 单线程事件循环：就绪队列、定时器堆、等待表，外加 poll 等待描述符。
//! 其他线程通过通道加自管道唤醒阻塞中的纤程。

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, trace};

use super::fiber::{Fiber, FiberId};
use super::io::{self, Interest, WakePipe};
use super::scheduler::{Blocker, Scheduler, Unblocker};
use super::value::Value;
use crate::error::Result;

/// 等待结束的原因，作为恢复值交给等待中的纤程
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Unblocked,
    TimedOut,
    Ready(Interest),
}

#[derive(Debug, Clone, Copy)]
enum WaitKind {
    Block,
    Sleep,
    Io { fd: RawFd, interest: Interest },
}

struct Wait {
    fiber: Fiber,
    token: u64,
    kind: WaitKind,
}

/// 协作调度器
pub struct CooperativeScheduler {
    ready: RefCell<VecDeque<(Fiber, Wake)>>,
    waits: RefCell<HashMap<FiberId, Wait>>,
    timers: RefCell<BinaryHeap<Reverse<(Instant, u64, FiberId)>>>,
    next_token: Cell<u64>,
    wake_tx: Sender<FiberId>,
    wake_rx: Receiver<FiberId>,
    pipe: Arc<WakePipe>,
    closed: Cell<bool>,
}

impl CooperativeScheduler {
    pub fn new() -> Result<Self> {
        let (wake_tx, wake_rx) = unbounded();
        Ok(Self {
            ready: RefCell::new(VecDeque::new()),
            waits: RefCell::new(HashMap::new()),
            timers: RefCell::new(BinaryHeap::new()),
            next_token: Cell::new(0),
            wake_tx,
            wake_rx,
            pipe: Arc::new(WakePipe::new()?),
            closed: Cell::new(false),
        })
    }

    /// 正在等待的纤程数量
    pub fn waiting(&self) -> usize {
        self.waits.borrow().len()
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// 登记等待并挂起当前纤程
    fn wait(&self, kind: WaitKind, timeout: Option<Duration>) -> Result<Wake> {
        let fiber = Fiber::current();
        let id = fiber.id();
        let token = self.next_token.get();
        self.next_token.set(token + 1);

        if let Some(timeout) = timeout {
            self.timers
                .borrow_mut()
                .push(Reverse((Instant::now() + timeout, token, id)));
        }
        self.waits.borrow_mut().insert(id, Wait { fiber, token, kind });
        trace!(fiber = %id, ?kind, ?timeout, "fiber waiting");

        match Fiber::yield_now(Value::nil()) {
            Ok(value) => Ok(value.downcast::<Wake>().unwrap_or(Wake::Unblocked)),
            Err(err) => {
                self.waits.borrow_mut().remove(&id);
                Err(err)
            }
        }
    }

    /// 结束一个等待，`token` 不匹配说明是过期的定时器
    fn wake(&self, id: FiberId, token: Option<u64>, wake: Wake) {
        let mut waits = self.waits.borrow_mut();
        let matches = waits
            .get(&id)
            .is_some_and(|w| token.is_none_or(|t| t == w.token));
        if !matches {
            return;
        }
        if let Some(wait) = waits.remove(&id) {
            trace!(fiber = %id, ?wake, "fiber ready");
            self.ready.borrow_mut().push_back((wait.fiber, wake));
        }
    }

    fn drain_wakeups(&self) {
        while let Ok(id) = self.wake_rx.try_recv() {
            self.wake(id, None, Wake::Unblocked);
        }
    }

    fn fire_timers(&self, now: Instant) {
        loop {
            let due = {
                let mut timers = self.timers.borrow_mut();
                let expired = timers
                    .peek()
                    .is_some_and(|Reverse((deadline, _, _))| *deadline <= now);
                if expired {
                    timers.pop()
                } else {
                    None
                }
            };
            let Some(Reverse((_, token, id))) = due else {
                break;
            };
            self.wake(id, Some(token), Wake::TimedOut);
        }
    }

    /// 恢复所有就绪纤程；运行期间新就绪的留到下一轮
    ///
    /// 某个纤程失败时，本轮还没运行的纤程放回队首，调度器之后仍可继续运行
    fn run_ready(&self) -> Result<bool> {
        let mut batch: VecDeque<_> = self.ready.borrow_mut().drain(..).collect();
        if batch.is_empty() {
            return Ok(false);
        }
        while let Some((fiber, wake)) = batch.pop_front() {
            if !fiber.is_alive() {
                continue;
            }
            if let Err(err) = fiber.resume(Value::new(wake)) {
                let mut ready = self.ready.borrow_mut();
                while let Some(entry) = batch.pop_back() {
                    ready.push_front(entry);
                }
                return Err(err);
            }
        }
        Ok(true)
    }

    /// 最近的定时器还有多久到期
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let waits = self.waits.borrow();
        let mut timers = self.timers.borrow_mut();
        while let Some(Reverse((deadline, token, id))) = timers.peek().copied() {
            let live = waits.get(&id).is_some_and(|w| w.token == token);
            if live {
                return Some(deadline.saturating_duration_since(now));
            }
            timers.pop();
        }
        None
    }

    /// 在自管道和等待中的描述符上 poll 一次
    fn poll_once(&self, timeout: Option<Duration>) -> Result<()> {
        let mut fds = vec![libc::pollfd {
            fd: self.pipe.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut owners = Vec::new();
        for (id, wait) in self.waits.borrow().iter() {
            if let WaitKind::Io { fd, interest } = wait.kind {
                fds.push(libc::pollfd {
                    fd,
                    events: interest.events(),
                    revents: 0,
                });
                owners.push((*id, wait.token, interest));
            }
        }

        trace!(fds = fds.len(), ?timeout, "scheduler polling");
        if io::poll_fds(&mut fds, timeout)? == 0 {
            return Ok(());
        }

        if fds[0].revents != 0 {
            self.pipe.drain();
        }
        for (pollfd, (id, token, interest)) in fds[1..].iter().zip(owners) {
            if let Some(ready) = Interest::from_revents(interest, pollfd.revents) {
                self.wake(id, Some(token), Wake::Ready(ready));
            }
        }
        Ok(())
    }
}

impl Scheduler for CooperativeScheduler {
    fn block(&self, blocker: &Blocker, timeout: Option<Duration>) -> Result<bool> {
        trace!(%blocker, "block");
        Ok(self.wait(WaitKind::Block, timeout)? != Wake::TimedOut)
    }

    fn unblocker(&self) -> Unblocker {
        let tx = self.wake_tx.clone();
        let pipe = Arc::clone(&self.pipe);
        Unblocker::new(move |fiber| {
            if tx.send(fiber).is_ok() {
                pipe.notify();
            }
        })
    }

    fn kernel_sleep(&self, duration: Option<Duration>) -> Result<()> {
        self.wait(WaitKind::Sleep, duration).map(drop)
    }

    fn io_wait(&self, fd: RawFd, interest: Interest, timeout: Option<Duration>) -> Result<Option<Interest>> {
        match self.wait(WaitKind::Io { fd, interest }, timeout)? {
            Wake::Ready(ready) => Ok(Some(ready)),
            Wake::Unblocked | Wake::TimedOut => Ok(None),
        }
    }

    fn run(&self) -> Result<()> {
        loop {
            self.drain_wakeups();
            self.fire_timers(Instant::now());
            if self.run_ready()? {
                continue;
            }
            if self.waits.borrow().is_empty() {
                return Ok(());
            }
            let timeout = self.next_timeout(Instant::now());
            self.poll_once(timeout)?;
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.get() {
            return Ok(());
        }
        debug!(waiting = self.waiting(), "closing cooperative scheduler");
        // 运行失败时保持未关闭，之后的 close 会继续运行剩余纤程
        self.run()?;
        self.closed.set(true);
        Ok(())
    }
}

impl std::fmt::Debug for CooperativeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooperativeScheduler")
            .field("ready", &self.ready.borrow().len())
            .field("waiting", &self.waiting())
            .field("timers", &self.timers.borrow().len())
            .field("closed", &self.closed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::blocking;
    use crate::runtime::scheduler::{current_scheduler, set_scheduler};
    use crate::runtime::thread;
    use std::rc::Rc;

    fn install() -> Rc<CooperativeScheduler> {
        let scheduler = Rc::new(CooperativeScheduler::new().unwrap());
        set_scheduler(Some(scheduler.clone() as Rc<dyn Scheduler>)).unwrap();
        scheduler
    }

    #[test]
    fn test_join_lets_other_fibers_run() {
        let scheduler = install();
        let log = Rc::new(RefCell::new(Vec::new()));

        let handle = thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
            7
        })
        .unwrap();

        let joined = Rc::clone(&log);
        let waiting = Fiber::schedule(move |_| {
            let value = handle.join()?;
            joined.borrow_mut().push(format!("joined {value}"));
            Ok(Value::nil())
        })
        .unwrap();
        assert!(waiting.is_alive());
        assert_eq!(scheduler.waiting(), 1);

        let other = Rc::clone(&log);
        Fiber::schedule(move |_| {
            other.borrow_mut().push("other".to_string());
            Ok(Value::nil())
        })
        .unwrap();

        set_scheduler(None).unwrap();
        assert!(scheduler.is_closed());
        assert!(!waiting.is_alive());
        assert_eq!(*log.borrow(), vec!["other".to_string(), "joined 7".to_string()]);
    }

    #[test]
    fn test_sleep_order() {
        install();
        let log = Rc::new(RefCell::new(Vec::new()));

        for ms in [30u64, 10, 20] {
            let log = Rc::clone(&log);
            Fiber::schedule(move |_| {
                blocking::sleep(Duration::from_millis(ms))?;
                log.borrow_mut().push(ms);
                Ok(Value::nil())
            })
            .unwrap();
        }
        assert!(log.borrow().is_empty());

        set_scheduler(None).unwrap();
        assert_eq!(*log.borrow(), vec![10, 20, 30]);
    }

    #[test]
    fn test_block_timeout() {
        install();
        let result = Rc::new(Cell::new(None));

        let seen = Rc::clone(&result);
        let fiber = Fiber::schedule(move |_| {
            let scheduler = current_scheduler().unwrap();
            let woken = scheduler.block(&Blocker::Custom("never".into()), Some(Duration::from_millis(10)))?;
            seen.set(Some(woken));
            Ok(Value::nil())
        })
        .unwrap();

        set_scheduler(None).unwrap();
        assert!(!fiber.is_alive());
        assert_eq!(result.get(), Some(false));
    }

    #[test]
    fn test_unblock_from_other_thread() {
        let scheduler = install();
        let result = Rc::new(Cell::new(None));

        let seen = Rc::clone(&result);
        let fiber = Fiber::schedule(move |_| {
            let scheduler = current_scheduler().unwrap();
            let woken = scheduler.block(&Blocker::Custom("signal".into()), Some(Duration::from_secs(30)))?;
            seen.set(Some(woken));
            Ok(Value::nil())
        })
        .unwrap();

        let unblocker = scheduler.unblocker();
        let id = fiber.id();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            unblocker.unblock(id);
        });

        let start = Instant::now();
        set_scheduler(None).unwrap();
        assert_eq!(result.get(), Some(true));
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_io_wait_on_pipe() {
        install();
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);
        let log = Rc::new(RefCell::new(Vec::new()));

        let reader_log = Rc::clone(&log);
        Fiber::schedule(move |_| {
            let ready = blocking::io_wait(read_fd, Interest::Readable, None)?;
            reader_log.borrow_mut().push(format!("read {ready:?}"));
            Ok(Value::nil())
        })
        .unwrap();

        let writer_log = Rc::clone(&log);
        Fiber::schedule(move |_| {
            blocking::sleep(Duration::from_millis(5))?;
            writer_log.borrow_mut().push("write".to_string());
            unsafe {
                libc::write(write_fd, b"x".as_ptr().cast(), 1);
            }
            Ok(Value::nil())
        })
        .unwrap();

        set_scheduler(None).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["write".to_string(), "read Some(Readable)".to_string()]
        );

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn test_io_wait_timeout() {
        install();
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let read_fd = fds[0];
        let result = Rc::new(Cell::new(Some(Interest::Writable)));
        let seen = Rc::clone(&result);
        Fiber::schedule(move |_| {
            seen.set(blocking::io_wait(read_fd, Interest::Readable, Some(Duration::from_millis(10)))?);
            Ok(Value::nil())
        })
        .unwrap();

        set_scheduler(None).unwrap();
        assert_eq!(result.get(), None);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_scheduled_fiber_error_surfaces_from_run() {
        install();
        Fiber::schedule(|_| {
            blocking::sleep(Duration::from_millis(1))?;
            Err(crate::error::FiberError::NoScheduler)
        })
        .unwrap();

        let err = set_scheduler(None).err().unwrap();
        assert!(matches!(err, crate::error::FiberError::NoScheduler));
        assert!(current_scheduler().is_some());
        set_scheduler(None).unwrap();
    }

    #[test]
    fn test_failed_fiber_keeps_siblings_runnable() {
        let scheduler = install();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut siblings = Vec::new();

        for n in 0..3u32 {
            let log = Rc::clone(&log);
            let fiber = Fiber::schedule(move |_| {
                blocking::sleep(Duration::from_millis(5))?;
                if n == 0 {
                    return Err(crate::error::FiberError::NoScheduler);
                }
                log.borrow_mut().push(n);
                Ok(Value::nil())
            })
            .unwrap();
            siblings.push(fiber);
        }

        // 三个定时器同一轮到期，第一个纤程失败
        std::thread::sleep(Duration::from_millis(10));
        let err = set_scheduler(None).err().unwrap();
        assert!(matches!(err, crate::error::FiberError::NoScheduler));
        assert!(!scheduler.is_closed());

        set_scheduler(None).unwrap();
        assert!(scheduler.is_closed());
        assert_eq!(*log.borrow(), vec![1, 2]);
        assert!(siblings.iter().all(|f| !f.is_alive()));
        assert_eq!(scheduler.waiting(), 0);
    }

    #[test]
    fn test_close_runs_once() {
        let scheduler = install();
        set_scheduler(None).unwrap();
        assert!(scheduler.is_closed());
        scheduler.close().unwrap();
        assert_eq!(scheduler.waiting(), 0);
    }
}
