//! 调度器下 join 线程时，其他纤程照常运行

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spindle::{
    set_scheduler, thread, Blocker, CooperativeScheduler, Fiber, Interest, Result, Scheduler,
    Unblocker, Value,
};

/// 转发唤醒之后让唤醒方线程再睡一会儿
struct SleepingUnblockScheduler {
    inner: CooperativeScheduler,
    unblocked: Arc<AtomicUsize>,
}

impl Scheduler for SleepingUnblockScheduler {
    fn block(&self, blocker: &Blocker, timeout: Option<Duration>) -> Result<bool> {
        self.inner.block(blocker, timeout)
    }

    fn unblocker(&self) -> Unblocker {
        let inner = self.inner.unblocker();
        let unblocked = Arc::clone(&self.unblocked);
        Unblocker::new(move |fiber| {
            inner.unblock(fiber);
            unblocked.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
        })
    }

    fn kernel_sleep(&self, duration: Option<Duration>) -> Result<()> {
        self.inner.kernel_sleep(duration)
    }

    fn io_wait(&self, fd: RawFd, interest: Interest, timeout: Option<Duration>) -> Result<Option<Interest>> {
        self.inner.io_wait(fd, interest, timeout)
    }

    fn run(&self) -> Result<()> {
        self.inner.run()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

#[test]
fn test_join_under_sleeping_unblock_scheduler() {
    let unblocked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&unblocked);

    let handle = thread::spawn(move || -> Result<Vec<String>> {
        let scheduler = SleepingUnblockScheduler {
            inner: CooperativeScheduler::new()?,
            unblocked: counter,
        };
        set_scheduler(Some(Rc::new(scheduler) as Rc<dyn Scheduler>))?;

        let log = Rc::new(RefCell::new(Vec::new()));
        let joined = Rc::clone(&log);
        Fiber::schedule(move |_| {
            let sleeper = thread::spawn(|| std::thread::sleep(Duration::from_millis(10)))?;
            joined.borrow_mut().push("Time to hang.".to_string());
            sleeper.join()?;
            joined.borrow_mut().push("I'm okay now.".to_string());
            Ok(Value::nil())
        })?;

        let other = Rc::clone(&log);
        Fiber::schedule(move |_| {
            other.borrow_mut().push("other fiber".to_string());
            Ok(Value::nil())
        })?;

        // 调度器在线程结束时关闭，这里先取出已排队的日志
        set_scheduler(None)?;
        let lines = log.borrow().clone();
        Ok(lines)
    })
    .unwrap();

    let lines = handle.join().unwrap().unwrap();
    assert_eq!(lines, ["Time to hang.", "other fiber", "I'm okay now."]);
    assert_eq!(unblocked.load(Ordering::SeqCst), 1);
}

#[test]
fn test_thread_end_closes_scheduler() {
    let handle = thread::spawn(|| -> Result<()> {
        set_scheduler(Some(Rc::new(CooperativeScheduler::new()?) as Rc<dyn Scheduler>))?;
        Fiber::schedule(|_| {
            spindle::sleep(Duration::from_millis(5))?;
            Ok(Value::nil())
        })?;
        Ok(())
    })
    .unwrap();

    // 线程结束前会把睡眠中的纤程运行完
    handle.join().unwrap().unwrap();
}

#[test]
fn test_blocking_fiber_is_not_intercepted() {
    let scheduler = Rc::new(CooperativeScheduler::new().unwrap());
    set_scheduler(Some(scheduler.clone() as Rc<dyn Scheduler>)).unwrap();

    let fiber = Fiber::builder()
        .blocking(true)
        .spawn(|_| {
            spindle::sleep(Duration::from_millis(1))?;
            Ok(Value::nil())
        })
        .unwrap();
    fiber.resume(Value::nil()).unwrap();

    assert!(!fiber.is_alive());
    assert_eq!(scheduler.waiting(), 0);
    set_scheduler(None).unwrap();
}
