//! spindle 演示程序
//!
//! 在几个典型场景里运行纤程运行时，输出每一步发生了什么

use std::os::unix::io::RawFd;
use std::process;
use std::rc::Rc;
use std::time::Duration;

use spindle::config::{RUNTIME_NAME, VERSION};
use spindle::logger::{self, LogLevel};
use spindle::{
    set_scheduler, thread, Blocker, CooperativeScheduler, Fiber, Interest, Result, Scheduler,
    Unblocker, Value,
};

/// 唤醒等待者之后，唤醒方线程再睡一会儿
///
/// 用来确认被唤醒的纤程不依赖唤醒方线程后续的行为
struct SleepingUnblockScheduler {
    inner: CooperativeScheduler,
}

impl SleepingUnblockScheduler {
    fn new() -> Result<Self> {
        Ok(Self {
            inner: CooperativeScheduler::new()?,
        })
    }
}

impl Scheduler for SleepingUnblockScheduler {
    fn block(&self, blocker: &Blocker, timeout: Option<Duration>) -> Result<bool> {
        self.inner.block(blocker, timeout)
    }

    fn unblocker(&self) -> Unblocker {
        let inner = self.inner.unblocker();
        Unblocker::new(move |fiber| {
            inner.unblock(fiber);
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

/// 在调度器下 join 一个正在睡眠的线程
fn scheduled_join() -> Result<()> {
    let handle = thread::spawn(|| -> Result<()> {
        set_scheduler(Some(Rc::new(SleepingUnblockScheduler::new()?) as Rc<dyn Scheduler>))?;

        Fiber::schedule(|_| {
            let sleeper = thread::spawn(|| spindle::sleep(Duration::from_millis(10)))?;

            println!("Time to hang.");
            sleeper.join()??;
            println!("I'm okay now.");
            Ok(Value::nil())
        })?;
        Ok(())
    })?;

    handle.join()?
}

/// resume 与 transfer 对 resuming_fiber 的不同影响
fn resuming_chain() -> Result<()> {
    let root = Fiber::current();
    let f1 = Fiber::new(move |_| root.transfer(Value::nil()))?;
    let target = f1.clone();
    let f2 = Fiber::new(move |_| target.resume(Value::nil()))?;

    f2.transfer(Value::nil())?;

    let name = |f: Option<Fiber>| f.map(|f| f.id().to_string()).unwrap_or_else(|| "none".into());
    println!("f1 {} resuming: {}", f1.id(), name(f1.resuming_fiber()));
    println!("f2 {} resuming: {}", f2.id(), name(f2.resuming_fiber()));
    println!("f1 resumer: {}", name(f1.resumer()));
    Ok(())
}

/// 逐步消耗纤程栈直到溢出
fn stack_stress(stack_size: usize, step: usize) -> Result<()> {
    let fiber = Fiber::builder()
        .name("stress")
        .stack_size(stack_size)
        .spawn(move |_| {
            let mut total = 0usize;
            loop {
                match Fiber::consume_stack(step) {
                    Ok(()) => total += step,
                    Err(err) => {
                        println!("stopped after {total} bytes: {err}");
                        return Ok(Value::new(total));
                    }
                }
            }
        })?;

    let capacity = fiber.stack_capacity().unwrap_or(0);
    let total = fiber.resume(Value::nil())?.downcast::<usize>().unwrap_or(0);
    println!("capacity {capacity}, consumed {total}");
    Ok(())
}

fn print_help() {
    println!("{RUNTIME_NAME} {VERSION}");
    println!();
    println!("Usage: spindle-demo [--debug|--trace] <command>");
    println!();
    println!("Commands:");
    println!("  join                  Join a sleeping thread under a scheduler (default)");
    println!("  chain                 Show resume/transfer relationships");
    println!("  stress [size] [step]  Consume a fiber stack until it overflows");
    println!("  help                  Show this help message");
    println!("  version               Show version information");
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut level = LogLevel::Warn;
    let mut rest: Vec<&str> = Vec::new();
    for arg in &args {
        match arg.as_str() {
            "--debug" => level = LogLevel::Debug,
            "--trace" => level = LogLevel::Trace,
            other => rest.push(other),
        }
    }
    logger::init_with_level(level);

    let outcome = match rest.as_slice() {
        [] | ["join"] => scheduled_join(),
        ["chain"] => resuming_chain(),
        ["stress", args @ ..] => {
            let size = args.first().and_then(|s| s.parse().ok()).unwrap_or(64 * 1024);
            let step = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(4096);
            stack_stress(size, step)
        }
        ["help"] | ["--help"] | ["-h"] => {
            print_help();
            Ok(())
        }
        ["version"] | ["--version"] | ["-v"] => {
            println!("{RUNTIME_NAME} {VERSION}");
            Ok(())
        }
        _ => {
            print_help();
            process::exit(1);
        }
    };

    if let Err(err) = outcome {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
