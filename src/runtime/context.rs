//! 纤程执行上下文
//!
//! 保存挂起纤程的栈指针，并提供平台相关的上下文切换原语。
//! 被调用者保存寄存器压在各自栈上，上下文本身只记录一个栈指针。

use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;

#[cfg(not(unix))]
compile_error!("spindle only supports unix targets");

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("spindle only supports x86_64 and aarch64");

/// 新纤程在自己栈上执行的第一个函数
pub(crate) type EntryFn = unsafe extern "C" fn(arg: *mut c_void) -> !;

/// 纤程执行上下文
#[derive(Debug)]
pub(crate) struct Context {
    /// 挂起时的栈指针
    sp: Cell<*mut u8>,
}

impl Context {
    /// 创建空上下文（根纤程在第一次切出时填充）
    pub fn new() -> Self {
        Self {
            sp: Cell::new(ptr::null_mut()),
        }
    }

    /// 获取保存的栈指针
    #[inline]
    pub fn sp(&self) -> *mut u8 {
        self.sp.get()
    }

    /// 设置保存的栈指针
    #[inline]
    pub fn set_sp(&self, sp: *mut u8) {
        self.sp.set(sp);
    }

    /// 保存栈指针的槽位地址，供切换原语写入
    #[inline]
    pub fn sp_slot(&self) -> *mut *mut u8 {
        self.sp.as_ptr()
    }
}

/// 在新栈上布置初始帧，返回可以直接切换过去的栈指针
///
/// 第一次切换到该栈时会进入 `entry(arg)`，`entry` 永不返回。
///
/// # Safety
/// `top` 必须是一段可写栈的最高地址且 16 字节对齐，下方至少留有一个初始帧的空间。
pub(crate) unsafe fn prepare(top: *mut u8, entry: EntryFn, arg: *mut c_void) -> *mut u8 {
    unsafe { arch::prepare(top, entry, arg) }
}

/// 保存当前上下文到 `save`，切换到栈指针 `to`
///
/// 当有别的纤程切回 `save` 所记录的上下文时本函数才返回。
///
/// # Safety
/// `save` 必须可写；`to` 必须来自 [`prepare`] 或之前一次切换保存的栈指针，
/// 且对应的栈仍然存活。
#[inline]
pub(crate) unsafe fn switch(save: *mut *mut u8, to: *mut u8) {
    unsafe { arch::switch_stack(save, to) }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::EntryFn;
    use std::arch::naked_asm;
    use std::ffi::c_void;

    /// 初始帧：MXCSR 与 x87 控制字 + 6 个被调用者保存寄存器 + 返回地址 + 对齐填充
    const INITIAL_FRAME: usize = 80;

    /// SysV 规定的初始浮点控制状态：MXCSR 0x1F80（低 32 位），x87 控制字 0x037F（高 32 位）
    const DEFAULT_FP_CONTROL: usize = 0x1F80 | (0x037F << 32);

    pub(super) unsafe fn prepare(top: *mut u8, entry: EntryFn, arg: *mut c_void) -> *mut u8 {
        // 恢复控制字、弹出 6 个寄存器并 ret 之后 rsp = top - 16，保证 call 前 16 字节对齐
        let sp = unsafe { top.sub(INITIAL_FRAME) }.cast::<usize>();
        let frame: [usize; 10] = [
            DEFAULT_FP_CONTROL,
            0, // r15
            0, // r14
            entry as usize, // r13
            arg as usize, // r12
            0, // rbx
            0, // rbp
            fiber_trampoline as usize, // 返回地址
            0,
            0,
        ];
        for (i, word) in frame.iter().enumerate() {
            unsafe { sp.add(i).write(*word) };
        }
        sp.cast()
    }

    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch_stack(_save: *mut *mut u8, _to: *mut u8) {
        naked_asm!(
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "sub rsp, 8",
            "stmxcsr dword ptr [rsp]",
            "fnstcw word ptr [rsp + 4]",
            "mov [rdi], rsp",
            "mov rsp, rsi",
            "ldmxcsr dword ptr [rsp]",
            "fldcw word ptr [rsp + 4]",
            "add rsp, 8",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
        )
    }

    #[unsafe(naked)]
    unsafe extern "C" fn fiber_trampoline() {
        naked_asm!("mov rdi, r12", "call r13", "ud2")
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::EntryFn;
    use std::arch::naked_asm;
    use std::ffi::c_void;

    /// 初始帧：x19-x30 与 d8-d15
    const INITIAL_FRAME: usize = 0xa0;

    pub(super) unsafe fn prepare(top: *mut u8, entry: EntryFn, arg: *mut c_void) -> *mut u8 {
        let sp = unsafe { top.sub(INITIAL_FRAME) }.cast::<usize>();
        for i in 0..INITIAL_FRAME / 8 {
            unsafe { sp.add(i).write(0) };
        }
        unsafe {
            sp.write(arg as usize); // x19
            sp.add(1).write(entry as usize); // x20
            sp.add(11).write(fiber_trampoline as usize); // x30
        }
        sp.cast()
    }

    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch_stack(_save: *mut *mut u8, _to: *mut u8) {
        naked_asm!(
            "sub sp, sp, #0xa0",
            "stp x19, x20, [sp, #0x00]",
            "stp x21, x22, [sp, #0x10]",
            "stp x23, x24, [sp, #0x20]",
            "stp x25, x26, [sp, #0x30]",
            "stp x27, x28, [sp, #0x40]",
            "stp x29, x30, [sp, #0x50]",
            "stp d8, d9, [sp, #0x60]",
            "stp d10, d11, [sp, #0x70]",
            "stp d12, d13, [sp, #0x80]",
            "stp d14, d15, [sp, #0x90]",
            "mov x2, sp",
            "str x2, [x0]",
            "mov sp, x1",
            "ldp x19, x20, [sp, #0x00]",
            "ldp x21, x22, [sp, #0x10]",
            "ldp x23, x24, [sp, #0x20]",
            "ldp x25, x26, [sp, #0x30]",
            "ldp x27, x28, [sp, #0x40]",
            "ldp x29, x30, [sp, #0x50]",
            "ldp d8, d9, [sp, #0x60]",
            "ldp d10, d11, [sp, #0x70]",
            "ldp d12, d13, [sp, #0x80]",
            "ldp d14, d15, [sp, #0x90]",
            "add sp, sp, #0xa0",
            "ret",
        )
    }

    #[unsafe(naked)]
    unsafe extern "C" fn fiber_trampoline() {
        naked_asm!("mov x0, x19", "blr x20", "brk #0x1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::stack::Stack;

    thread_local! {
        static RETURN_SP: Cell<*mut u8> = const { Cell::new(ptr::null_mut()) };
        static SCRATCH: Cell<*mut u8> = const { Cell::new(ptr::null_mut()) };
    }

    unsafe extern "C" fn bump_and_return(arg: *mut c_void) -> ! {
        let counter = arg.cast::<u32>();
        unsafe { *counter += 1 };
        let back = RETURN_SP.with(Cell::get);
        let scratch = SCRATCH.with(Cell::as_ptr);
        unsafe { switch(scratch, back) };
        std::process::abort()
    }

    #[test]
    fn test_context_switch_round_trip() {
        let stack = Stack::new(64 * 1024, true).unwrap();
        let mut counter = 0u32;

        unsafe {
            let sp = prepare(
                stack.top(),
                bump_and_return,
                (&mut counter as *mut u32).cast(),
            );
            switch(RETURN_SP.with(Cell::as_ptr), sp);
        }

        assert_eq!(counter, 1);
    }

    #[cfg(target_arch = "x86_64")]
    fn read_mxcsr() -> u32 {
        let mut value = 0u32;
        unsafe {
            std::arch::asm!("stmxcsr dword ptr [{}]", in(reg) &mut value as *mut u32, options(nostack));
        }
        value
    }

    #[cfg(target_arch = "x86_64")]
    fn write_mxcsr(value: u32) {
        unsafe {
            std::arch::asm!("ldmxcsr dword ptr [{}]", in(reg) &value as *const u32, options(nostack));
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_rounding_mode_stays_with_fiber() {
        use crate::runtime::fiber::Fiber;
        use crate::runtime::value::Value;

        // 向零舍入
        const ROUND_TOWARD_ZERO: u32 = 0x6000;
        let original = read_mxcsr();
        let fiber = Fiber::new(move |_| {
            write_mxcsr(original | ROUND_TOWARD_ZERO);
            Fiber::yield_now(Value::nil())?;
            Ok(Value::new(read_mxcsr()))
        })
        .unwrap();

        fiber.resume(Value::nil()).unwrap();
        assert_eq!(read_mxcsr(), original);

        let inside = fiber.resume(Value::nil()).unwrap().downcast::<u32>().unwrap();
        assert_eq!(inside, original | ROUND_TOWARD_ZERO);
        assert_eq!(read_mxcsr(), original);
    }

    #[test]
    fn test_context_new() {
        let ctx = Context::new();
        assert!(ctx.sp().is_null());
        ctx.set_sp(8 as *mut u8);
        assert_eq!(ctx.sp(), 8 as *mut u8);
    }
}
