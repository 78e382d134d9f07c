//! 纤程栈管理
//!
//! 每个纤程独占一段 mmap 分配的连续栈，栈底放一页不可访问的保护页，
//! 真实溢出会触发段错误而不是悄悄改写相邻内存。

use std::io;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use crate::config::RuntimeConfig;
use crate::error::{FiberError, Result};

/// 纤程栈
///
/// 栈从高地址向低地址增长，`top()` 是初始栈指针位置
pub struct Stack {
    /// 映射起始地址（低地址，保护页所在）
    base: NonNull<u8>,
    /// 映射总长度（含保护页）
    len: usize,
    /// 保护页长度
    guard: usize,
    /// 通过 consume 人为占用的字节数
    consumed: usize,
}

impl Stack {
    /// 栈对齐：16 字节
    pub const ALIGNMENT: usize = 16;

    /// 分配指定大小的栈
    ///
    /// 大小会被限制在允许范围内并向上取整到页大小
    pub fn new(size: usize, guard_page: bool) -> Result<Self> {
        let page = page_size();
        let usable = round_up(RuntimeConfig::clamp_stack_size(size), page);
        let guard = if guard_page { page } else { 0 };
        let len = usable + guard;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                map_flags(),
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(FiberError::StackAllocation(io::Error::last_os_error()));
        }

        if guard > 0 && unsafe { libc::mprotect(ptr, guard, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr, len);
            }
            return Err(FiberError::StackAllocation(err));
        }

        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| FiberError::StackAllocation(io::Error::other("mmap returned null")))?;

        Ok(Self {
            base,
            len,
            guard,
            consumed: 0,
        })
    }

    /// 获取栈顶地址（初始位置，高地址）
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// 获取可用区域的最低地址
    #[inline]
    pub fn limit(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// 获取可用容量（不含保护页）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.len - self.guard
    }

    /// 是否带有保护页
    #[inline]
    pub fn has_guard_page(&self) -> bool {
        self.guard > 0
    }

    /// 获取人为占用的字节数
    #[inline]
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// 检查地址是否落在本栈的可用区域内
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.limit() as usize && addr <= self.top() as usize
    }

    /// 给定当前栈指针，计算实际已使用的深度
    pub fn depth_at(&self, sp: usize) -> usize {
        if self.contains(sp) {
            self.top() as usize - sp
        } else {
            0
        }
    }

    /// 剩余可用字节数
    pub fn available(&self, depth: usize) -> usize {
        self.capacity().saturating_sub(depth + self.consumed)
    }

    /// 人为推进已使用标记
    ///
    /// 不做真实递归也不写内存，只移动标记；`amount` 必须严格小于剩余空间
    pub fn consume(&mut self, amount: usize, depth: usize) -> Result<()> {
        let available = self.available(depth);
        if amount >= available {
            return Err(FiberError::StackOverflow {
                requested: amount,
                available,
            });
        }
        self.consumed += amount;
        Ok(())
    }

    /// 重置栈以便复用
    pub fn reset(&mut self) {
        self.consumed = 0;
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("top", &self.top())
            .field("capacity", &self.capacity())
            .field("guard", &self.guard)
            .field("consumed", &self.consumed)
            .finish()
    }
}

/// 空闲栈缓存
///
/// 终止纤程的栈放回这里，之后同样大小的纤程直接复用
#[derive(Debug, Default)]
pub struct StackPool {
    free: Vec<Stack>,
    capacity: usize,
}

impl StackPool {
    /// 创建容量为 `capacity` 的缓存
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// 取出一个可用栈，缓存里没有合适的就新分配
    pub fn allocate(&mut self, size: usize, guard_page: bool) -> Result<Stack> {
        let wanted = round_up(RuntimeConfig::clamp_stack_size(size), page_size());
        if let Some(idx) = self
            .free
            .iter()
            .position(|s| s.capacity() == wanted && s.has_guard_page() == guard_page)
        {
            let mut stack = self.free.swap_remove(idx);
            stack.reset();
            return Ok(stack);
        }
        Stack::new(size, guard_page)
    }

    /// 归还栈，缓存满时直接释放
    pub fn release(&mut self, stack: Stack) {
        if self.free.len() < self.capacity {
            self.free.push(stack);
        }
    }

    /// 缓存中的栈数量
    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// 缓存是否为空
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

/// 系统页大小
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn map_flags() -> libc::c_int {
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn map_flags() -> libc::c_int {
    libc::MAP_PRIVATE | libc::MAP_ANON
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_STACK_SIZE;

    #[test]
    fn test_stack_new() {
        let stack = Stack::new(64 * 1024, true).unwrap();
        assert_eq!(stack.capacity(), 64 * 1024);
        assert_eq!(stack.consumed(), 0);
        assert!(stack.has_guard_page());
        assert_eq!(stack.top() as usize % Stack::ALIGNMENT, 0);
    }

    #[test]
    fn test_stack_clamped() {
        let stack = Stack::new(1, false).unwrap();
        assert!(stack.capacity() >= MIN_STACK_SIZE);
        assert!(!stack.has_guard_page());
    }

    #[test]
    fn test_stack_consume() {
        let mut stack = Stack::new(64 * 1024, true).unwrap();
        let cap = stack.capacity();

        assert!(stack.consume(cap / 2, 0).is_ok());
        assert_eq!(stack.consumed(), cap / 2);

        // 剩余恰好 cap/2，等于剩余空间时失败
        let err = stack.consume(cap / 2, 0).unwrap_err();
        assert!(matches!(
            err,
            FiberError::StackOverflow { requested, available } if requested == cap / 2 && available == cap / 2
        ));

        // 失败不改变标记
        assert_eq!(stack.consumed(), cap / 2);

        stack.reset();
        assert_eq!(stack.consumed(), 0);
    }

    #[test]
    fn test_stack_depth() {
        let stack = Stack::new(64 * 1024, true).unwrap();
        let top = stack.top() as usize;
        assert_eq!(stack.depth_at(top - 128), 128);
        assert_eq!(stack.depth_at(0), 0);
        assert_eq!(stack.available(128), stack.capacity() - 128);
    }

    #[test]
    fn test_stack_pool_reuse() {
        let mut pool = StackPool::new(1);
        let stack = pool.allocate(64 * 1024, true).unwrap();
        let top = stack.top();
        pool.release(stack);
        assert_eq!(pool.len(), 1);

        // 第二个会被直接丢弃
        pool.release(Stack::new(64 * 1024, true).unwrap());
        assert_eq!(pool.len(), 1);

        let reused = pool.allocate(64 * 1024, true).unwrap();
        assert_eq!(reused.top(), top);
        assert!(pool.is_empty());
    }
}
