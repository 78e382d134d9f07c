//! 配置模块
//!
//! 所有与纤程运行时相关的常量和可调参数都在这里定义，便于后期修改

use parking_lot::RwLock;

/// 运行时名称
pub const RUNTIME_NAME: &str = "spindle";

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 默认纤程栈大小：512KB
pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

/// 最小纤程栈大小：16KB
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// 最大纤程栈大小：256MB
pub const MAX_STACK_SIZE: usize = 256 * 1024 * 1024;

/// 每个线程缓存的空闲栈数量
pub const DEFAULT_STACK_POOL: usize = 8;

/// 覆盖默认栈大小的环境变量
pub const ENV_STACK_SIZE: &str = "SPINDLE_FIBER_STACK_SIZE";

/// 覆盖栈缓存数量的环境变量
pub const ENV_STACK_POOL: &str = "SPINDLE_FIBER_STACK_POOL";

/// 运行时配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// 新纤程的默认栈大小（字节）
    pub stack_size: usize,
    /// 每个线程缓存的空闲栈数量（0 表示不缓存）
    pub stack_pool_capacity: usize,
    /// 是否在栈底放置保护页
    pub guard_page: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            stack_pool_capacity: DEFAULT_STACK_POOL,
            guard_page: true,
        }
    }
}

impl RuntimeConfig {
    /// 从环境变量读取配置，未设置或无法解析的项使用默认值
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = read_env_usize(ENV_STACK_SIZE) {
            config.stack_size = size;
        }
        if let Some(pool) = read_env_usize(ENV_STACK_POOL) {
            config.stack_pool_capacity = pool;
        }

        config
    }

    /// 设置默认栈大小
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// 设置栈缓存数量
    pub fn with_stack_pool_capacity(mut self, capacity: usize) -> Self {
        self.stack_pool_capacity = capacity;
        self
    }

    /// 启用或禁用保护页
    pub fn with_guard_page(mut self, guard_page: bool) -> Self {
        self.guard_page = guard_page;
        self
    }

    /// 将栈大小限制在允许范围内
    pub fn clamp_stack_size(size: usize) -> usize {
        size.clamp(MIN_STACK_SIZE, MAX_STACK_SIZE)
    }
}

fn read_env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable runtime setting");
            None
        }
    }
}

/// 进程级默认配置（None 表示尚未读取）
static CONFIG: RwLock<Option<RuntimeConfig>> = RwLock::new(None);

/// 设置进程默认配置
///
/// 只影响之后才首次使用纤程的线程；已经初始化的线程保留原有快照。
pub fn configure(config: RuntimeConfig) {
    *CONFIG.write() = Some(config);
}

/// 获取当前进程默认配置
pub fn current_config() -> RuntimeConfig {
    if let Some(config) = CONFIG.read().as_ref() {
        return config.clone();
    }

    let mut slot = CONFIG.write();
    slot.get_or_insert_with(RuntimeConfig::from_env).clone()
}
