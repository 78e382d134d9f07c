//! 纤程之间传递的值
//!
//! resume / transfer / yield 都携带一个动态类型的值，空值对应 nil

use std::any::Any;
use std::fmt;

/// 纤程间传递的值
#[derive(Default)]
pub struct Value(Option<Box<dyn Any>>);

impl Value {
    /// 空值
    #[inline]
    pub fn nil() -> Self {
        Value(None)
    }

    /// 包装任意值
    pub fn new<T: Any>(value: T) -> Self {
        Value(Some(Box::new(value)))
    }

    /// 是否为空值
    #[inline]
    pub fn is_nil(&self) -> bool {
        self.0.is_none()
    }

    /// 检查是否为指定类型
    pub fn is<T: Any>(&self) -> bool {
        self.0.as_ref().is_some_and(|v| v.is::<T>())
    }

    /// 按引用取出指定类型
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    /// 取出指定类型，类型不符时原样返回
    pub fn downcast<T: Any>(self) -> Result<T, Value> {
        match self.0 {
            Some(boxed) => boxed.downcast::<T>().map(|v| *v).map_err(|b| Value(Some(b))),
            None => Err(Value(None)),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => f.write_str("nil"),
            Some(_) => f.write_str("Value(..)"),
        }
    }
}
