//! 环境代理的线程引用计数。
//
// 启用 `--cfg loom` 时切换到 Loom 的原子类型，使模型检查能穷举计数的调度交错。
#[cfg(not(any(loom, axis_loom)))]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(loom, axis_loom))]
use loom::sync::atomic::{AtomicUsize, Ordering};

/// 计数操作的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Release {
    /// 计数仍大于零。
    Alive(usize),
    /// 本次释放使计数归零，调用方负责执行一次销毁。
    LastReference,
}

/// 引用计数错误。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefCountError {
    /// 计数已归零，不能再获取。
    Released,
    /// 释放次数多于获取次数。
    Unpaired,
}

/// 归零即终结的引用计数：计数一旦到达零便不可复活。
///
/// # 教案式说明
/// - **契约（What）**：
///   - 恰有一次 `release` 返回 [`Release::LastReference`]，销毁动作因此只会被触发一次；
///   - 归零后的 `acquire` 返回 [`RefCountError::Released`]，`release` 返回 [`RefCountError::Unpaired`]；
/// - **执行逻辑（How）**：以 CAS 循环完成“检查后修改”，不持有任何锁。
#[derive(Debug)]
pub struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    pub fn new(initial: usize) -> Self {
        Self {
            count: AtomicUsize::new(initial),
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn acquire(&self) -> Result<usize, RefCountError> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(RefCountError::Released);
            }
            match self.count.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self) -> Result<Release, RefCountError> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(RefCountError::Unpaired);
            }
            match self.count.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if current == 1 => return Ok(Release::LastReference),
                Ok(_) => return Ok(Release::Alive(current - 1)),
                Err(actual) => current = actual,
            }
        }
    }
}
