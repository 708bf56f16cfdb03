//! 等待原语：一次性事件与倒计数。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// 可等待的一次性（或可复位的）信号。
///
/// - `set()` 之后所有等待方被唤醒，后续 `wait` 立即返回；
/// - `wait(None)` 无限等待，`wait(Some(t))` 超时返回 `false`。
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut signaled = self.signaled.lock();
        match timeout {
            None => {
                while !*signaled {
                    self.cond.wait(&mut signaled);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*signaled {
                    if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                        return *signaled;
                    }
                }
                true
            }
        }
    }
}

type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// 等待 N 个异步完成的倒计数，归零时恰好执行一次后续动作。
///
/// # 教案式说明
/// - **意图（Why）**：插件加载器、扩展创建这类“发起 N 个异步操作，全部完成后继续”的流程，
///   不应让发起线程阻塞等待；
/// - **契约（What）**：`count_down` 被调用恰好 N 次后执行 continuation；多余的调用返回 `false`
///   并被忽略；`new(0, ..)` 会立即执行 continuation。
pub struct Countdown {
    remaining: AtomicUsize,
    continuation: Mutex<Option<Continuation>>,
}

impl Countdown {
    pub fn new(count: usize, continuation: impl FnOnce() + Send + 'static) -> Arc<Self> {
        let countdown = Arc::new(Self {
            remaining: AtomicUsize::new(count),
            continuation: Mutex::new(Some(Box::new(continuation))),
        });
        if count == 0 {
            countdown.fire();
        }
        countdown
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// 计数减一；返回该次调用是否有效。
    pub fn count_down(&self) -> bool {
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 1 {
                        self.fire();
                    }
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn fire(&self) {
        let continuation = self.continuation.lock().take();
        if let Some(continuation) = continuation {
            continuation();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn event_wait_times_out_then_succeeds() {
        let event = Arc::new(Event::new());
        assert!(!event.wait(Some(Duration::from_millis(10))), "未触发时超时");

        let setter = Arc::clone(&event);
        let worker = thread::spawn(move || setter.set());
        assert!(event.wait(None));
        worker.join().expect("线程正常退出");
        assert!(event.wait(Some(Duration::ZERO)), "已触发事件立即返回");
    }

    #[test]
    fn countdown_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let countdown = Countdown::new(3, move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let countdown = Arc::clone(&countdown);
                thread::spawn(move || assert!(countdown.count_down()))
            })
            .collect();
        for worker in workers {
            worker.join().expect("线程正常退出");
        }
        assert!(!countdown.count_down(), "归零后的调用无效");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_countdown_fires_immediately() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let _countdown = Countdown::new(0, move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
