//! # runloop：单线程任务队列
//!
//! ## 定位与职责（Why）
//! - App、Engine 与每个扩展线程都由一个 runloop 驱动：跨所有者的交互一律以“投递任务”表达，
//!   所有者状态因此只在其自身线程上被修改，无需加锁；
//! - 任务以 `&mut C` 访问所有者上下文，`C` 由 `run` 的调用方持有。
//!
//! ## 契约（What）
//! - 队列按 FIFO 执行；`post_front` 插队到队首，仅用于锁模式这类必须抢先执行的任务；
//! - `stop()` 之后投递返回 [`RunloopError::Stopped`]，但停止前已入队的任务仍会被执行完毕；
//! - `is_current()` 判断调用方是否就是当前驱动该 runloop 的线程。

use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    thread::{self, ThreadId},
};

use parking_lot::{Condvar, Mutex};

/// 投递到 runloop 的任务。
pub type Task<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// runloop 操作错误。
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RunloopError {
    #[error("the runloop has been stopped")]
    Stopped,
    #[error("the runloop is already driven by another thread")]
    AlreadyRunning,
}

struct Queue<C> {
    tasks: VecDeque<Task<C>>,
    stopped: bool,
}

struct Shared<C> {
    name: String,
    queue: Mutex<Queue<C>>,
    wakeup: Condvar,
    owner: Mutex<Option<ThreadId>>,
}

/// 所有者侧的 runloop，负责在当前线程上驱动任务。
pub struct Runloop<C> {
    shared: Arc<Shared<C>>,
}

/// 可跨线程克隆的投递句柄。
pub struct RunloopHandle<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for RunloopHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> fmt::Debug for RunloopHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunloopHandle")
            .field("name", &self.shared.name)
            .finish()
    }
}

impl<C: 'static> Runloop<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                queue: Mutex::new(Queue {
                    tasks: VecDeque::new(),
                    stopped: false,
                }),
                wakeup: Condvar::new(),
                owner: Mutex::new(None),
            }),
        }
    }

    pub fn handle(&self) -> RunloopHandle<C> {
        RunloopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 在当前线程上驱动任务，直到 `stop()` 且队列排空。
    ///
    /// # 教案式说明
    /// - **执行逻辑（How）**：取任务时持锁，执行任务时释放锁，任务内部因此可以继续投递；
    /// - **后置条件**：返回时队列为空，`owner` 被清除。
    pub fn run(&self, ctx: &mut C) -> Result<(), RunloopError> {
        {
            let mut owner = self.shared.owner.lock();
            if owner.is_some() {
                return Err(RunloopError::AlreadyRunning);
            }
            *owner = Some(thread::current().id());
        }
        tracing::trace!(runloop = %self.shared.name, "runloop started");

        loop {
            let task = {
                let mut queue = self.shared.queue.lock();
                loop {
                    if let Some(task) = queue.tasks.pop_front() {
                        break Some(task);
                    }
                    if queue.stopped {
                        break None;
                    }
                    self.shared.wakeup.wait(&mut queue);
                }
            };
            match task {
                Some(task) => task(ctx),
                None => break,
            }
        }

        *self.shared.owner.lock() = None;
        tracing::trace!(runloop = %self.shared.name, "runloop exited");
        Ok(())
    }
}

impl<C: 'static> RunloopHandle<C> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 追加到队尾。
    pub fn post_tail(&self, task: impl FnOnce(&mut C) + Send + 'static) -> Result<(), RunloopError> {
        self.post(Box::new(task), false)
    }

    /// 插入到队首。
    pub fn post_front(
        &self,
        task: impl FnOnce(&mut C) + Send + 'static,
    ) -> Result<(), RunloopError> {
        self.post(Box::new(task), true)
    }

    fn post(&self, task: Task<C>, front: bool) -> Result<(), RunloopError> {
        let mut queue = self.shared.queue.lock();
        if queue.stopped {
            return Err(RunloopError::Stopped);
        }
        if front {
            queue.tasks.push_front(task);
        } else {
            queue.tasks.push_back(task);
        }
        drop(queue);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// 停止接收新任务；已入队任务仍会执行。
    pub fn stop(&self) {
        self.shared.queue.lock().stopped = true;
        self.shared.wakeup.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.queue.lock().stopped
    }

    /// 调用方是否为驱动线程。
    pub fn is_current(&self) -> bool {
        *self.shared.owner.lock() == Some(thread::current().id())
    }

    /// 当前排队任务数。
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }
}

/// 抹去上下文类型的投递能力，供插件宿主等与所有者类型无关的组件使用。
pub trait TaskPoster: Send + Sync {
    fn post(&self, task: Box<dyn FnOnce() + Send + 'static>) -> Result<(), RunloopError>;

    fn in_owner_thread(&self) -> bool;
}

impl<C: 'static> TaskPoster for RunloopHandle<C> {
    fn post(&self, task: Box<dyn FnOnce() + Send + 'static>) -> Result<(), RunloopError> {
        self.post_tail(move |_| task())
    }

    fn in_owner_thread(&self) -> bool {
        self.is_current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn tasks_run_in_fifo_order_and_front_jumps_queue() {
        let runloop = Runloop::<Vec<u32>>::new("fifo");
        let handle = runloop.handle();
        handle.post_tail(|v| v.push(1)).expect("投递成功");
        handle.post_tail(|v| v.push(2)).expect("投递成功");
        handle.post_front(|v| v.push(0)).expect("插队成功");
        let stopper = handle.clone();
        handle.post_tail(move |_| stopper.stop()).expect("投递成功");

        let mut seen = Vec::new();
        runloop.run(&mut seen).expect("首次驱动");
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn post_after_stop_fails_but_queued_tasks_drain() {
        let runloop = Runloop::<u32>::new("drain");
        let handle = runloop.handle();
        handle.post_tail(|n| *n += 1).expect("投递成功");
        handle.stop();
        assert_eq!(handle.post_tail(|n| *n += 10), Err(RunloopError::Stopped));

        let mut count = 0;
        runloop.run(&mut count).expect("驱动");
        assert_eq!(count, 1, "停止前入队的任务必须执行");
    }

    #[test]
    fn is_current_only_on_driving_thread() {
        let runloop = Runloop::<()>::new("owner");
        let handle = runloop.handle();
        let (tx, rx) = mpsc::channel();
        let inner = handle.clone();
        handle
            .post_tail(move |_| {
                tx.send(inner.is_current()).expect("发送结果");
                inner.stop();
            })
            .expect("投递成功");

        let worker = thread::spawn(move || runloop.run(&mut ()));
        assert!(rx.recv().expect("接收结果"), "任务内部位于驱动线程");
        assert!(!handle.is_current(), "测试线程不是驱动线程");
        worker.join().expect("线程正常退出").expect("驱动成功");
    }
}
