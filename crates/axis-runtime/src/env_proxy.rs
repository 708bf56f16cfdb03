//! # env_proxy：跨线程访问环境的唯一入口
//!
//! ## 定位与职责（Why）
//! - 扩展状态只在其扩展线程上修改；外部线程若要驱动扩展，必须经由代理把闭包投递回所有者线程，
//!   或先取得锁模式、在所有者线程停驻期间同步调用；
//! - 代理以线程引用计数表达“哪些外部线程仍在使用该环境”，计数归零前所有者的环境不会被回收。
//!
//! ## 契约（What）
//! - `create` 只能在所有者线程上调用；
//! - `release` 使计数归零时，销毁任务投递到所有者 runloop 队尾并恰好执行一次；
//! - 每个扩展线程同一时刻最多一个外部线程持有锁模式；同步通知只允许锁模式持有者发起。

use std::{
    fmt,
    sync::Arc,
    thread::{self, ThreadId},
};

use axis_core::{AxisError, Result};
use parking_lot::{Condvar, Mutex};

use crate::{
    env::Env,
    event::Event,
    refcount::{RefCount, RefCountError, Release},
};

/// 通知方式。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotifyMode {
    /// 投递到所有者 runloop 队尾。
    Async,
    /// 在调用方线程上立即执行，要求调用方持有锁模式。
    Sync,
}

#[derive(Debug, Default)]
struct SlotState {
    holder: Option<ThreadId>,
    in_lock_mode: bool,
}

/// 扩展线程级的锁模式槽位。
///
/// # 教案式说明
/// - **契约（What）**：`holder` 记录唯一的外部持有者；`in_lock_mode` 表示所有者线程正停驻在
///   锁模式任务中。两者同时成立时，持有者可以直接使用该线程上的环境；
/// - **执行逻辑（How）**：外部线程与停驻的所有者线程共用一个条件变量。持有者释放后，所有者在
///   同一临界区内观察到“无人持有”才退出停驻，新的竞争者若看到所有者仍停驻则无需再次投递。
#[derive(Debug, Default)]
pub(crate) struct LockSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl LockSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn is_held_by_current(&self) -> bool {
        let state = self.state.lock();
        state.in_lock_mode && state.holder == Some(thread::current().id())
    }

    pub(crate) fn holder(&self) -> Option<ThreadId> {
        self.state.lock().holder
    }

    /// 所有者线程上的停驻体：标记锁模式、唤醒请求方并等待释放。
    fn park_owner(&self, requester: &Event) {
        let mut state = self.state.lock();
        state.in_lock_mode = true;
        requester.set();
        while state.holder.is_some() {
            self.cond.wait(&mut state);
        }
        state.in_lock_mode = false;
    }
}

struct ProxyInner {
    env: Env,
    refs: RefCount,
    lock_mode_thread: Mutex<Option<ThreadId>>,
}

/// 环境代理，克隆共享同一个引用计数。
#[derive(Clone)]
pub struct EnvProxy {
    inner: Arc<ProxyInner>,
}

impl fmt::Debug for EnvProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvProxy")
            .field("env", &self.inner.env)
            .field("thread_cnt", &self.inner.refs.get())
            .finish()
    }
}

impl EnvProxy {
    /// 在所有者线程上为 `env` 创建代理，初始线程计数为 `initial_thread_cnt`。
    ///
    /// - **前置条件**：调用方为所有者线程；所有者为扩展、扩展组或 App；
    /// - **后置条件**：环境登记一个存活代理，直到该代理的销毁任务执行。
    pub fn create(env: &Env, initial_thread_cnt: usize) -> Result<EnvProxy> {
        if !env.in_owner_thread() {
            return Err(AxisError::generic(format!(
                "the env proxy of {} `{}` must be created in its owner thread",
                env.attach_to().as_str(),
                env.name()
            )));
        }
        env.proxy_created();
        tracing::debug!(
            owner = env.name(),
            attach_to = env.attach_to().as_str(),
            initial_thread_cnt,
            "env proxy created"
        );
        Ok(EnvProxy {
            inner: Arc::new(ProxyInner {
                env: env.clone(),
                refs: RefCount::new(initial_thread_cnt),
                lock_mode_thread: Mutex::new(None),
            }),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.inner.refs.get()
    }

    /// 新的外部线程开始使用代理。
    pub fn acquire(&self) -> Result<()> {
        self.inner.refs.acquire().map(|_| ()).map_err(|_| {
            AxisError::generic("the env proxy has already been released by every thread")
        })
    }

    /// 外部线程结束使用代理；最后一次释放投递销毁任务。
    pub fn release(&self) -> Result<()> {
        match self.inner.refs.release() {
            Err(RefCountError::Unpaired | RefCountError::Released) => Err(
                AxisError::invalid_argument("Unpaired calls of acquire and release"),
            ),
            Ok(Release::Alive(_)) => Ok(()),
            Ok(Release::LastReference) => {
                let env = self.inner.env.clone();
                let deleting = env.clone();
                if let Err(err) = env.post_owner(move || deleting.proxy_deleted()) {
                    tracing::warn!(
                        owner = env.name(),
                        %err,
                        "owner runloop unreachable, deleting env proxy inline"
                    );
                    env.proxy_deleted();
                }
                Ok(())
            }
        }
    }

    /// 把 `notify` 交给所有者执行。
    ///
    /// # 教案式说明
    /// - **执行逻辑（How）**：
    ///   1. 调用方即所有者线程：立即执行；
    ///   2. `Async`：投递到所有者 runloop 队尾；
    ///   3. `Sync`：仅扩展环境支持，调用方必须持有锁模式，随后在调用方线程上立即执行。
    pub fn notify(
        &self,
        notify: impl FnOnce(&Env) + Send + 'static,
        mode: NotifyMode,
    ) -> Result<()> {
        let env = &self.inner.env;
        if env.in_owner_thread() {
            notify(env);
            return Ok(());
        }
        match mode {
            NotifyMode::Async => {
                let target = env.clone();
                env.post_owner(move || notify(&target))
            }
            NotifyMode::Sync => {
                let Some(slot) = env.lock_slot() else {
                    return Err(AxisError::generic(format!(
                        "synchronous notify is only supported on extension envs, got {}",
                        env.attach_to().as_str()
                    )));
                };
                if !slot.is_held_by_current() {
                    return Err(AxisError::generic(
                        "Perform synchronous notify without acquiring lock_mode first",
                    ));
                }
                notify(env);
                Ok(())
            }
        }
    }

    /// 让所有者线程停驻，使调用方可以同步使用该扩展线程上的环境。
    ///
    /// # 教案式说明
    /// - **前置条件**：代理附着在扩展上；调用方不是所有者线程；
    /// - **执行逻辑（How）**：
    ///   1. 等待槽位空闲并登记为持有者；
    ///   2. 若所有者尚未停驻，向其 runloop 队首投递停驻任务并等待停驻完成；
    ///   3. 所有者停驻期间，持有者可调用同步通知与环境动作；
    /// - **后置条件**：返回 `Ok` 时所有者必定处于停驻状态。
    pub fn acquire_lock_mode(&self) -> Result<()> {
        let env = &self.inner.env;
        let (Some(slot), Some(thread)) = (env.lock_slot(), env.extension_thread()) else {
            return Err(AxisError::generic(format!(
                "lock mode is only supported on extension envs, got {}",
                env.attach_to().as_str()
            )));
        };
        if env.in_owner_thread() {
            return Err(AxisError::generic(
                "lock mode can not be acquired from the owner thread",
            ));
        }

        let me = thread::current().id();
        let need_park = {
            let mut state = slot.state.lock();
            while state.holder.is_some() {
                slot.cond.wait(&mut state);
            }
            state.holder = Some(me);
            !state.in_lock_mode
        };
        *self.inner.lock_mode_thread.lock() = Some(me);

        if need_park {
            let parked = Arc::new(Event::new());
            let signal = Arc::clone(&parked);
            let owner_slot = Arc::clone(slot);
            if let Err(err) = thread.post_front(move |_| owner_slot.park_owner(&signal)) {
                self.clear_holder(slot);
                return Err(AxisError::generic(format!(
                    "failed to suspend extension thread for lock mode: {err}"
                )));
            }
            parked.wait(None);
        }
        tracing::trace!(owner = env.name(), "lock mode acquired");
        Ok(())
    }

    /// 释放锁模式；只有持有者可以释放。
    pub fn release_lock_mode(&self) -> Result<()> {
        let env = &self.inner.env;
        let Some(slot) = env.lock_slot() else {
            return Err(AxisError::generic(format!(
                "lock mode is only supported on extension envs, got {}",
                env.attach_to().as_str()
            )));
        };
        let me = thread::current().id();
        if *self.inner.lock_mode_thread.lock() != Some(me) || slot.holder() != Some(me) {
            return Err(AxisError::generic(
                "lock mode is released by a thread that does not hold it",
            ));
        }
        self.clear_holder(slot);
        tracing::trace!(owner = env.name(), "lock mode released");
        Ok(())
    }

    fn clear_holder(&self, slot: &LockSlot) {
        *self.inner.lock_mode_thread.lock() = None;
        let mut state = slot.state.lock();
        state.holder = None;
        drop(state);
        slot.cond.notify_all();
    }
}
