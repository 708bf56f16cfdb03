//! # extension_thread：扩展组的执行线程
//!
//! ## 定位与职责（Why）
//! - 每个扩展组独占一个线程，组内全部扩展的回调都在这个线程上执行，扩展状态因此天然单线程；
//! - 线程负责：经由插件创建扩展、按阶段推进扩展生命周期、投递与回传消息、有序关闭。
//!
//! ## 契约（What）
//! - 线程状态只能前进：`Init → CreatingExtensions → Normal → PrepareToClose → Closed`；
//! - 进入 `Normal` 之前到达的消息按到达顺序暂存，进入 `Normal` 的同一任务内先全部投递，
//!   之后才处理新到达的消息；
//! - `PrepareToClose` 期间只接收命令结果；命令以错误结果回复，其余消息丢弃；
//! - 创建阶段任何一个扩展失败即记为启动失败：其余创建作废，之后到达的实例立即销毁。
//!
//! ## 执行逻辑（How）
//! - 引擎先为所有组启动线程并挂接到路由器、发布路由表，然后才投递 `start`，
//!   任何线程开始发送消息时其它线程都已可达；
//! - 关闭顺序：已启动的扩展 stop → deinit，组 `on_destroy_extensions`，经由插件销毁扩展实例，
//!   组 `on_deinit`，销毁组实例，停止 runloop 并通知引擎回收线程。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use axis_core::{
    AxisError, Direction, Loc, Message, MsgKind, Result, StatusCode, Value, msg::generate_cmd_id,
};
use parking_lot::Mutex;

use crate::{
    addon::{
        AddonHost, AddonInstance, AddonRegistry, AddonType, CreatedInstance, InstanceId,
        create_instance_async, destroy_instance_async,
    },
    engine::EngineCore,
    env::{Env, EnvOwner},
    env_proxy::LockSlot,
    event::Event,
    extension::Extension,
    extension_group::{DefaultExtensionGroup, ExtensionGroup},
    graph::{ExtensionPlan, GroupPlan, Router},
    path_table::{PathTable, ResultHandler, ResultRoute},
    runloop::{Runloop, RunloopHandle},
};

/// 扩展线程状态。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ThreadState {
    #[default]
    Init,
    CreatingExtensions,
    Normal,
    PrepareToClose,
    Closed,
}

impl ThreadState {
    pub const ALL: [ThreadState; 5] = [
        ThreadState::Init,
        ThreadState::CreatingExtensions,
        ThreadState::Normal,
        ThreadState::PrepareToClose,
        ThreadState::Closed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::Init => "init",
            ThreadState::CreatingExtensions => "creating_extensions",
            ThreadState::Normal => "normal",
            ThreadState::PrepareToClose => "prepare_to_close",
            ThreadState::Closed => "closed",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 被拒绝的状态迁移。
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("the extension thread can not move from `{from}` to `{to}`")]
pub struct TransitionError {
    pub from: ThreadState,
    pub to: ThreadState,
}

/// 只允许前进的状态机。
///
/// - 迁移目标必须严格晚于当前状态，允许跳过中间状态（例如创建失败时直接进入 `PrepareToClose`）；
/// - 被拒绝的迁移不改变状态。
#[derive(Clone, Debug, Default)]
pub struct ThreadStateMachine {
    state: ThreadState,
}

impl ThreadStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn can_transition(&self, to: ThreadState) -> bool {
        to > self.state
    }

    /// 迁移到 `to`，返回迁移前的状态。
    pub fn transition(&mut self, to: ThreadState) -> Result<ThreadState, TransitionError> {
        if !self.can_transition(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        let from = self.state;
        self.state = to;
        Ok(from)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ExtStage {
    Created,
    Configuring,
    Initializing,
    Starting,
    Started,
    Stopping,
    Deinitializing,
    Deinited,
}

struct ExtSlot {
    name: String,
    host: Arc<AddonHost>,
    id: InstanceId,
    instance: Option<Box<dyn Extension>>,
    env: Env,
    paths: PathTable,
    stage: ExtStage,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum GroupStage {
    Configuring,
    Initializing,
    CreatingExtensions,
    DestroyingExtensions,
    Deinitializing,
}

struct GroupSlot {
    group: Box<dyn ExtensionGroup>,
    env: Env,
    origin: Option<(Arc<AddonHost>, InstanceId)>,
    stage: GroupStage,
}

/// 扩展线程的所有者上下文，只在线程自身的 runloop 任务中被访问。
pub(crate) struct ExtThreadCore {
    plan: GroupPlan,
    state: ThreadStateMachine,
    registry: Arc<AddonRegistry>,
    router: Arc<Router>,
    engine: RunloopHandle<EngineCore>,
    runloop: RunloopHandle<ExtThreadCore>,
    lock: Arc<LockSlot>,
    group: Option<GroupSlot>,
    extensions: Vec<ExtSlot>,
    creations_settled: usize,
    /// 创建回调在插件返回失败时立即置位，尚未执行的创建任务据此跳过插件调用。
    creation_failed: Arc<AtomicBool>,
    pending_msgs: Vec<Message>,
    err_before_ready: Option<AxisError>,
    ready_reported: bool,
    close_deferred: bool,
    is_close_triggered: bool,
}

/// 已启动的扩展线程。
pub(crate) struct ExtThread {
    pub(crate) group: String,
    pub(crate) handle: RunloopHandle<ExtThreadCore>,
    pub(crate) join: JoinHandle<()>,
}

/// 启动扩展线程：runloop 在新线程上构建，调用方等待其句柄就绪后返回。
pub(crate) fn spawn(
    plan: GroupPlan,
    registry: Arc<AddonRegistry>,
    router: Arc<Router>,
    engine: RunloopHandle<EngineCore>,
) -> Result<ExtThread> {
    let group = plan.name.clone();
    let ready = Arc::new(Event::new());
    let handle_slot: Arc<Mutex<Option<RunloopHandle<ExtThreadCore>>>> = Arc::new(Mutex::new(None));

    let thread_ready = Arc::clone(&ready);
    let thread_slot = Arc::clone(&handle_slot);
    let thread_name = format!("axis-ext/{group}");
    let join = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let _span = tracing::debug_span!("extension_thread", group = %plan.name).entered();
            let runloop = Runloop::new(thread_name);
            *thread_slot.lock() = Some(runloop.handle());
            thread_ready.set();

            let mut core = ExtThreadCore::new(plan, registry, router, engine, runloop.handle());
            if let Err(err) = runloop.run(&mut core) {
                tracing::error!(%err, "extension thread runloop failed");
            }
            tracing::debug!(state = %core.state.state(), "extension thread exited");
        })
        .map_err(|err| {
            AxisError::generic(format!("failed to spawn the thread of group `{group}`: {err}"))
        })?;

    ready.wait(None);
    let handle = handle_slot.lock().take().ok_or_else(|| {
        AxisError::generic(format!("the runloop of group `{group}` was not published"))
    })?;
    Ok(ExtThread {
        group,
        handle,
        join,
    })
}

fn error_result(cmd: &Message, detail: impl Into<String>) -> Result<Message> {
    let mut result = Message::new_cmd_result(StatusCode::Error, cmd)?;
    result.set_detail(detail.into())?;
    Ok(result)
}

impl ExtThreadCore {
    fn new(
        plan: GroupPlan,
        registry: Arc<AddonRegistry>,
        router: Arc<Router>,
        engine: RunloopHandle<EngineCore>,
        runloop: RunloopHandle<ExtThreadCore>,
    ) -> Self {
        Self {
            plan,
            state: ThreadStateMachine::new(),
            registry,
            router,
            engine,
            runloop,
            lock: LockSlot::new(),
            group: None,
            extensions: Vec::new(),
            creations_settled: 0,
            creation_failed: Arc::new(AtomicBool::new(false)),
            pending_msgs: Vec::new(),
            err_before_ready: None,
            ready_reported: false,
            close_deferred: false,
            is_close_triggered: false,
        }
    }

    fn group_name(&self) -> &str {
        &self.plan.name
    }

    fn transition(&mut self, to: ThreadState) -> bool {
        match self.state.transition(to) {
            Ok(from) => {
                tracing::debug!(group = %self.plan.name, %from, %to, "extension thread state changed");
                true
            }
            Err(err) => {
                tracing::error!(group = %self.plan.name, %err, "refused extension thread transition");
                false
            }
        }
    }

    fn slot_index(&self, name: &str) -> Option<usize> {
        self.extensions.iter().position(|slot| slot.name == name)
    }

    fn record_failure(&mut self, err: AxisError) {
        tracing::error!(group = %self.plan.name, %err, "extension thread failed to start");
        if self.err_before_ready.is_none() {
            self.err_before_ready = Some(err);
        }
    }

    // ---- 启动 ----

    /// 开始创建扩展组与扩展。
    pub(crate) fn start(&mut self) {
        if !self.transition(ThreadState::CreatingExtensions) {
            return;
        }
        let Some(addon) = self.plan.addon.clone() else {
            self.on_group_created(Ok(None));
            return;
        };
        let runloop = self.runloop.clone();
        let name = self.plan.name.clone();
        create_instance_async(
            &self.registry,
            &self.runloop,
            AddonType::ExtensionGroup,
            &addon,
            &name,
            move |outcome| {
                let posted = runloop.post_tail(move |core| core.on_group_created(outcome.map(Some)));
                if let Err(err) = posted {
                    tracing::error!(%err, "extension thread stopped before its group was created");
                }
            },
        );
    }

    fn on_group_created(&mut self, outcome: Result<Option<CreatedInstance>>) {
        let (group, origin, schema): (Box<dyn ExtensionGroup>, _, _) = match outcome {
            Ok(None) => (
                Box::new(DefaultExtensionGroup),
                None,
                Arc::new(axis_core::SchemaStore::new()),
            ),
            Ok(Some(created)) => {
                let CreatedInstance { host, id, instance } = created;
                match instance {
                    AddonInstance::ExtensionGroup(group) => {
                        let schema = Arc::clone(host.schema());
                        (group, Some((host, id)), schema)
                    }
                    other => {
                        if let Err(err) = host.destroy_instance(id, other) {
                            tracing::error!(group = %self.plan.name, %err, "failed to destroy instance");
                        }
                        self.fail_start(AxisError::generic(format!(
                            "the addon of group `{}` is not an extension group",
                            self.plan.name
                        )));
                        return;
                    }
                }
            }
            Err(err) => {
                self.fail_start(err);
                return;
            }
        };

        let mut loc = Loc::new().with_group(self.plan.name.clone());
        loc.fill_scope(self.router.scope());
        let env = Env::new(
            EnvOwner::ExtensionGroup {
                thread: self.runloop.clone(),
            },
            loc,
            schema,
        );
        let property = self.plan.property.clone();
        let merged = env.merge_properties(property);
        self.group = Some(GroupSlot {
            group,
            env,
            origin,
            stage: GroupStage::Configuring,
        });
        if let Err(err) = merged {
            self.fail_start(err);
            return;
        }
        if let Some(slot) = self.group.as_mut() {
            slot.group.on_configure(&slot.env);
        }
    }

    pub(crate) fn on_group_configured(&mut self) {
        let Some(slot) = self.group.as_mut() else {
            return;
        };
        if slot.stage != GroupStage::Configuring {
            tracing::warn!(group = %self.plan.name, stage = ?slot.stage, "unexpected on_configure_done");
            return;
        }
        slot.stage = GroupStage::Initializing;
        slot.group.on_init(&slot.env);
    }

    pub(crate) fn on_group_inited(&mut self) {
        let Some(slot) = self.group.as_mut() else {
            return;
        };
        if slot.stage != GroupStage::Initializing {
            tracing::warn!(group = %self.plan.name, stage = ?slot.stage, "unexpected on_init_done");
            return;
        }
        slot.stage = GroupStage::CreatingExtensions;
        if self.plan.extensions.is_empty() {
            self.on_all_created();
            return;
        }
        slot.group.on_create_extensions(&slot.env, &self.plan.extensions);
    }

    /// 组请求创建一个扩展；每个扩展对应一个创建任务。
    pub(crate) fn create_extension(&mut self, plan: ExtensionPlan) {
        if self.state.state() != ThreadState::CreatingExtensions {
            tracing::warn!(
                group = %self.plan.name,
                extension = %plan.name,
                state = %self.state.state(),
                "create_extension outside the creation phase"
            );
            return;
        }
        if self.err_before_ready.is_some() || self.creation_failed.load(Ordering::Acquire) {
            tracing::debug!(extension = %plan.name, "creation aborted after an earlier failure");
            self.settle_creation();
            return;
        }
        let runloop = self.runloop.clone();
        let failed = Arc::clone(&self.creation_failed);
        let addon = plan.addon.clone();
        let name = plan.name.clone();
        create_instance_async(
            &self.registry,
            &self.runloop,
            AddonType::Extension,
            &addon,
            &name,
            move |outcome| {
                if outcome.is_err() {
                    failed.store(true, Ordering::Release);
                }
                let posted =
                    runloop.post_tail(move |core| core.on_extension_created(plan, outcome));
                if let Err(err) = posted {
                    tracing::error!(%err, "extension thread stopped during extension creation");
                }
            },
        );
    }

    fn on_extension_created(&mut self, plan: ExtensionPlan, outcome: Result<CreatedInstance>) {
        match outcome {
            Err(err) => self.record_failure(err),
            Ok(created) if self.err_before_ready.is_some() || self.is_close_triggered => {
                tracing::debug!(extension = %plan.name, "destroying an extension created after a failure");
                if let Err(err) = created.destroy() {
                    tracing::error!(extension = %plan.name, %err, "failed to destroy extension");
                }
            }
            Ok(created) => {
                let CreatedInstance { host, id, instance } = created;
                let instance = match instance {
                    AddonInstance::Extension(instance) => instance,
                    other => {
                        if let Err(err) = host.destroy_instance(id, other) {
                            tracing::error!(extension = %plan.name, %err, "failed to destroy instance");
                        }
                        self.record_failure(AxisError::generic(format!(
                            "the addon of `{}` is not an extension",
                            plan.name
                        )));
                        return self.settle_creation();
                    }
                };
                let env = Env::new(
                    EnvOwner::Extension {
                        thread: self.runloop.clone(),
                        lock: Arc::clone(&self.lock),
                    },
                    self.router.loc_of(&plan.group, &plan.name),
                    Arc::clone(host.schema()),
                );
                if let Err(err) = env.merge_properties(plan.property.clone()) {
                    if let Err(err) = host.destroy_instance(id, AddonInstance::Extension(instance)) {
                        tracing::error!(extension = %plan.name, %err, "failed to destroy extension");
                    }
                    self.record_failure(err);
                } else {
                    self.extensions.push(ExtSlot {
                        name: plan.name,
                        host,
                        id,
                        instance: Some(instance),
                        env,
                        paths: PathTable::default(),
                        stage: ExtStage::Created,
                    });
                }
            }
        }
        self.settle_creation();
    }

    fn settle_creation(&mut self) {
        self.creations_settled += 1;
        if self.creations_settled == self.plan.extensions.len() {
            self.on_all_created();
        }
    }

    fn on_all_created(&mut self) {
        if let Some(err) = self.err_before_ready.take() {
            self.fail_start(err);
            return;
        }
        tracing::debug!(
            group = %self.plan.name,
            extensions = self.extensions.len(),
            "all extensions created"
        );
        if self.extensions.is_empty() {
            self.become_normal();
            return;
        }
        for slot in &mut self.extensions {
            slot.stage = ExtStage::Configuring;
            if let Some(extension) = slot.instance.as_deref_mut() {
                extension.on_configure(&slot.env);
            }
        }
    }

    fn advance(&mut self, name: &str, expected: ExtStage, next: ExtStage) -> Option<usize> {
        let Some(index) = self.slot_index(name) else {
            tracing::warn!(group = %self.plan.name, extension = name, "lifecycle event for an unknown extension");
            return None;
        };
        let slot = &mut self.extensions[index];
        if slot.stage != expected {
            tracing::warn!(
                extension = name,
                stage = ?slot.stage,
                expected = ?expected,
                "lifecycle event out of order"
            );
            return None;
        }
        slot.stage = next;
        Some(index)
    }

    pub(crate) fn on_extension_configured(&mut self, name: &str) {
        if let Some(index) = self.advance(name, ExtStage::Configuring, ExtStage::Initializing) {
            let slot = &mut self.extensions[index];
            if let Some(extension) = slot.instance.as_deref_mut() {
                extension.on_init(&slot.env);
            }
        }
    }

    pub(crate) fn on_extension_inited(&mut self, name: &str) {
        if let Some(index) = self.advance(name, ExtStage::Initializing, ExtStage::Starting) {
            let slot = &mut self.extensions[index];
            if let Some(extension) = slot.instance.as_deref_mut() {
                extension.on_start(&slot.env);
            }
        }
    }

    pub(crate) fn on_extension_started(&mut self, name: &str) {
        if self.advance(name, ExtStage::Starting, ExtStage::Started).is_none() {
            return;
        }
        let all_started = self
            .extensions
            .iter()
            .all(|slot| slot.stage == ExtStage::Started);
        if all_started && self.state.state() == ThreadState::CreatingExtensions {
            self.become_normal();
        }
    }

    /// 进入 `Normal`：先在本任务内投递暂存消息，再向引擎报告就绪。
    fn become_normal(&mut self) {
        if !self.transition(ThreadState::Normal) {
            return;
        }
        let pending = std::mem::take(&mut self.pending_msgs);
        if !pending.is_empty() {
            tracing::debug!(group = %self.plan.name, count = pending.len(), "flushing pending messages");
        }
        for msg in pending {
            self.deliver_now(msg);
        }
        self.report_ready(Ok(()));
        if self.close_deferred {
            self.close_deferred = false;
            self.close();
        }
    }

    fn report_ready(&mut self, outcome: Result<()>) {
        if self.ready_reported {
            return;
        }
        self.ready_reported = true;
        let group = self.plan.name.clone();
        if let Err(err) = self
            .engine
            .post_tail(move |engine| engine.on_thread_ready(group, outcome))
        {
            tracing::warn!(group = %self.plan.name, %err, "engine unreachable while reporting readiness");
        }
    }

    fn fail_start(&mut self, err: AxisError) {
        tracing::error!(group = %self.plan.name, %err, "extension thread failed to start");
        self.report_ready(Err(err));
        self.is_close_triggered = true;
        self.begin_close();
    }

    // ---- 消息 ----

    /// 路由器投递的入口。
    pub(crate) fn deliver(&mut self, msg: Message) {
        match self.state.state() {
            ThreadState::Init | ThreadState::CreatingExtensions => self.pending_msgs.push(msg),
            ThreadState::Normal => self.deliver_now(msg),
            ThreadState::PrepareToClose | ThreadState::Closed => {
                if msg.type_to_handle_when_closing() {
                    self.deliver_now(msg);
                } else {
                    self.reject(msg, "the extension thread is closing");
                }
            }
        }
    }

    /// 拒收消息：命令以错误结果回复，其余消息丢弃。
    fn reject(&mut self, msg: Message, reason: &str) {
        if msg.kind() != MsgKind::Cmd {
            tracing::warn!(
                group = %self.plan.name,
                kind = msg.kind().as_str(),
                name = msg.name(),
                reason,
                "message dropped"
            );
            return;
        }
        match error_result(&msg, reason) {
            Ok(mut result) => {
                result.set_dest(msg.src().clone());
                self.route(result);
            }
            Err(err) => tracing::error!(%err, "failed to build an error result"),
        }
    }

    fn deliver_now(&mut self, mut msg: Message) {
        let target = msg
            .dest()
            .first()
            .and_then(|dest| dest.extension.clone())
            .unwrap_or_default();
        let Some(index) = self.slot_index(&target) else {
            let reason = format!("the extension `{target}` is not running");
            return self.reject(msg, &reason);
        };

        if msg.kind() == MsgKind::CmdResult {
            return self.handle_result(index, msg);
        }

        let slot = &mut self.extensions[index];
        if let Err(err) = msg.validate_schema(slot.env.schema(), Direction::In) {
            tracing::warn!(
                extension = %slot.name,
                kind = msg.kind().as_str(),
                name = msg.name(),
                %err,
                "incoming message rejected by schema"
            );
            let reason = err.message();
            return self.reject(msg, &reason);
        }

        let Some(extension) = slot.instance.as_deref_mut() else {
            return;
        };
        // 转发收到的消息时按连接重新寻址。
        msg.clear_dest();
        match msg.kind() {
            MsgKind::Cmd => {
                if let Some(cmd_id) = msg.cmd_id() {
                    slot.paths.add_in_path(cmd_id.to_owned(), msg.src().clone());
                }
                extension.on_cmd(&slot.env, msg);
            }
            MsgKind::Data => extension.on_data(&slot.env, msg),
            MsgKind::AudioFrame => extension.on_audio_frame(&slot.env, msg),
            MsgKind::VideoFrame => extension.on_video_frame(&slot.env, msg),
            MsgKind::CmdResult => {}
        }
    }

    fn handle_result(&mut self, index: usize, mut result: Message) {
        let slot = &mut self.extensions[index];
        if let Err(err) = result.validate_schema(slot.env.schema(), Direction::In) {
            tracing::warn!(extension = %slot.name, %err, "incoming cmd result rejected by schema");
            downgrade_result(&mut result, &err);
        }
        let cmd_id = result.cmd_id().unwrap_or_default().to_owned();
        match slot.paths.take_result_route(&mut result) {
            ResultRoute::Handle {
                mut handler,
                completed,
            } => {
                handler(&slot.env, result);
                if !completed {
                    slot.paths.restore_handler(&cmd_id, handler);
                }
            }
            ResultRoute::Forward { parent_cmd_id } => {
                let name = slot.name.clone();
                let completed = result.is_completed();
                if let Some(fields) = result.cmd_result_mut() {
                    fields.cmd_id = parent_cmd_id;
                    fields.is_final = completed;
                    fields.is_completed = false;
                }
                self.return_result(&name, result);
            }
            ResultRoute::Drop => {
                tracing::debug!(extension = %slot.name, cmd_id, "cmd result without a waiting path");
            }
        }
    }

    /// 发送入口：补齐源地址、登记出向路径并逐个目标投递。
    pub(crate) fn dispatch_outbound(
        &mut self,
        name: &str,
        msg: Message,
        handler: Option<ResultHandler>,
    ) {
        if let Err(err) = self.try_dispatch(name, msg, handler) {
            tracing::warn!(group = %self.plan.name, extension = name, %err, "failed to send message");
        }
    }

    fn try_dispatch(
        &mut self,
        name: &str,
        mut msg: Message,
        handler: Option<ResultHandler>,
    ) -> Result<()> {
        let index = self
            .slot_index(name)
            .ok_or_else(|| AxisError::generic(format!("the extension `{name}` is not running")))?;
        let own_loc = self.extensions[index].env.loc().clone();
        msg.set_src(own_loc.clone());

        let is_cmd = msg.kind() == MsgKind::Cmd;
        let mut parent_cmd_id = None;
        if is_cmd {
            let slot = &self.extensions[index];
            let old_id = msg.cmd_id().unwrap_or_default().to_owned();
            if handler.is_none() && slot.paths.has_in_path(&old_id) {
                parent_cmd_id = Some(old_id);
            }
            msg.set_cmd_id(generate_cmd_id())?;
        }

        let schema_check = msg.validate_schema(self.extensions[index].env.schema(), Direction::Out);
        let dests: Vec<Loc> = if !msg.dest().is_empty() {
            msg.dest().to_vec()
        } else {
            self.router.default_dests(name, msg.kind(), msg.name())
        };

        if !is_cmd {
            schema_check?;
            if dests.is_empty() {
                return Err(AxisError::generic(format!(
                    "no destination for {} `{}`",
                    msg.kind().as_str(),
                    msg.name()
                )));
            }
            for dest in &dests {
                if let Err(err) = self.post_to(dest, &msg) {
                    tracing::warn!(extension = name, dest = %dest, %err, "message undeliverable");
                }
            }
            return Ok(());
        }

        let cmd_id = msg.cmd_id().unwrap_or_default().to_owned();
        let failure = match (&schema_check, dests.is_empty()) {
            (Err(err), _) => Some(err.message()),
            (Ok(()), true) => Some(format!("no destination for cmd `{}`", msg.name())),
            (Ok(()), false) => None,
        };
        let fan_out = if failure.is_some() { 1 } else { dests.len() };
        self.extensions[index]
            .paths
            .add_out_path(cmd_id, handler, parent_cmd_id, fan_out);

        if let Some(reason) = failure {
            tracing::warn!(extension = name, cmd = msg.name(), reason, "cmd rejected before sending");
            return self.loop_back_error(&msg, own_loc, &reason);
        }
        for dest in &dests {
            if let Err(err) = self.post_to(dest, &msg) {
                tracing::warn!(extension = name, dest = %dest, %err, "cmd undeliverable");
                self.loop_back_error(&msg, own_loc.clone(), &err.message())?;
            }
        }
        Ok(())
    }

    fn post_to(&self, dest: &Loc, msg: &Message) -> Result<()> {
        let (loc, handle) = self.router.resolve(dest)?;
        let mut copy = msg.clone();
        copy.set_dest(loc);
        handle
            .post_tail(move |core| core.deliver(copy))
            .map_err(|err| AxisError::generic(format!("the destination `{dest}` is closed: {err}")))
    }

    /// 以错误结果回应自己发出的命令，结果经本线程队列到达，与正常结果走同一条路径。
    fn loop_back_error(&self, cmd: &Message, own_loc: Loc, reason: &str) -> Result<()> {
        let mut result = error_result(cmd, reason)?;
        result.set_dest(own_loc);
        self.runloop
            .post_tail(move |core| core.deliver(result))
            .map_err(|err| AxisError::generic(format!("failed to loop back an error result: {err}")))
    }

    /// 扩展回复命令：沿入向路径回传。
    pub(crate) fn return_result(&mut self, name: &str, mut result: Message) {
        let Some(index) = self.slot_index(name) else {
            tracing::warn!(extension = name, "result returned by an unknown extension");
            return;
        };
        let slot = &mut self.extensions[index];
        let cmd_id = result.cmd_id().unwrap_or_default().to_owned();
        let Some(src) = slot.paths.in_path_src(&cmd_id).cloned() else {
            tracing::warn!(extension = name, cmd_id, "no pending cmd for the returned result");
            return;
        };
        if let Err(err) = result.validate_schema(slot.env.schema(), Direction::Out) {
            tracing::warn!(extension = name, %err, "outgoing cmd result rejected by schema");
            downgrade_result(&mut result, &err);
        }
        if result.is_final() {
            slot.paths.remove_in_path(&cmd_id);
        }
        result.set_src(slot.env.loc().clone());
        result.set_dest(src);
        self.route(result);
    }

    fn route(&self, msg: Message) {
        let Some(dest) = msg.dest().first().cloned() else {
            return;
        };
        if let Err(err) = self.post_to(&dest, &msg) {
            tracing::warn!(
                group = %self.plan.name,
                kind = msg.kind().as_str(),
                dest = %dest,
                %err,
                "message undeliverable"
            );
        }
    }

    // ---- 关闭 ----

    /// 请求关闭；重复调用无效，创建阶段的请求推迟到创建完成。
    pub(crate) fn close(&mut self) {
        if self.is_close_triggered {
            return;
        }
        match self.state.state() {
            ThreadState::Init => {
                self.is_close_triggered = true;
                self.finish_close();
            }
            ThreadState::CreatingExtensions => {
                tracing::debug!(group = %self.plan.name, "close deferred until creation completes");
                self.close_deferred = true;
            }
            ThreadState::Normal => {
                self.is_close_triggered = true;
                self.begin_close();
            }
            ThreadState::PrepareToClose | ThreadState::Closed => {}
        }
    }

    fn begin_close(&mut self) {
        if !self.transition(ThreadState::PrepareToClose) {
            return;
        }
        for msg in std::mem::take(&mut self.pending_msgs) {
            self.reject(msg, "the extension thread is closing");
        }
        for slot in &mut self.extensions {
            match slot.stage {
                ExtStage::Started => {
                    slot.stage = ExtStage::Stopping;
                    if let Some(extension) = slot.instance.as_deref_mut() {
                        extension.on_stop(&slot.env);
                    }
                }
                ExtStage::Created => slot.stage = ExtStage::Deinited,
                _ => {}
            }
        }
        self.check_extensions_closed();
    }

    pub(crate) fn on_extension_stopped(&mut self, name: &str) {
        if let Some(index) = self.advance(name, ExtStage::Stopping, ExtStage::Deinitializing) {
            let slot = &mut self.extensions[index];
            if let Some(extension) = slot.instance.as_deref_mut() {
                extension.on_deinit(&slot.env);
            }
        }
    }

    pub(crate) fn on_extension_deinited(&mut self, name: &str) {
        if self
            .advance(name, ExtStage::Deinitializing, ExtStage::Deinited)
            .is_some()
        {
            self.check_extensions_closed();
        }
    }

    fn check_extensions_closed(&mut self) {
        if self.state.state() != ThreadState::PrepareToClose {
            return;
        }
        if !self
            .extensions
            .iter()
            .all(|slot| slot.stage == ExtStage::Deinited)
        {
            return;
        }
        match self.group.as_mut() {
            Some(slot) if slot.stage != GroupStage::DestroyingExtensions
                && slot.stage != GroupStage::Deinitializing =>
            {
                slot.stage = GroupStage::DestroyingExtensions;
                slot.group.on_destroy_extensions(&slot.env);
            }
            Some(_) => {}
            None => {
                self.destroy_extensions();
                self.finish_close();
            }
        }
    }

    pub(crate) fn on_extensions_destroy_requested(&mut self) {
        if !self
            .group
            .as_ref()
            .is_some_and(|slot| slot.stage == GroupStage::DestroyingExtensions)
        {
            tracing::warn!(group = %self.plan.name, "unexpected on_destroy_extensions_done");
            return;
        }
        self.destroy_extensions();
        if let Some(slot) = self.group.as_mut() {
            slot.stage = GroupStage::Deinitializing;
            slot.group.on_deinit(&slot.env);
        }
    }

    fn destroy_extensions(&mut self) {
        for slot in self.extensions.drain(..) {
            let ExtSlot {
                name,
                host,
                id,
                instance,
                paths,
                ..
            } = slot;
            if paths.pending_out() > 0 || paths.pending_in() > 0 {
                tracing::debug!(
                    extension = %name,
                    pending_out = paths.pending_out(),
                    pending_in = paths.pending_in(),
                    "extension destroyed with commands in flight"
                );
            }
            let Some(instance) = instance else {
                continue;
            };
            let created = CreatedInstance {
                host,
                id,
                instance: AddonInstance::Extension(instance),
            };
            destroy_instance_async(&self.runloop, created, move |outcome| {
                if let Err(err) = outcome {
                    tracing::error!(extension = %name, %err, "failed to destroy extension");
                }
            });
        }
    }

    pub(crate) fn on_group_deinited(&mut self) {
        let Some(slot) = self.group.take() else {
            return;
        };
        if let Some((host, id)) = slot.origin {
            if let Err(err) = host.destroy_instance(id, AddonInstance::ExtensionGroup(slot.group)) {
                tracing::error!(group = %self.plan.name, %err, "failed to destroy extension group");
            }
        }
        self.finish_close();
    }

    fn finish_close(&mut self) {
        if !self.transition(ThreadState::Closed) {
            return;
        }
        self.runloop.stop();
        self.router.detach_thread(self.group_name());
        let group = self.plan.name.clone();
        if let Err(err) = self
            .engine
            .post_tail(move |engine| engine.on_thread_closed(group))
        {
            tracing::warn!(group = %self.plan.name, %err, "engine unreachable while reporting close");
        }
    }
}

/// 把结果改写为错误结果，保留命令 ID 与 `is_final`。
fn downgrade_result(result: &mut Message, err: &AxisError) {
    if let Some(fields) = result.cmd_result_mut() {
        fields.status_code = StatusCode::Error;
    }
    if result.set_property("", Value::object()).is_err() || result.set_detail(err.message()).is_err() {
        tracing::error!(%err, "failed to rewrite a rejected cmd result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_only_moves_forward() {
        let mut machine = ThreadStateMachine::new();
        assert_eq!(machine.state(), ThreadState::Init);
        assert_eq!(
            machine.transition(ThreadState::CreatingExtensions),
            Ok(ThreadState::Init)
        );
        let err = machine
            .transition(ThreadState::Init)
            .expect_err("禁止回退");
        assert_eq!(err.from, ThreadState::CreatingExtensions);
        assert!(machine.transition(ThreadState::PrepareToClose).is_ok(), "允许跳过 Normal");
        assert!(machine.transition(ThreadState::PrepareToClose).is_err(), "禁止原地迁移");
        assert_eq!(machine.state(), ThreadState::PrepareToClose);
    }

    #[test]
    fn downgraded_result_keeps_identity() {
        let cmd = Message::new_cmd("ping").expect("构造命令");
        let mut result = Message::new_cmd_result(StatusCode::Ok, &cmd).expect("构造结果");
        result.set_property("payload", Value::from("x")).expect("写入属性");
        downgrade_result(&mut result, &AxisError::generic("bad payload"));
        assert_eq!(result.status_code(), Some(StatusCode::Error));
        assert_eq!(result.cmd_id(), cmd.cmd_id());
        assert!(!result.is_property_exist("payload"), "原属性被清除");
        assert_eq!(
            result.detail().and_then(Value::as_str),
            Some("bad payload")
        );
    }
}
