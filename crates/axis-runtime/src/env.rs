//! # env：所有者的环境句柄
//!
//! ## 定位与职责（Why）
//! - 扩展、扩展组与 App 通过 [`Env`] 与运行时交互：完成生命周期阶段、收发消息、读写自身属性；
//! - `Env` 本身可以跨线程移动，但动作只能在所有者线程上调用，或由持有锁模式的外部线程调用；
//!   其他线程应当通过 [`EnvProxy`](crate::env_proxy::EnvProxy) 投递闭包。
//!
//! ## 契约（What）
//! - 生命周期与收发动作都以任务形式投递到所有者 runloop 的队尾，保持 FIFO；
//! - 属性读写同步完成，写入前按所有者声明的属性 Schema 先规整后校验；
//! - 仍有代理存活时，`on_deinit_done` 被推迟到最后一个代理销毁之后生效。

use std::{fmt, sync::Arc};

use axis_core::{AxisError, Loc, Message, MsgKind, Result, SchemaStore, Value};
use parking_lot::Mutex;

use crate::{
    app::AppCore,
    env_proxy::LockSlot,
    extension_thread::ExtThreadCore,
    graph::ExtensionPlan,
    path_table::ResultHandler,
    runloop::{RunloopError, RunloopHandle},
};

/// 环境所附着的所有者类型。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AttachTo {
    App,
    ExtensionGroup,
    Extension,
}

impl AttachTo {
    pub fn as_str(self) -> &'static str {
        match self {
            AttachTo::App => "app",
            AttachTo::ExtensionGroup => "extension_group",
            AttachTo::Extension => "extension",
        }
    }
}

pub(crate) enum EnvOwner {
    Extension {
        thread: RunloopHandle<ExtThreadCore>,
        lock: Arc<LockSlot>,
    },
    ExtensionGroup {
        thread: RunloopHandle<ExtThreadCore>,
    },
    App {
        app: RunloopHandle<AppCore>,
    },
}

#[derive(Default)]
struct ProxyBook {
    live: usize,
    deinit_deferred: bool,
}

struct EnvInner {
    owner: EnvOwner,
    loc: Loc,
    schema: Arc<SchemaStore>,
    properties: Mutex<Value>,
    proxies: Mutex<ProxyBook>,
}

/// 所有者的环境句柄，克隆共享同一份状态。
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("attach_to", &self.attach_to())
            .field("loc", &self.inner.loc)
            .finish()
    }
}

impl Env {
    pub(crate) fn new(owner: EnvOwner, loc: Loc, schema: Arc<SchemaStore>) -> Env {
        Env {
            inner: Arc::new(EnvInner {
                owner,
                loc,
                schema,
                properties: Mutex::new(Value::object()),
                proxies: Mutex::new(ProxyBook::default()),
            }),
        }
    }

    pub fn attach_to(&self) -> AttachTo {
        match self.inner.owner {
            EnvOwner::Extension { .. } => AttachTo::Extension,
            EnvOwner::ExtensionGroup { .. } => AttachTo::ExtensionGroup,
            EnvOwner::App { .. } => AttachTo::App,
        }
    }

    /// 所有者的完整地址。
    pub fn loc(&self) -> &Loc {
        &self.inner.loc
    }

    /// 所有者名称：扩展名、组名或 App URI。
    pub fn name(&self) -> &str {
        let loc = &self.inner.loc;
        match self.attach_to() {
            AttachTo::Extension => loc.extension.as_deref(),
            AttachTo::ExtensionGroup => loc.extension_group.as_deref(),
            AttachTo::App => loc.app_uri.as_deref(),
        }
        .unwrap_or_default()
    }

    pub fn schema(&self) -> &SchemaStore {
        &self.inner.schema
    }

    /// 调用方是否为所有者线程。
    pub fn in_owner_thread(&self) -> bool {
        match &self.inner.owner {
            EnvOwner::Extension { thread, .. } | EnvOwner::ExtensionGroup { thread } => {
                thread.is_current()
            }
            EnvOwner::App { app } => app.is_current(),
        }
    }

    pub(crate) fn lock_slot(&self) -> Option<&Arc<LockSlot>> {
        match &self.inner.owner {
            EnvOwner::Extension { lock, .. } => Some(lock),
            _ => None,
        }
    }

    pub(crate) fn extension_thread(&self) -> Option<&RunloopHandle<ExtThreadCore>> {
        match &self.inner.owner {
            EnvOwner::Extension { thread, .. } | EnvOwner::ExtensionGroup { thread } => {
                Some(thread)
            }
            EnvOwner::App { .. } => None,
        }
    }

    /// 所有者线程，或持有锁模式的外部线程，才可使用环境动作。
    fn ensure_accessible(&self) -> Result<()> {
        if self.in_owner_thread() {
            return Ok(());
        }
        if self.lock_slot().is_some_and(|slot| slot.is_held_by_current()) {
            return Ok(());
        }
        Err(AxisError::generic(format!(
            "the env of {} `{}` is accessed outside its owner thread without lock mode",
            self.attach_to().as_str(),
            self.name()
        )))
    }

    fn ensure_attached(&self, expected: AttachTo, action: &str) -> Result<()> {
        if self.attach_to() == expected {
            Ok(())
        } else {
            Err(AxisError::generic(format!(
                "`{action}` is not supported on the env of {} `{}`",
                self.attach_to().as_str(),
                self.name()
            )))
        }
    }

    /// 把任务投递到所有者 runloop 的队尾，不做线程检查。
    pub(crate) fn post_owner(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        let posted = match &self.inner.owner {
            EnvOwner::Extension { thread, .. } | EnvOwner::ExtensionGroup { thread } => {
                thread.post_tail(move |_| task())
            }
            EnvOwner::App { app } => app.post_tail(move |_| task()),
        };
        posted.map_err(|err| self.post_error(err))
    }

    fn post_thread(&self, task: impl FnOnce(&mut ExtThreadCore) + Send + 'static) -> Result<()> {
        match &self.inner.owner {
            EnvOwner::Extension { thread, .. } | EnvOwner::ExtensionGroup { thread } => {
                thread.post_tail(task).map_err(|err| self.post_error(err))
            }
            EnvOwner::App { .. } => Err(AxisError::generic("the app env has no extension thread")),
        }
    }

    fn post_app(&self, task: impl FnOnce(&mut AppCore) + Send + 'static) -> Result<()> {
        match &self.inner.owner {
            EnvOwner::App { app } => app.post_tail(task).map_err(|err| self.post_error(err)),
            _ => Err(AxisError::generic("the env is not attached to an app")),
        }
    }

    fn post_error(&self, err: RunloopError) -> AxisError {
        AxisError::generic(format!(
            "failed to reach the owner of {} `{}`: {err}",
            self.attach_to().as_str(),
            self.name()
        ))
    }

    // ---- 生命周期 ----

    pub fn on_configure_done(&self) -> Result<()> {
        self.ensure_accessible()?;
        match self.attach_to() {
            AttachTo::Extension => {
                let name = self.name().to_owned();
                self.post_thread(move |core| core.on_extension_configured(&name))
            }
            AttachTo::ExtensionGroup => self.post_thread(|core| core.on_group_configured()),
            AttachTo::App => self.post_app(|app| app.on_configured()),
        }
    }

    pub fn on_init_done(&self) -> Result<()> {
        self.ensure_accessible()?;
        match self.attach_to() {
            AttachTo::Extension => {
                let name = self.name().to_owned();
                self.post_thread(move |core| core.on_extension_inited(&name))
            }
            AttachTo::ExtensionGroup => self.post_thread(|core| core.on_group_inited()),
            AttachTo::App => self.post_app(|app| app.on_inited()),
        }
    }

    pub fn on_start_done(&self) -> Result<()> {
        self.ensure_accessible()?;
        self.ensure_attached(AttachTo::Extension, "on_start_done")?;
        let name = self.name().to_owned();
        self.post_thread(move |core| core.on_extension_started(&name))
    }

    pub fn on_stop_done(&self) -> Result<()> {
        self.ensure_accessible()?;
        self.ensure_attached(AttachTo::Extension, "on_stop_done")?;
        let name = self.name().to_owned();
        self.post_thread(move |core| core.on_extension_stopped(&name))
    }

    /// 完成反初始化；仍有代理存活时推迟到最后一个代理销毁。
    pub fn on_deinit_done(&self) -> Result<()> {
        self.ensure_accessible()?;
        {
            let mut book = self.inner.proxies.lock();
            if book.live > 0 {
                book.deinit_deferred = true;
                tracing::debug!(
                    owner = self.name(),
                    proxies = book.live,
                    "deinit deferred until every env proxy is released"
                );
                return Ok(());
            }
        }
        self.finish_deinit()
    }

    fn finish_deinit(&self) -> Result<()> {
        match self.attach_to() {
            AttachTo::Extension => {
                let name = self.name().to_owned();
                self.post_thread(move |core| core.on_extension_deinited(&name))
            }
            AttachTo::ExtensionGroup => self.post_thread(|core| core.on_group_deinited()),
            AttachTo::App => self.post_app(|app| app.on_deinited()),
        }
    }

    /// 扩展组请求通过插件创建一个扩展。
    pub fn create_extension(&self, plan: ExtensionPlan) -> Result<()> {
        self.ensure_accessible()?;
        self.ensure_attached(AttachTo::ExtensionGroup, "create_extension")?;
        self.post_thread(move |core| core.create_extension(plan))
    }

    pub fn on_destroy_extensions_done(&self) -> Result<()> {
        self.ensure_accessible()?;
        self.ensure_attached(AttachTo::ExtensionGroup, "on_destroy_extensions_done")?;
        self.post_thread(|core| core.on_extensions_destroy_requested())
    }

    // ---- 代理登记 ----

    pub(crate) fn proxy_created(&self) {
        self.inner.proxies.lock().live += 1;
    }

    /// 代理销毁任务在所有者线程上调用。
    pub(crate) fn proxy_deleted(&self) {
        let finish = {
            let mut book = self.inner.proxies.lock();
            book.live = book.live.saturating_sub(1);
            if book.live == 0 && book.deinit_deferred {
                book.deinit_deferred = false;
                true
            } else {
                false
            }
        };
        if finish {
            tracing::debug!(owner = self.name(), "last env proxy released, resuming deinit");
            if let Err(err) = self.finish_deinit() {
                tracing::error!(owner = self.name(), %err, "failed to resume deferred deinit");
            }
        }
    }

    pub fn proxy_count(&self) -> usize {
        self.inner.proxies.lock().live
    }

    // ---- 消息 ----

    /// 发送命令；`handler` 接收全部结果（包括非最终结果）。
    pub fn send_cmd(&self, cmd: Message, handler: Option<ResultHandler>) -> Result<()> {
        self.send(cmd, MsgKind::Cmd, handler)
    }

    pub fn send_data(&self, data: Message) -> Result<()> {
        self.send(data, MsgKind::Data, None)
    }

    pub fn send_audio_frame(&self, frame: Message) -> Result<()> {
        self.send(frame, MsgKind::AudioFrame, None)
    }

    pub fn send_video_frame(&self, frame: Message) -> Result<()> {
        self.send(frame, MsgKind::VideoFrame, None)
    }

    fn send(&self, msg: Message, expected: MsgKind, handler: Option<ResultHandler>) -> Result<()> {
        self.ensure_accessible()?;
        self.ensure_attached(AttachTo::Extension, "send")?;
        if msg.kind() != expected {
            return Err(AxisError::invalid_argument(format!(
                "expected a `{}` message, got `{}`",
                expected.as_str(),
                msg.kind().as_str()
            )));
        }
        if msg.has_locked_res() {
            return Err(AxisError::invalid_argument(format!(
                "`{}` still has locked buffers and can not be sent",
                msg.name()
            )));
        }
        let name = self.name().to_owned();
        self.post_thread(move |core| core.dispatch_outbound(&name, msg, handler))
    }

    /// 回复 `cmd`；结果沿命令到达的路径逆向返回。
    pub fn return_result(&self, mut result: Message, cmd: &Message) -> Result<()> {
        self.ensure_accessible()?;
        self.ensure_attached(AttachTo::Extension, "return_result")?;
        let cmd_id = cmd.cmd_id().ok_or_else(|| {
            AxisError::invalid_argument(format!(
                "a result can only answer a cmd, got `{}`",
                cmd.kind().as_str()
            ))
        })?;
        let fields = result.cmd_result_mut().ok_or_else(|| {
            AxisError::invalid_argument("return_result expects a cmd result message")
        })?;
        fields.cmd_id = cmd_id.to_owned();
        let name = self.name().to_owned();
        self.post_thread(move |core| core.return_result(&name, result))
    }

    // ---- 属性 ----

    pub fn get_property(&self, path: &str) -> Result<Value> {
        self.ensure_accessible()?;
        self.inner.properties.lock().peek(path).cloned()
    }

    pub fn is_property_exist(&self, path: &str) -> Result<bool> {
        self.ensure_accessible()?;
        Ok(!path.is_empty() && self.inner.properties.lock().peek(path).is_ok())
    }

    /// 写入属性；写入后的整棵属性树须满足属性 Schema，否则不产生任何修改。
    pub fn set_property(&self, path: &str, value: Value) -> Result<()> {
        self.ensure_accessible()?;
        let mut properties = self.inner.properties.lock();
        let mut candidate = properties.clone();
        candidate.set(path, value)?;
        self.inner.schema.adjust_properties(&mut candidate)?;
        self.inner.schema.validate_properties(&candidate)?;
        *properties = candidate;
        Ok(())
    }

    /// 以 JSON 对象合并初始化属性。
    pub fn init_property_from_json(&self, json: &str) -> Result<()> {
        self.ensure_accessible()?;
        self.merge_properties(Value::from_json_str(json)?)
    }

    pub(crate) fn merge_properties(&self, incoming: Value) -> Result<()> {
        let Value::Object(entries) = incoming else {
            return Err(AxisError::InvalidJson(
                "the property document should be an object".into(),
            ));
        };
        let mut properties = self.inner.properties.lock();
        let mut candidate = properties.clone();
        if let Some(target) = candidate.as_object_mut() {
            target.extend(entries);
        }
        self.inner
            .schema
            .adjust_properties(&mut candidate)
            .and_then(|()| self.inner.schema.validate_properties(&candidate))
            .map_err(|err| match err {
                AxisError::Generic { path, message } => AxisError::Generic {
                    path,
                    message: format!("invalid property of `{}`: {message}", self.name()),
                },
                other => other,
            })?;
        *properties = candidate;
        Ok(())
    }
}
