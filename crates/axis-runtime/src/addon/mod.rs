//! # addon：插件工厂与实例生命周期
//!
//! ## 定位与职责（Why）
//! - 扩展、扩展组与插件加载器都不由运行时直接构造，而是由按类型注册的插件工厂产出；
//! - 每个实例携带由宿主签发的身份，销毁时宿主据此确认实例确实出自自身，避免重复销毁或
//!   把实例交给错误的工厂。
//!
//! ## 架构嵌入（Where）
//! - `registry`：按 `(类型, 名称)` 存放 [`AddonHost`] 的注册表，含进程级单例；
//! - `loader`：插件加载器接口，注册表查找未命中时按需加载插件；
//! - 本模块：插件接口、宿主、以及在所属线程上执行创建/销毁的异步入口。
//!
//! ## 契约（What）
//! - [`create_instance_async`] 与 [`destroy_instance_async`] 的完成回调总是在调用方线程上执行；
//! - 销毁一个宿主未签发（或已销毁）的身份返回 `InvalidArgument`，并以 error 级别记录。

mod loader;
mod registry;

use std::{
    collections::HashSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use axis_core::{AxisError, Result, SchemaStore};
use parking_lot::Mutex;

use crate::{extension::Extension, extension_group::ExtensionGroup, runloop::TaskPoster};

pub use loader::AddonLoader;
pub use registry::AddonRegistry;

pub(crate) use registry::InstalledLoader;

/// 插件类型。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AddonType {
    Extension,
    ExtensionGroup,
    AddonLoader,
}

impl AddonType {
    pub fn as_str(self) -> &'static str {
        match self {
            AddonType::Extension => "extension",
            AddonType::ExtensionGroup => "extension_group",
            AddonType::AddonLoader => "addon_loader",
        }
    }
}

impl fmt::Display for AddonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 宿主签发的实例身份。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// 插件工厂产出的实例。
pub enum AddonInstance {
    Extension(Box<dyn Extension>),
    ExtensionGroup(Box<dyn ExtensionGroup>),
    AddonLoader(Box<dyn AddonLoader>),
}

impl AddonInstance {
    pub fn addon_type(&self) -> AddonType {
        match self {
            AddonInstance::Extension(_) => AddonType::Extension,
            AddonInstance::ExtensionGroup(_) => AddonType::ExtensionGroup,
            AddonInstance::AddonLoader(_) => AddonType::AddonLoader,
        }
    }
}

impl fmt::Debug for AddonInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AddonInstance")
            .field(&self.addon_type())
            .finish()
    }
}

/// 插件工厂。
///
/// # 教案式说明
/// - **契约（What）**：
///   - `schema` 返回实例共享的 Schema 声明（JSON），注册时解析，非法声明使注册失败；
///   - `on_create_instance` 必须返回与注册类型一致的实例；
///   - `on_destroy_instance` 收回实例，默认直接丢弃。
pub trait Addon: Send + Sync {
    fn schema(&self) -> Option<&str> {
        None
    }

    fn on_create_instance(&self, instance_name: &str) -> Result<AddonInstance>;

    fn on_destroy_instance(&self, instance: AddonInstance) {
        drop(instance);
    }
}

type Factory = Box<dyn Fn(&str) -> Result<AddonInstance> + Send + Sync>;

/// 以闭包实现的插件，便于嵌入方与测试直接注册。
pub struct FnAddon {
    schema: Option<String>,
    factory: Factory,
}

impl FnAddon {
    pub fn extension<E, F>(factory: F) -> Self
    where
        E: Extension + 'static,
        F: Fn(&str) -> E + Send + Sync + 'static,
    {
        Self {
            schema: None,
            factory: Box::new(move |name| Ok(AddonInstance::Extension(Box::new(factory(name))))),
        }
    }

    pub fn extension_group<G, F>(factory: F) -> Self
    where
        G: ExtensionGroup + 'static,
        F: Fn(&str) -> G + Send + Sync + 'static,
    {
        Self {
            schema: None,
            factory: Box::new(move |name| {
                Ok(AddonInstance::ExtensionGroup(Box::new(factory(name))))
            }),
        }
    }

    pub fn addon_loader<L, F>(factory: F) -> Self
    where
        L: AddonLoader + 'static,
        F: Fn(&str) -> Result<L> + Send + Sync + 'static,
    {
        Self {
            schema: None,
            factory: Box::new(move |name| {
                factory(name).map(|loader| AddonInstance::AddonLoader(Box::new(loader)))
            }),
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

impl Addon for FnAddon {
    fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    fn on_create_instance(&self, instance_name: &str) -> Result<AddonInstance> {
        (self.factory)(instance_name)
    }
}

/// 注册表中的一个插件及其签发记录。
pub struct AddonHost {
    name: String,
    addon_type: AddonType,
    addon: Arc<dyn Addon>,
    schema: Arc<SchemaStore>,
    live: Mutex<HashSet<InstanceId>>,
    next_id: AtomicU64,
}

impl fmt::Debug for AddonHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddonHost")
            .field("name", &self.name)
            .field("addon_type", &self.addon_type)
            .field("live", &self.live.lock().len())
            .finish()
    }
}

impl AddonHost {
    pub(crate) fn new(addon_type: AddonType, name: String, addon: Arc<dyn Addon>) -> Result<Self> {
        let schema = match addon.schema() {
            Some(text) => SchemaStore::from_json_str(text).map_err(|err| {
                AxisError::generic(format!(
                    "invalid schema of {addon_type} addon `{name}`: {err}"
                ))
            })?,
            None => SchemaStore::new(),
        };
        Ok(Self {
            name,
            addon_type,
            addon,
            schema: Arc::new(schema),
            live: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addon_type(&self) -> AddonType {
        self.addon_type
    }

    /// 该插件所有实例共享的 Schema。
    pub fn schema(&self) -> &Arc<SchemaStore> {
        &self.schema
    }

    /// 尚未销毁的实例数。
    pub fn live_instances(&self) -> usize {
        self.live.lock().len()
    }

    /// 同步调用工厂并签发身份。
    pub fn create_instance(&self, instance_name: &str) -> Result<(InstanceId, AddonInstance)> {
        let instance = self.addon.on_create_instance(instance_name)?;
        if instance.addon_type() != self.addon_type {
            let produced = instance.addon_type();
            self.addon.on_destroy_instance(instance);
            return Err(AxisError::generic(format!(
                "{} addon `{}` produced an instance of type {produced}",
                self.addon_type, self.name
            )));
        }
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.live.lock().insert(id);
        tracing::debug!(
            addon = %self.name,
            addon_type = %self.addon_type,
            instance = instance_name,
            id = id.0,
            "addon instance created"
        );
        Ok((id, instance))
    }

    /// 收回实例；身份必须由本宿主签发且尚未销毁。
    pub fn destroy_instance(&self, id: InstanceId, instance: AddonInstance) -> Result<()> {
        if !self.live.lock().remove(&id) {
            tracing::error!(
                addon = %self.name,
                addon_type = %self.addon_type,
                id = id.0,
                "destroying an instance this addon does not own"
            );
            return Err(AxisError::invalid_argument(format!(
                "instance {} is not owned by {} addon `{}`",
                id.0, self.addon_type, self.name
            )));
        }
        self.addon.on_destroy_instance(instance);
        tracing::debug!(addon = %self.name, id = id.0, "addon instance destroyed");
        Ok(())
    }
}

/// 一次成功创建的结果。
#[derive(Debug)]
pub struct CreatedInstance {
    pub host: Arc<AddonHost>,
    pub id: InstanceId,
    pub instance: AddonInstance,
}

impl CreatedInstance {
    pub fn destroy(self) -> Result<()> {
        self.host.destroy_instance(self.id, self.instance)
    }
}

type CreateDone = Box<dyn FnOnce(Result<CreatedInstance>) + Send + 'static>;

/// 在 `caller` 线程上通过插件创建实例。
///
/// # 教案式说明
/// - **执行逻辑（How）**：
///   1. 调用方已在所属线程：立即查找插件并调用工厂；
///   2. 否则把同一动作投递到 `caller` 的 runloop；
///   3. 插件未注册时先询问已安装的加载器，仍未找到则以 `Generic` 完成；
/// - **后置条件**：`done` 恰好执行一次，且在 `caller` 线程上执行（投递失败时除外，此时以错误
///   同步完成）。
pub fn create_instance_async(
    registry: &Arc<AddonRegistry>,
    caller: &dyn TaskPoster,
    addon_type: AddonType,
    addon_name: &str,
    instance_name: &str,
    done: impl FnOnce(Result<CreatedInstance>) + Send + 'static,
) {
    let registry = Arc::clone(registry);
    let addon_name = addon_name.to_owned();
    let instance_name = instance_name.to_owned();
    let done: CreateDone = Box::new(done);

    let create = move || {
        let outcome = registry
            .find_or_load(addon_type, &addon_name)
            .ok_or_else(|| {
                AxisError::generic(format!(
                    "Failed to find {addon_type} addon `{addon_name}` for `{instance_name}`"
                ))
            })
            .and_then(|host| {
                host.create_instance(&instance_name)
                    .map(|(id, instance)| CreatedInstance { host, id, instance })
            });
        done(outcome);
    };

    if caller.in_owner_thread() {
        create();
        return;
    }
    let pending = Arc::new(Mutex::new(Some(create)));
    let posted = Arc::clone(&pending);
    let task = Box::new(move || {
        if let Some(create) = posted.lock().take() {
            create();
        }
    });
    if let Err(err) = caller.post(task) {
        tracing::warn!(%err, "caller runloop unreachable, creating addon instance inline");
        if let Some(create) = pending.lock().take() {
            create();
        }
    }
}

/// 在 `caller` 线程上销毁实例，完成回调同样在该线程执行。
pub fn destroy_instance_async(
    caller: &dyn TaskPoster,
    created: CreatedInstance,
    done: impl FnOnce(Result<()>) + Send + 'static,
) {
    if caller.in_owner_thread() {
        done(created.destroy());
        return;
    }
    let pending = Arc::new(Mutex::new(Some((created, done))));
    let posted = Arc::clone(&pending);
    let task = Box::new(move || {
        if let Some((created, done)) = posted.lock().take() {
            done(created.destroy());
        }
    });
    if let Err(err) = caller.post(task) {
        tracing::warn!(%err, "caller runloop unreachable, destroying addon instance inline");
        if let Some((created, done)) = pending.lock().take() {
            done(created.destroy());
        }
    }
}
