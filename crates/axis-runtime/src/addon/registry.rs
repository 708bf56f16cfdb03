use std::{
    cell::Cell,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use axis_core::{AxisError, Result};
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;

use super::{Addon, AddonHost, AddonLoader, AddonType, InstanceId};

/// 已初始化并安装到注册表的加载器实例。
pub(crate) struct InstalledLoader {
    pub(crate) host: Arc<AddonHost>,
    pub(crate) id: InstanceId,
    pub(crate) loader: Box<dyn AddonLoader>,
}

type SharedLoader = Arc<Mutex<Option<Box<dyn AddonLoader>>>>;

/// 注册表内部持有的加载器槽位。
///
/// 查找时先在表锁内克隆槽位快照，再在表锁外逐个调用加载器；`take_loaders` 取走实例后槽位
/// 变为空，仍持有快照的查找会跳过它。
struct LoaderSlot {
    host: Arc<AddonHost>,
    id: InstanceId,
    loader: SharedLoader,
}

thread_local! {
    /// 当前线程是否正在执行某个加载器的 `load_addon`。
    static IN_LOADER: Cell<bool> = const { Cell::new(false) };
}

/// 在 `load_addon` 期间标记当前线程，离开作用域时复位。
struct LoaderScope;

impl LoaderScope {
    fn enter() -> LoaderScope {
        IN_LOADER.with(|flag| flag.set(true));
        LoaderScope
    }
}

impl Drop for LoaderScope {
    fn drop(&mut self) {
        IN_LOADER.with(|flag| flag.set(false));
    }
}

/// 插件注册表。
///
/// # 教案式说明
/// - **意图（Why）**：插件在进程启动阶段注册，在任意扩展线程上被查找；查找远多于写入，
///   因此每种类型使用一张 `DashMap`，读取不阻塞其它线程；
/// - **契约（What）**：
///   - 同一类型下名称唯一，重复注册返回 `Generic`；
///   - [`AddonRegistry::global`] 为惰性初始化的进程级单例，[`AddonRegistry::new`] 构造私有实例；
///   - `shutdown` 清空全部插件与加载器，此后注册一律失败。
pub struct AddonRegistry {
    extensions: DashMap<String, Arc<AddonHost>>,
    extension_groups: DashMap<String, Arc<AddonHost>>,
    addon_loaders: DashMap<String, Arc<AddonHost>>,
    installed_loaders: Mutex<Vec<LoaderSlot>>,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for AddonRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonRegistry")
            .field("extensions", &self.extensions.len())
            .field("extension_groups", &self.extension_groups.len())
            .field("addon_loaders", &self.addon_loaders.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<AddonRegistry>> = OnceLock::new();

impl AddonRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            extensions: DashMap::new(),
            extension_groups: DashMap::new(),
            addon_loaders: DashMap::new(),
            installed_loaders: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// 进程级注册表，首次访问时创建。
    pub fn global() -> &'static Arc<AddonRegistry> {
        GLOBAL.get_or_init(AddonRegistry::new)
    }

    fn store(&self, addon_type: AddonType) -> &DashMap<String, Arc<AddonHost>> {
        match addon_type {
            AddonType::Extension => &self.extensions,
            AddonType::ExtensionGroup => &self.extension_groups,
            AddonType::AddonLoader => &self.addon_loaders,
        }
    }

    pub fn register(
        &self,
        addon_type: AddonType,
        name: impl Into<String>,
        addon: impl Addon + 'static,
    ) -> Result<Arc<AddonHost>> {
        self.register_arc(addon_type, name, Arc::new(addon))
    }

    pub fn register_arc(
        &self,
        addon_type: AddonType,
        name: impl Into<String>,
        addon: Arc<dyn Addon>,
    ) -> Result<Arc<AddonHost>> {
        let name = name.into();
        if self.is_shutdown() {
            return Err(AxisError::generic(format!(
                "can not register {addon_type} addon `{name}` after the registry shut down"
            )));
        }
        match self.store(addon_type).entry(name.clone()) {
            Entry::Occupied(_) => Err(AxisError::generic(format!(
                "{addon_type} addon `{name}` is already registered"
            ))),
            Entry::Vacant(slot) => {
                let host = Arc::new(AddonHost::new(addon_type, name.clone(), addon)?);
                slot.insert(Arc::clone(&host));
                tracing::debug!(addon = %name, addon_type = %addon_type, "addon registered");
                Ok(host)
            }
        }
    }

    pub fn unregister(&self, addon_type: AddonType, name: &str) -> Option<Arc<AddonHost>> {
        self.store(addon_type).remove(name).map(|(_, host)| host)
    }

    pub fn find(&self, addon_type: AddonType, name: &str) -> Option<Arc<AddonHost>> {
        self.store(addon_type)
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 查找插件；未命中时依次询问已安装的加载器。
    ///
    /// 加载器在表锁之外被调用，因此可以在 `load_addon` 中注册插件或查询注册表；
    /// 加载器内部发起的嵌套查找只查已注册的插件，不再询问加载器。
    pub fn find_or_load(&self, addon_type: AddonType, name: &str) -> Option<Arc<AddonHost>> {
        if let Some(host) = self.find(addon_type, name) {
            return Some(host);
        }
        if IN_LOADER.with(Cell::get) {
            tracing::debug!(addon = name, addon_type = %addon_type, "nested lookup skips addon loaders");
            return None;
        }
        let snapshot: Vec<(Arc<AddonHost>, SharedLoader)> = self
            .installed_loaders
            .lock()
            .iter()
            .map(|slot| (Arc::clone(&slot.host), Arc::clone(&slot.loader)))
            .collect();
        for (host, loader) in snapshot {
            let mut guard = loader.lock();
            let Some(loader) = guard.as_mut() else {
                continue;
            };
            let outcome = {
                let _scope = LoaderScope::enter();
                loader.load_addon(self, addon_type, name)
            };
            match outcome {
                Ok(true) => {
                    tracing::debug!(
                        loader = host.name(),
                        addon = name,
                        addon_type = %addon_type,
                        "addon loaded on demand"
                    );
                    return self.find(addon_type, name);
                }
                Ok(false) => {}
                Err(err) => tracing::warn!(
                    loader = host.name(),
                    addon = name,
                    %err,
                    "addon loader failed"
                ),
            }
        }
        None
    }

    /// 已注册的插件名称（按字典序）。
    pub fn names(&self, addon_type: AddonType) -> Vec<String> {
        let mut names: Vec<String> = self
            .store(addon_type)
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn install_loader(&self, installed: InstalledLoader) {
        let InstalledLoader { host, id, loader } = installed;
        self.installed_loaders.lock().push(LoaderSlot {
            host,
            id,
            loader: Arc::new(Mutex::new(Some(loader))),
        });
    }

    /// 取走全部已安装的加载器；正在执行的 `load_addon` 完成后其实例才会被取走。
    pub(crate) fn take_loaders(&self) -> Vec<InstalledLoader> {
        let slots = std::mem::take(&mut *self.installed_loaders.lock());
        slots
            .into_iter()
            .filter_map(|slot| {
                let loader = slot.loader.lock().take()?;
                Some(InstalledLoader {
                    host: slot.host,
                    id: slot.id,
                    loader,
                })
            })
            .collect()
    }

    pub fn installed_loader_count(&self) -> usize {
        self.installed_loaders.lock().len()
    }

    /// 注销全部插件；之后的注册一律失败。
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for loader in self.take_loaders() {
            let InstalledLoader {
                host,
                id,
                mut loader,
            } = loader;
            loader.on_deinit();
            if let Err(err) =
                host.destroy_instance(id, super::AddonInstance::AddonLoader(loader))
            {
                tracing::error!(loader = host.name(), %err, "failed to destroy addon loader");
            }
        }
        self.extensions.clear();
        self.extension_groups.clear();
        self.addon_loaders.clear();
        tracing::debug!("addon registry shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
