//! # app：进程级所有者
//!
//! ## 定位与职责（Why）
//! - App 持有一个独立线程：启动时实例化全部插件加载器，依次完成 App 自身的 configure/init，
//!   随后自动启动预定义图；运行期间负责图的启动与停止，关闭时先关闭全部图再反初始化自身；
//! - 每张图由一个 [`Engine`] 驱动，App 只保留按图 ID 索引的句柄。
//!
//! ## 契约（What）
//! - 加载器创建通过倒计数汇合，最后一个完成后把后续启动步骤投递回 App 线程；
//!   单个加载器失败只记录错误，调试构建下触发断言；
//! - 图 ID 在 App 内唯一，重复启动同一 ID 返回错误结果；
//! - `close` 之后：全部图关闭 → `on_deinit` → 加载器反初始化并销毁 → App runloop 停止。
//!
//! ## 风险与注意（Trade-offs）
//! - App 的 `on_deinit_done` 同样会被存活的环境代理推迟，未释放的代理会使 `wait_closed` 超时。

use std::{
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
    time::Duration,
};

use axis_core::{AxisError, Loc, Message, Result, SchemaStore, StatusCode, Value};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::{
    addon::{
        AddonInstance, AddonRegistry, AddonType, CreatedInstance, InstalledLoader,
        create_instance_async,
    },
    config::{AppConfig, PredefinedGraph},
    engine::{Engine, LaunchParams, StartReply},
    env::{Env, EnvOwner},
    event::{Countdown, Event},
    extension::log_done,
    graph::GraphConfig,
    runloop::{Runloop, RunloopHandle},
};

/// App 自身的生命周期回调，运行在 App 线程上。
pub trait AppHandler: Send {
    fn on_configure(&mut self, env: &Env) {
        log_done(env, "on_configure", env.on_configure_done());
    }

    fn on_init(&mut self, env: &Env) {
        log_done(env, "on_init", env.on_init_done());
    }

    fn on_deinit(&mut self, env: &Env) {
        log_done(env, "on_deinit", env.on_deinit_done());
    }
}

/// 所有阶段都立即完成的 App 行为。
#[derive(Debug, Default)]
pub struct DefaultAppHandler;

impl AppHandler for DefaultAppHandler {}

struct AppShared {
    uri: String,
    handle: RunloopHandle<AppCore>,
    registry: Arc<AddonRegistry>,
    engines: DashMap<String, Engine>,
    ready: Event,
    closed: Event,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// App 句柄，克隆共享同一个 App。
#[derive(Clone)]
pub struct App {
    shared: Arc<AppShared>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("uri", &self.shared.uri)
            .field("graphs", &self.shared.engines.len())
            .field("closed", &self.shared.closed.is_set())
            .finish()
    }
}

/// [`App`] 的构建器。
pub struct AppBuilder {
    config: AppConfig,
    registry: Option<Arc<AddonRegistry>>,
    handler: Option<Box<dyn AppHandler>>,
}

impl AppBuilder {
    /// 使用私有注册表；未指定时使用 [`AddonRegistry::global`]。
    #[must_use]
    pub fn registry(mut self, registry: Arc<AddonRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: impl AppHandler + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// 启动 App 线程。
    ///
    /// # 教案式说明
    /// - **前置条件**：配置中的 `property` 必须是 JSON 对象；
    /// - **执行逻辑（How）**：在调用方线程上建好环境并合并属性，再启动 App 线程并投递启动任务；
    /// - **后置条件**：返回 `Ok` 时 App 线程已在运行，就绪与否以 [`App::wait_ready`] 为准。
    pub fn start(self) -> Result<App> {
        let AppBuilder {
            config,
            registry,
            handler,
        } = self;
        let registry = registry.unwrap_or_else(|| Arc::clone(AddonRegistry::global()));
        let handler = handler.unwrap_or_else(|| Box::new(DefaultAppHandler));

        let runloop = Runloop::new(format!("axis-app/{}", config.uri));
        let handle = runloop.handle();
        let env = Env::new(
            EnvOwner::App {
                app: handle.clone(),
            },
            Loc::new().with_app(config.uri.clone()),
            Arc::new(SchemaStore::new()),
        );
        if let Some(property) = &config.property {
            env.merge_properties(Value::from_json(property))?;
        }

        let shared = Arc::new(AppShared {
            uri: config.uri.clone(),
            handle: handle.clone(),
            registry: Arc::clone(&registry),
            engines: DashMap::new(),
            ready: Event::new(),
            closed: Event::new(),
            join: Mutex::new(None),
        });
        let mut core = AppCore {
            uri: config.uri.clone(),
            env,
            handler,
            registry,
            runloop: handle.clone(),
            shared: Arc::clone(&shared),
            predefined: config.predefined_graphs,
            closing: false,
            deiniting: false,
        };

        handle
            .post_tail(AppCore::boot)
            .map_err(|err| AxisError::generic(format!("failed to schedule app start: {err}")))?;
        let join = thread::Builder::new()
            .name(format!("axis-app/{}", config.uri))
            .spawn(move || {
                let _span = tracing::debug_span!("app", uri = %core.uri).entered();
                if let Err(err) = runloop.run(&mut core) {
                    tracing::error!(%err, "app runloop failed");
                }
            })
            .map_err(|err| AxisError::generic(format!("failed to spawn app thread: {err}")))?;
        *shared.join.lock() = Some(join);
        Ok(App { shared })
    }
}

impl App {
    pub fn builder(config: AppConfig) -> AppBuilder {
        AppBuilder {
            config,
            registry: None,
            handler: None,
        }
    }

    pub fn uri(&self) -> &str {
        &self.shared.uri
    }

    pub fn registry(&self) -> &Arc<AddonRegistry> {
        &self.shared.registry
    }

    /// 等待加载器与 App 初始化完成；超时返回 `false`。
    pub fn wait_ready(&self, timeout: Option<Duration>) -> bool {
        self.shared.ready.wait(timeout)
    }

    /// 在 App 线程上启动一张图，`reply` 收到启动结果。
    pub fn start_graph(
        &self,
        graph: GraphConfig,
        reply: impl FnOnce(Message) + Send + 'static,
    ) -> Result<()> {
        let reply: StartReply = Box::new(reply);
        self.shared
            .handle
            .post_tail(move |core| core.start_graph(graph, Some(reply)))
            .map_err(|err| AxisError::generic(format!("app `{}` is closed: {err}", self.uri())))
    }

    /// 启动一张图并等待启动结果。
    pub fn start_graph_blocking(
        &self,
        graph: GraphConfig,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let (tx, rx) = mpsc::channel();
        self.start_graph(graph, move |result| {
            if tx.send(result).is_err() {
                tracing::debug!("start_graph waiter is gone");
            }
        })?;
        let received = match timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|err| err.to_string()),
            None => rx.recv().map_err(|err| err.to_string()),
        };
        received.map_err(|err| {
            AxisError::generic(format!("no start result for the graph: {err}"))
        })
    }

    /// 请求关闭一张图。
    pub fn stop_graph(&self, graph_id: &str) -> Result<()> {
        let engine = self
            .graph(graph_id)
            .ok_or_else(|| AxisError::invalid_argument(format!("graph `{graph_id}` is not running")))?;
        engine.close();
        Ok(())
    }

    pub fn graph(&self, graph_id: &str) -> Option<Engine> {
        self.shared
            .engines
            .get(graph_id)
            .map(|entry| entry.value().clone())
    }

    /// 运行中的图 ID（按字典序）。
    pub fn graph_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .engines
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// 请求关闭 App；重复调用无副作用。
    pub fn close(&self) {
        if self.shared.handle.post_tail(AppCore::close).is_err() {
            tracing::debug!(uri = %self.shared.uri, "app already stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_set()
    }

    /// 等待关闭完成并回收 App 线程；超时返回 `false`。
    pub fn wait_closed(&self, timeout: Option<Duration>) -> bool {
        if !self.shared.closed.wait(timeout) {
            return false;
        }
        let join = self.shared.join.lock().take();
        if let Some(join) = join {
            if join.thread().id() != thread::current().id() && join.join().is_err() {
                tracing::error!(uri = %self.shared.uri, "app thread panicked");
            }
        }
        true
    }
}

/// App 线程上的状态。
pub(crate) struct AppCore {
    uri: String,
    env: Env,
    handler: Box<dyn AppHandler>,
    registry: Arc<AddonRegistry>,
    runloop: RunloopHandle<AppCore>,
    shared: Arc<AppShared>,
    predefined: Vec<PredefinedGraph>,
    closing: bool,
    deiniting: bool,
}

impl AppCore {
    /// 实例化全部已注册的插件加载器，全部完成后继续 configure。
    fn boot(&mut self) {
        let names = self.registry.names(AddonType::AddonLoader);
        tracing::debug!(uri = %self.uri, loaders = names.len(), "creating addon loaders");
        let handle = self.runloop.clone();
        let countdown = Countdown::new(names.len(), move || {
            if handle.post_tail(AppCore::on_loaders_ready).is_err() {
                tracing::error!("app stopped while addon loaders were created");
            }
        });
        for name in names {
            let registry = Arc::clone(&self.registry);
            let countdown = Arc::clone(&countdown);
            let loader_name = name.clone();
            create_instance_async(
                &self.registry,
                &self.runloop,
                AddonType::AddonLoader,
                &name,
                &name,
                move |outcome| {
                    if let Err(err) = install_loader(&registry, outcome) {
                        tracing::error!(loader = %loader_name, %err, "failed to create addon loader");
                        debug_assert!(false, "addon loader `{loader_name}` failed: {err}");
                    }
                    countdown.count_down();
                },
            );
        }
    }

    fn on_loaders_ready(&mut self) {
        tracing::debug!(
            uri = %self.uri,
            installed = self.registry.installed_loader_count(),
            "addon loaders ready"
        );
        let env = self.env.clone();
        self.handler.on_configure(&env);
    }

    pub(crate) fn on_configured(&mut self) {
        let env = self.env.clone();
        self.handler.on_init(&env);
    }

    /// 自动启动预定义图，之后才标记就绪：就绪时这些图已登记在 `engines` 中。
    pub(crate) fn on_inited(&mut self) {
        if !self.closing {
            let graphs: Vec<GraphConfig> = self
                .predefined
                .iter()
                .filter(|graph| graph.auto_start)
                .map(PredefinedGraph::to_graph)
                .collect();
            for graph in graphs {
                self.start_graph(graph, None);
            }
        }
        self.shared.ready.set();
        tracing::info!(uri = %self.uri, graphs = self.shared.engines.len(), "app ready");
    }

    fn start_graph(&mut self, graph: GraphConfig, reply: Option<StartReply>) {
        let reply = Arc::new(Mutex::new(reply));
        match self.launch(graph, Arc::clone(&reply)) {
            Ok(engine) => {
                self.shared
                    .engines
                    .insert(engine.graph_id().to_owned(), engine);
            }
            Err(err) => {
                tracing::warn!(uri = %self.uri, %err, "failed to start graph");
                let reply = reply.lock().take();
                match (reply, error_result(&err)) {
                    (Some(reply), Ok(result)) => reply(result),
                    (None, _) => {}
                    (Some(_), Err(build)) => {
                        tracing::error!(%build, "failed to build the start error result");
                    }
                }
            }
        }
    }

    fn launch(
        &mut self,
        graph: GraphConfig,
        reply: Arc<Mutex<Option<StartReply>>>,
    ) -> Result<Engine> {
        if self.closing {
            return Err(AxisError::generic(format!("app `{}` is closing", self.uri)));
        }
        if let Some(id) = &graph.graph_id {
            if self.shared.engines.contains_key(id) {
                return Err(AxisError::InvalidGraph(format!(
                    "graph `{id}` is already running"
                )));
            }
        }
        let handle = self.runloop.clone();
        let app = self.runloop.clone();
        Engine::launch(LaunchParams {
            app_uri: self.uri.clone(),
            graph,
            registry: Arc::clone(&self.registry),
            // 启动结果经 App 线程转交，此时引擎已登记在 `engines` 中。
            reply: Some(Box::new(move |result| {
                let delivered = app.post_tail(move |_| {
                    if let Some(reply) = reply.lock().take() {
                        reply(result);
                    }
                });
                if delivered.is_err() {
                    tracing::debug!("app stopped before the start result was delivered");
                }
            })),
            on_closed: Some(Box::new(move |graph_id| {
                if handle
                    .post_tail(move |core| core.on_graph_closed(graph_id))
                    .is_err()
                {
                    tracing::debug!("app stopped before the graph closed");
                }
            })),
        })
    }

    fn on_graph_closed(&mut self, graph_id: String) {
        if let Some((_, engine)) = self.shared.engines.remove(&graph_id) {
            engine.wait_closed(None);
        }
        tracing::debug!(uri = %self.uri, graph = %graph_id, "graph removed");
        if self.closing && self.shared.engines.is_empty() {
            self.begin_deinit();
        }
    }

    fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        let engines: Vec<Engine> = self
            .shared
            .engines
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tracing::debug!(uri = %self.uri, graphs = engines.len(), "closing app");
        if engines.is_empty() {
            self.begin_deinit();
            return;
        }
        for engine in engines {
            engine.close();
        }
    }

    fn begin_deinit(&mut self) {
        if self.deiniting {
            return;
        }
        self.deiniting = true;
        let env = self.env.clone();
        self.handler.on_deinit(&env);
    }

    pub(crate) fn on_deinited(&mut self) {
        for installed in self.registry.take_loaders() {
            let InstalledLoader {
                host,
                id,
                mut loader,
            } = installed;
            loader.on_deinit();
            if let Err(err) = host.destroy_instance(id, AddonInstance::AddonLoader(loader)) {
                tracing::error!(loader = host.name(), %err, "failed to destroy addon loader");
            }
        }
        self.runloop.stop();
        self.shared.closed.set();
        tracing::info!(uri = %self.uri, "app closed");
    }
}

fn install_loader(registry: &AddonRegistry, outcome: Result<CreatedInstance>) -> Result<()> {
    let CreatedInstance { host, id, instance } = outcome?;
    let mut loader = match instance {
        AddonInstance::AddonLoader(loader) => loader,
        other => {
            host.destroy_instance(id, other)?;
            return Err(AxisError::generic(format!(
                "addon `{}` did not produce an addon loader",
                host.name()
            )));
        }
    };
    if let Err(err) = loader.on_init(registry) {
        host.destroy_instance(id, AddonInstance::AddonLoader(loader))?;
        return Err(err);
    }
    registry.install_loader(InstalledLoader { host, id, loader });
    Ok(())
}

fn error_result(err: &AxisError) -> Result<Message> {
    let cmd = Message::new_cmd("start_graph")?;
    let mut result = Message::new_cmd_result(StatusCode::Error, &cmd)?;
    result.set_detail(err.message())?;
    Ok(result)
}
