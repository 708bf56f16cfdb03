//! # engine：单张图的协调者
//!
//! ## 定位与职责（Why）
//! - 每张运行中的图对应一个引擎线程：它为每个扩展组启动线程、汇总就绪结果、回复启动命令，
//!   并在关闭时逐个回收线程；
//! - 引擎本身不处理业务消息，业务消息在扩展线程之间经由路由器直接投递。
//!
//! ## 契约（What）
//! - `launch` 在调用方线程上同步完成图校验、执行计划与 Schema 兼容性检查，任何一项失败都不会
//!   启动线程；
//! - 启动结果以命令结果回复：成功时 `detail` 为图 ID，失败时为首个错误的描述，失败的图随即关闭；
//! - 所有扩展线程都报告关闭并被 join 之后，引擎才停止自身 runloop 并触发关闭回调。

use std::{
    collections::HashMap,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use axis_core::{AxisError, Message, Result, StatusCode, msg::generate_cmd_id};
use parking_lot::Mutex;

use crate::{
    addon::AddonRegistry,
    event::Event,
    extension_thread::{self, ExtThread},
    graph::{GraphConfig, Router, RoutingTable},
    runloop::{Runloop, RunloopHandle},
};

/// 启动结果的接收方，在引擎线程（或启动失败时的调用方线程）上调用一次。
pub type StartReply = Box<dyn FnOnce(Message) + Send + 'static>;

type ClosedCallback = Box<dyn FnOnce(String) + Send + 'static>;

struct EngineShared {
    graph_id: String,
    handle: RunloopHandle<EngineCore>,
    ready: Event,
    ready_result: Mutex<Option<Result<()>>>,
    closed: Event,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// 引擎句柄，克隆共享同一张图。
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("graph_id", &self.shared.graph_id)
            .field("ready", &self.shared.ready.is_set())
            .field("closed", &self.shared.closed.is_set())
            .finish()
    }
}

pub(crate) struct LaunchParams {
    pub(crate) app_uri: String,
    pub(crate) graph: GraphConfig,
    pub(crate) registry: Arc<AddonRegistry>,
    pub(crate) reply: Option<StartReply>,
    pub(crate) on_closed: Option<ClosedCallback>,
}

impl Engine {
    /// 校验并启动一张图。
    ///
    /// # 教案式说明
    /// - **执行逻辑（How）**：
    ///   1. 校验结构、生成执行计划、检查连接两端的 Schema；
    ///   2. 启动引擎线程，再为每个组启动扩展线程；
    ///   3. 全部线程挂接到路由器并发布路由表之后，由引擎向各线程投递 `start`；
    /// - **后置条件**：返回 `Ok` 只代表线程已启动；图是否成功启动以回复或 [`Engine::wait_ready`] 为准。
    pub(crate) fn launch(params: LaunchParams) -> Result<Engine> {
        let LaunchParams {
            app_uri,
            graph,
            registry,
            reply,
            on_closed,
        } = params;

        graph.validate()?;
        let plan = graph.plan(&app_uri)?;
        graph.check_schemas(&app_uri, &registry)?;
        let graph_id = graph
            .graph_id
            .clone()
            .unwrap_or_else(|| format!("graph-{}", generate_cmd_id()));
        let start_cmd = Message::new_cmd("start_graph")?;

        let router = Router::new(&app_uri, &graph_id);
        let runloop = Runloop::new(format!("axis-engine/{graph_id}"));
        let handle = runloop.handle();
        let shared = Arc::new(EngineShared {
            graph_id: graph_id.clone(),
            handle: handle.clone(),
            ready: Event::new(),
            ready_result: Mutex::new(None),
            closed: Event::new(),
            join: Mutex::new(None),
        });

        let mut core = EngineCore {
            graph_id: graph_id.clone(),
            router: Arc::clone(&router),
            runloop: handle.clone(),
            threads: HashMap::new(),
            expected: 0,
            reported: 0,
            failures: Vec::new(),
            start_cmd,
            reply,
            shared: Arc::clone(&shared),
            on_closed,
            closing: false,
            started: false,
        };
        let join = thread::Builder::new()
            .name(format!("axis-engine/{graph_id}"))
            .spawn(move || {
                let _span = tracing::debug_span!("engine", graph = %core.graph_id).entered();
                if let Err(err) = runloop.run(&mut core) {
                    tracing::error!(%err, "engine runloop failed");
                }
            })
            .map_err(|err| AxisError::generic(format!("failed to spawn engine thread: {err}")))?;
        *shared.join.lock() = Some(join);

        let mut threads = Vec::with_capacity(plan.groups.len());
        let mut spawn_error = None;
        for group in &plan.groups {
            match extension_thread::spawn(
                group.clone(),
                Arc::clone(&registry),
                Arc::clone(&router),
                handle.clone(),
            ) {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    spawn_error = Some(err);
                    break;
                }
            }
        }
        for thread in &threads {
            router.attach_thread(&thread.group, thread.handle.clone());
        }
        router.publish(RoutingTable::build(&graph, &plan, &app_uri));
        tracing::info!(
            graph = %graph_id,
            groups = threads.len(),
            extensions = plan.extension_count(),
            "graph launched"
        );

        handle
            .post_tail(move |core| core.adopt(threads, spawn_error))
            .map_err(|err| AxisError::generic(format!("engine stopped during launch: {err}")))?;
        Ok(Engine { shared })
    }

    pub fn graph_id(&self) -> &str {
        &self.shared.graph_id
    }

    /// 等待图启动完成；超时返回 `Generic`。
    pub fn wait_ready(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.shared.ready.wait(timeout) {
            return Err(AxisError::generic(format!(
                "timed out waiting for graph `{}` to start",
                self.shared.graph_id
            )));
        }
        self.shared
            .ready_result
            .lock()
            .clone()
            .unwrap_or_else(|| Err(AxisError::generic("the graph start result is missing")))
    }

    /// 请求关闭图；已关闭的图直接返回。
    pub fn close(&self) {
        if self.shared.handle.post_tail(EngineCore::close).is_err() {
            tracing::debug!(graph = %self.shared.graph_id, "engine already stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_set()
    }

    /// 等待关闭完成并回收引擎线程；超时返回 `false`。
    pub fn wait_closed(&self, timeout: Option<Duration>) -> bool {
        if !self.shared.closed.wait(timeout) {
            return false;
        }
        let join = self.shared.join.lock().take();
        if let Some(join) = join {
            if join.thread().id() != thread::current().id() && join.join().is_err() {
                tracing::error!(graph = %self.shared.graph_id, "engine thread panicked");
            }
        }
        true
    }
}

/// 引擎线程上的协调状态。
pub(crate) struct EngineCore {
    graph_id: String,
    router: Arc<Router>,
    runloop: RunloopHandle<EngineCore>,
    threads: HashMap<String, ExtThread>,
    expected: usize,
    reported: usize,
    failures: Vec<AxisError>,
    start_cmd: Message,
    reply: Option<StartReply>,
    shared: Arc<EngineShared>,
    on_closed: Option<ClosedCallback>,
    closing: bool,
    started: bool,
}

impl EngineCore {
    fn adopt(&mut self, threads: Vec<ExtThread>, spawn_error: Option<AxisError>) {
        self.expected = threads.len();
        for thread in threads {
            self.threads.insert(thread.group.clone(), thread);
        }
        if let Some(err) = spawn_error {
            self.failures.push(err);
            self.finish_start();
            return;
        }
        if self.threads.is_empty() {
            self.finish_start();
            return;
        }
        for (group, thread) in &self.threads {
            if let Err(err) = thread.handle.post_tail(|core| core.start()) {
                tracing::error!(graph = %self.graph_id, group, %err, "failed to start extension thread");
            }
        }
    }

    pub(crate) fn on_thread_ready(&mut self, group: String, outcome: Result<()>) {
        self.reported += 1;
        match outcome {
            Ok(()) => tracing::debug!(graph = %self.graph_id, group, "extension thread ready"),
            Err(err) => {
                tracing::warn!(graph = %self.graph_id, group, %err, "extension thread failed to start");
                self.failures.push(err);
            }
        }
        if self.reported == self.expected {
            self.finish_start();
        }
    }

    fn finish_start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let outcome = match self.failures.first() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        };
        let reply = match &outcome {
            Ok(()) => Message::new_cmd_result(StatusCode::Ok, &self.start_cmd).and_then(|mut r| {
                r.set_detail(self.graph_id.clone())?;
                Ok(r)
            }),
            Err(err) => {
                Message::new_cmd_result(StatusCode::Error, &self.start_cmd).and_then(|mut r| {
                    r.set_detail(err.message())?;
                    Ok(r)
                })
            }
        };
        match reply {
            Ok(message) => {
                if let Some(reply) = self.reply.take() {
                    reply(message);
                }
            }
            Err(err) => tracing::error!(%err, "failed to build the start reply"),
        }

        let failed = outcome.is_err();
        *self.shared.ready_result.lock() = Some(outcome);
        self.shared.ready.set();
        if failed {
            tracing::warn!(graph = %self.graph_id, "graph failed to start, closing");
            self.close();
        } else {
            tracing::info!(graph = %self.graph_id, "graph started");
        }
    }

    pub(crate) fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        tracing::debug!(graph = %self.graph_id, threads = self.threads.len(), "closing graph");
        if self.threads.is_empty() {
            self.finish_close();
            return;
        }
        for (group, thread) in &self.threads {
            if thread.handle.post_tail(|core| core.close()).is_err() {
                tracing::debug!(graph = %self.graph_id, group, "extension thread already stopped");
            }
        }
    }

    pub(crate) fn on_thread_closed(&mut self, group: String) {
        let Some(thread) = self.threads.remove(&group) else {
            tracing::warn!(graph = %self.graph_id, group, "unknown extension thread closed");
            return;
        };
        self.router.detach_thread(&group);
        if thread.join.join().is_err() {
            tracing::error!(graph = %self.graph_id, group, "extension thread panicked");
        }
        tracing::debug!(graph = %self.graph_id, group, "extension thread joined");
        if self.closing && self.threads.is_empty() {
            self.finish_close();
        }
    }

    fn finish_close(&mut self) {
        if !self.started {
            self.failures
                .push(AxisError::generic("the graph was closed before it started"));
            self.finish_start();
        }
        self.runloop.stop();
        self.shared.closed.set();
        tracing::info!(graph = %self.graph_id, "graph closed");
        if let Some(on_closed) = self.on_closed.take() {
            on_closed(self.graph_id.clone());
        }
    }
}
