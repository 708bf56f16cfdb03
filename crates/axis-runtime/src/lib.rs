#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]

//! # axis-runtime
//!
//! ## 定位与职责（Why）
//! - 把独立开发的扩展组装成有向消息图，并在一组动态工作线程上执行：每个扩展组独占一个线程，
//!   扩展状态只在所属线程上被修改；
//! - 跨线程的调用一律表达为向所有者 runloop 投递任务，外部线程借助环境代理安全地触达扩展。
//!
//! ## 架构嵌入（Where）
//! - `runloop` / `event` / `refcount`：单线程任务队列、等待原语与代理引用计数；
//! - `env` / `env_proxy`：所有者的环境句柄，以及跨线程的通知与锁模式；
//! - `extension` / `extension_group` / `extension_thread`：行为接口与扩展线程状态机；
//! - `path_table`：命令结果的回传路径；
//! - `addon`：插件注册表、宿主与加载器；
//! - `graph` / `engine`：图配置、路由与单图协调者；
//! - `app` / `config`：进程级所有者及其配置。
//!
//! ## 设计权衡（Trade-offs）
//! - 路由表以 `ArcSwap` 快照发布，投递路径上只读不加锁；线程的加入与退出才写入。
//! - 日志订阅器不在本 crate 内安装，嵌入方按 `AppConfig::log` 调用 `axis-otel`。

pub mod addon;
pub mod app;
pub mod config;
pub mod engine;
pub mod env;
pub mod env_proxy;
pub mod event;
pub mod extension;
pub mod extension_group;
pub mod extension_thread;
pub mod graph;
pub mod path_table;
pub mod refcount;
pub mod runloop;

pub use addon::{
    Addon, AddonHost, AddonInstance, AddonLoader, AddonRegistry, AddonType, CreatedInstance,
    FnAddon, InstanceId, create_instance_async, destroy_instance_async,
};
pub use app::{App, AppBuilder, AppHandler, DefaultAppHandler};
pub use config::{AppConfig, LogConfig, PredefinedGraph};
pub use engine::Engine;
pub use env::{AttachTo, Env};
pub use env_proxy::{EnvProxy, NotifyMode};
pub use event::{Countdown, Event};
pub use extension::Extension;
pub use extension_group::{DefaultExtensionGroup, ExtensionGroup};
pub use extension_thread::{ThreadState, ThreadStateMachine, TransitionError};
pub use graph::{ConnectionConfig, GraphConfig, MsgFlow, NodeConfig, NodeKind};
pub use path_table::ResultHandler;
