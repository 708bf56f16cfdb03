//! # axis-otel：运行时日志与追踪的一键安装层
//!
//! ## 定位与职责（Why）
//! - 运行时各组件只依赖 `tracing` 宏输出事件与 Span，不关心订阅方；
//! - 本 crate 负责在进程入口组装全局 Subscriber：`EnvFilter + fmt + OpenTelemetry`，
//!   让生命周期日志与跨线程的命令链路共用一套追踪上下文。
//!
//! ## 契约（What）
//! - [`install`] / [`install_with_directive`] 在进程内只生效一次，重复调用返回 [`Error::AlreadyInstalled`]；
//! - 过滤规则优先读取 `RUST_LOG`，否则使用调用方给出的指令（通常来自应用配置 `log.level`），
//!   两者皆缺省时为 `info`。

use std::{borrow::Cow, sync::OnceLock};

use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    trace::{self, TracerProvider},
};
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 缺省过滤指令。
pub const DEFAULT_DIRECTIVE: &str = "info";

/// 安装状态的全局缓存，确保安装仅执行一次。
static INSTALL_STATE: OnceLock<InstallState> = OnceLock::new();

/// 安装过程可能出现的错误。
///
/// # 教案式说明
/// - **意图（Why）**：归纳安装阶段的全部失败路径，启动流程可据此决定是否降级为无日志运行；
/// - **契约（What）**：所有错误都实现 [`std::error::Error`]，并保留底层错误信息。
#[derive(Debug)]
pub enum Error {
    /// `install` 被重复调用。
    AlreadyInstalled,
    /// 外部提前设置了全局 `tracing` Subscriber。
    SubscriberAlreadySet,
    /// 过滤指令无法解析。
    InvalidDirective(String),
    /// 设置全局 Subscriber 失败的底层错误。
    SetGlobalSubscriber(tracing::dispatcher::SetGlobalDefaultError),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::AlreadyInstalled => f.write_str("axis-otel 已完成安装，禁止重复调用 install"),
            Error::SubscriberAlreadySet => {
                f.write_str("全局 tracing Subscriber 已存在，axis-otel 无法覆盖")
            }
            Error::InvalidDirective(reason) => write!(f, "日志过滤指令非法: {reason}"),
            Error::SetGlobalSubscriber(err) => {
                write!(f, "设置 tracing 全局 Subscriber 失败: {err}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// 安装后的持久状态。
struct InstallState {
    // Provider 需与进程同寿命，导出与刷新都依赖它。
    #[allow(dead_code)]
    provider: TracerProvider,
    directive: String,
}

/// 以缺省指令安装。
pub fn install() -> Result<(), Error> {
    install_with_directive(DEFAULT_DIRECTIVE)
}

/// 以给定过滤指令安装全局 Subscriber。
///
/// # 教案式说明
/// - **执行逻辑（How）**：
///   1. 检查重复安装与外部已设置的 Subscriber；
///   2. 解析过滤指令，`RUST_LOG` 存在且合法时优先；
///   3. 构建 `TracerProvider` 并注册到 `opentelemetry::global`；
///   4. 组装 `EnvFilter + fmt + OpenTelemetry` 三层并设置为全局 Subscriber。
/// - **契约（What）**：指令非法时返回 [`Error::InvalidDirective`] 且不产生任何全局副作用。
pub fn install_with_directive(directive: &str) -> Result<(), Error> {
    if INSTALL_STATE.get().is_some() {
        return Err(Error::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(Error::SubscriberAlreadySet);
    }

    let filter = build_env_filter(directive)?;
    let provider = build_tracer_provider();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.versioned_tracer(
        "axis.runtime",
        Some(env!("CARGO_PKG_VERSION")),
        Some(Cow::Borrowed(env!("CARGO_PKG_NAME"))),
        None,
    );

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .with(tracing_opentelemetry::layer().with_tracer(tracer));
    tracing::subscriber::set_global_default(subscriber).map_err(Error::SetGlobalSubscriber)?;

    INSTALL_STATE
        .set(InstallState {
            provider,
            directive: directive.to_owned(),
        })
        .map_err(|_| Error::AlreadyInstalled)
}

/// 是否已完成安装。
pub fn is_installed() -> bool {
    INSTALL_STATE.get().is_some()
}

/// 安装时使用的过滤指令；未安装时返回 `None`。
pub fn installed_directive() -> Option<&'static str> {
    INSTALL_STATE.get().map(|state| state.directive.as_str())
}

/// 校验过滤指令是否可被 `EnvFilter` 接受。
pub fn validate_directive(directive: &str) -> Result<(), Error> {
    EnvFilter::try_new(directive)
        .map(|_| ())
        .map_err(|err| Error::InvalidDirective(err.to_string()))
}

fn build_env_filter(directive: &str) -> Result<EnvFilter, Error> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => {
            let directive = if directive.trim().is_empty() {
                DEFAULT_DIRECTIVE
            } else {
                directive
            };
            EnvFilter::try_new(directive).map_err(|err| Error::InvalidDirective(err.to_string()))
        }
    }
}

fn build_tracer_provider() -> TracerProvider {
    TracerProvider::builder()
        .with_config(
            trace::config()
                .with_sampler(trace::Sampler::AlwaysOn)
                .with_resource(Resource::default()),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_valid_directives() {
        for level in ["trace", "debug", "info", "warn", "error", "axis_runtime=debug"] {
            assert!(validate_directive(level).is_ok(), "{level} 应为合法指令");
        }
    }

    #[test]
    fn malformed_directive_is_rejected() {
        let err = validate_directive("axis_runtime=loudest").expect_err("未知级别");
        assert!(matches!(err, Error::InvalidDirective(_)));
        assert!(err.to_string().contains("日志过滤指令非法"));
    }
}
