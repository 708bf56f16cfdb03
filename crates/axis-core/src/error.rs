//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为运行时所有层次提供唯一的错误分类：契约违例、内容错误（Schema/属性/路由）、JSON 解析失败与图配置冲突；
//! - 叶子操作（Schema 校验、代理通知、Addon 创建）全部以 `Result` 返回，调用方据此决定是回报
//!   `CmdResult` 还是终止流程。
//!
//! ## 设计要求（What）
//! - 每个变体暴露稳定错误码（`axis.*`），日志与 `CmdResult.detail` 可直接引用；
//! - `Generic` 可携带结构化路径，Schema 错误据此渲染为 `path: reason`。

use std::fmt;

use thiserror::Error;

use crate::schema::SchemaError;

/// 错误码常量集合。
///
/// - **契约 (What)**：码值遵循 `<域>.<语义>` 约定，一经发布不再修改；
/// - **用途 (How)**：日志字段、`CmdResult` 的 `detail` 前缀以及测试断言。
pub mod codes {
    pub const INVALID_ARGUMENT: &str = "axis.invalid_argument";
    pub const GENERIC: &str = "axis.generic";
    pub const INVALID_JSON: &str = "axis.invalid_json";
    pub const INVALID_GRAPH: &str = "axis.invalid_graph";
}

/// 运行时统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“调用方用错了 API”与“内容不合法”区分开。前者在调试构建中伴随断言，
///   后者永远可恢复并回报给调用方；
/// - **契约 (What)**：
///   - `InvalidArgument`：契约违例，例如未配对的 acquire/release、解锁未锁定的缓冲；
///   - `Generic`：Schema、属性、路由失败；`path` 为 Schema 结构化路径（可能为空）；
///   - `InvalidJson`：外部文档无法解析；
///   - `InvalidGraph`：两份配置对同一节点给出不同 Addon 身份等图级冲突；
/// - **设计权衡 (Trade-offs)**：消息以 `String` 保存，牺牲少量分配换取跨线程传递与日志友好。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum AxisError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{}", GenericDisplay { path: path.as_deref(), message })]
    Generic {
        path: Option<String>,
        message: String,
    },

    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}

impl AxisError {
    /// 构造不带路径的 `Generic` 错误。
    pub fn generic(message: impl Into<String>) -> Self {
        AxisError::Generic {
            path: None,
            message: message.into(),
        }
    }

    /// 构造 `InvalidArgument` 错误。
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        AxisError::InvalidArgument(message.into())
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            AxisError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            AxisError::Generic { .. } => codes::GENERIC,
            AxisError::InvalidJson(_) => codes::INVALID_JSON,
            AxisError::InvalidGraph(_) => codes::INVALID_GRAPH,
        }
    }

    /// 返回不带错误码前缀的描述文本。
    ///
    /// - **用途 (How)**：填入 `CmdResult` 的 `detail` 属性，使下游只看到面向人的原因。
    pub fn message(&self) -> String {
        match self {
            AxisError::InvalidArgument(message)
            | AxisError::InvalidJson(message)
            | AxisError::InvalidGraph(message) => message.clone(),
            AxisError::Generic { .. } => self.to_string(),
        }
    }

    /// Schema 错误所在的结构化路径。
    pub fn path(&self) -> Option<&str> {
        match self {
            AxisError::Generic { path, .. } => path.as_deref(),
            _ => None,
        }
    }
}

struct GenericDisplay<'a> {
    path: Option<&'a str>,
    message: &'a str,
}

impl fmt::Display for GenericDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path {
            Some(path) if !path.is_empty() => write!(f, "{path}: {}", self.message),
            _ => f.write_str(self.message),
        }
    }
}

impl From<SchemaError> for AxisError {
    fn from(value: SchemaError) -> Self {
        let SchemaError { path, reason } = value;
        AxisError::Generic {
            path: Some(path),
            message: reason,
        }
    }
}

impl From<serde_json::Error> for AxisError {
    fn from(value: serde_json::Error) -> Self {
        AxisError::InvalidJson(value.to_string())
    }
}

/// crate 内统一的结果别名。
pub type Result<T, E = AxisError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_error_renders_path_prefix() {
        let err = AxisError::from(SchemaError::new(".a", "boom"));
        assert_eq!(err.to_string(), ".a: boom");
        assert_eq!(err.code(), codes::GENERIC);
        assert_eq!(err.path(), Some(".a"));

        let root = AxisError::from(SchemaError::new("", "boom"));
        assert_eq!(root.to_string(), "boom", "根路径不应输出冒号前缀");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            AxisError::invalid_argument("x").code(),
            "axis.invalid_argument"
        );
        assert_eq!(AxisError::InvalidGraph("x".into()).message(), "x");
    }
}
