//! 消息寻址元组。

use std::fmt;

use serde::{Deserialize, Serialize};

/// `{app_uri, graph_id, extension_group, extension}` 四元组，未设置的字段视为通配。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `app_uri` / `graph_id` 为空时由路由层以发送方所在的 App/Graph 补齐；
///   - `extension_group` 为空时按图中节点表查找扩展所属的组；
///   - `extension` 为空表示寻址到组本身（当前运行时不向组投递业务消息，路由层将其视为不可达）。
/// - **序列化 (How)**：与图配置中 `dest` 字段一致，键名为 `app`、`graph`、`extension_group`、`extension`。
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Loc {
    #[serde(rename = "app", default, skip_serializing_if = "Option::is_none")]
    pub app_uri: Option<String>,
    #[serde(rename = "graph", default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl Loc {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以扩展名构造地址，其余字段通配。
    pub fn extension(name: impl Into<String>) -> Self {
        Self {
            extension: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_app(mut self, app_uri: impl Into<String>) -> Self {
        self.app_uri = Some(app_uri.into());
        self
    }

    pub fn with_graph(mut self, graph_id: impl Into<String>) -> Self {
        self.graph_id = Some(graph_id.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.extension_group = Some(group.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// 所有字段均未设置。
    pub fn is_empty(&self) -> bool {
        self.app_uri.is_none()
            && self.graph_id.is_none()
            && self.extension_group.is_none()
            && self.extension.is_none()
    }

    /// 用 `scope` 中的值补齐未设置的 `app_uri` 与 `graph_id`。
    pub fn fill_scope(&mut self, scope: &Loc) {
        if self.app_uri.is_none() {
            self.app_uri.clone_from(&scope.app_uri);
        }
        if self.graph_id.is_none() {
            self.graph_id.clone_from(&scope.graph_id);
        }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |v: &Option<String>| v.clone().unwrap_or_else(|| "*".to_owned());
        write!(
            f,
            "{}/{}/{}/{}",
            part(&self.app_uri),
            part(&self.graph_id),
            part(&self.extension_group),
            part(&self.extension)
        )
    }
}
