//! App 配置：URI、日志级别、App 属性与预定义图。
//!
//! 配置可以写成 JSON 或 TOML，两种格式字段一致：
//!
//! ```toml
//! uri = "msgpack://127.0.0.1:8001/"
//!
//! [log]
//! level = "debug"
//!
//! [[predefined_graphs]]
//! name = "default"
//! auto_start = true
//! nodes = [{ type = "extension", name = "a", addon = "addon_a", extension_group = "g" }]
//! ```

use std::path::Path;

use axis_core::{AxisError, Result};
use serde::{Deserialize, Serialize};

use crate::graph::GraphConfig;

/// 未配置时的日志过滤指令。
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// 未配置时的 App URI。
pub const DEFAULT_APP_URI: &str = "localhost";

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_owned()
}

fn default_uri() -> String {
    DEFAULT_APP_URI.to_owned()
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` 指令，例如 `info` 或 `axis_runtime=debug`。
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// App 启动时可自动启动的图。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredefinedGraph {
    pub name: String,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(flatten)]
    pub graph: GraphConfig,
}

impl PredefinedGraph {
    /// 图 ID 未声明时以图名代替。
    pub fn to_graph(&self) -> GraphConfig {
        let mut graph = self.graph.clone();
        if graph.graph_id.is_none() {
            graph.graph_id = Some(self.name.clone());
        }
        graph
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<serde_json::Value>,
    #[serde(default)]
    pub predefined_graphs: Vec<PredefinedGraph>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            log: LogConfig::default(),
            property: None,
            predefined_graphs: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<AppConfig> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml_str(text: &str) -> Result<AppConfig> {
        toml::from_str(text).map_err(|err| AxisError::generic(format!("invalid app toml: {err}")))
    }

    /// 按扩展名选择格式：`.toml` 为 TOML，其余按 JSON 解析。
    pub fn load(path: impl AsRef<Path>) -> Result<AppConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| AxisError::Generic {
            path: Some(path.display().to_string()),
            message: format!("failed to read the app config: {err}"),
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            _ => Self::from_json_str(&text),
        }
    }

    #[must_use]
    pub fn with_graph(mut self, name: impl Into<String>, graph: GraphConfig) -> Self {
        self.predefined_graphs.push(PredefinedGraph {
            name: name.into(),
            auto_start: true,
            graph,
        });
        self
    }
}
