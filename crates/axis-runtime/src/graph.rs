//! # graph：图配置、执行计划与进程内路由
//!
//! ## 定位与职责（Why）
//! - 图配置声明节点（扩展与扩展组）与连接（某扩展发出的某类消息默认送往哪些目标）；
//! - 引擎启动前把配置校验并展开为按组划分的执行计划，启动后由 [`Router`] 负责把地址解析到
//!   目标扩展线程。
//!
//! ## 契约（What）
//! - 校验失败一律返回 `InvalidGraph`：同名节点声明了不同插件、扩展缺少所属组、连接引用了
//!   不存在的扩展、连接两端的消息 Schema 不兼容；
//! - 地址中未设置的 `app_uri`/`graph_id` 以发送方所在范围补齐，未设置的组按节点表查找；
//!   指向其它 App 的地址视为进程外目标，报告为不可达。
//!
//! ## 设计权衡（Trade-offs）
//! - 路由表以 `ArcSwap` 发布：扩展线程在每次发送时无锁读取快照，代价是表只能整体替换；
//! - 线程句柄存放在 `DashMap` 中，线程退出时单独摘除，不影响其它组的投递。

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use arc_swap::ArcSwap;
use axis_core::{AxisError, Direction, Loc, MsgKind, Result, Value};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    addon::{AddonRegistry, AddonType},
    extension_thread::ExtThreadCore,
    runloop::RunloopHandle,
};

/// 节点类型。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Extension,
    ExtensionGroup,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub name: String,
    pub addon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<serde_json::Value>,
}

/// 某个名称的消息流向。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MsgFlow {
    pub name: String,
    #[serde(default)]
    pub dest: Vec<Loc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_group: Option<String>,
    pub extension: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<MsgFlow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<MsgFlow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio_frame: Vec<MsgFlow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub video_frame: Vec<MsgFlow>,
}

impl ConnectionConfig {
    fn flows<'a>(&'a self) -> impl Iterator<Item = (MsgKind, &'a MsgFlow)> {
        let tag = |kind: MsgKind| move |flow: &'a MsgFlow| (kind, flow);
        self.cmd
            .iter()
            .map(tag(MsgKind::Cmd))
            .chain(self.data.iter().map(tag(MsgKind::Data)))
            .chain(self.audio_frame.iter().map(tag(MsgKind::AudioFrame)))
            .chain(self.video_frame.iter().map(tag(MsgKind::VideoFrame)))
    }
}

/// 一张图的完整声明。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// 计划中的单个扩展。
#[derive(Clone, Debug, PartialEq)]
pub struct ExtensionPlan {
    pub name: String,
    pub addon: String,
    pub group: String,
    pub property: Value,
}

/// 计划中的扩展组，对应一个扩展线程。
#[derive(Clone, Debug, PartialEq)]
pub struct GroupPlan {
    pub name: String,
    /// 未声明组节点时为 `None`，线程使用默认组实现。
    pub addon: Option<String>,
    pub property: Value,
    pub extensions: Vec<ExtensionPlan>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphPlan {
    pub groups: Vec<GroupPlan>,
}

impl GraphPlan {
    pub fn extension_count(&self) -> usize {
        self.groups.iter().map(|group| group.extensions.len()).sum()
    }
}

fn invalid(message: impl Into<String>) -> AxisError {
    AxisError::InvalidGraph(message.into())
}

fn node_in_app(app: Option<&str>, app_uri: &str) -> bool {
    app.is_none_or(|app| app == app_uri)
}

type GroupsOf<'a> = HashMap<(Option<&'a str>, &'a str), &'a str>;

fn check_endpoint<'a>(
    groups_of: &GroupsOf<'a>,
    app: Option<&'a str>,
    group: Option<&'a str>,
    extension: &'a str,
) -> Result<()> {
    match groups_of.get(&(app, extension)) {
        None => Err(invalid(format!(
            "the connection refers to an unknown extension `{extension}`"
        ))),
        Some(declared) => match group {
            Some(group) if group != *declared => Err(invalid(format!(
                "extension `{extension}` belongs to `{declared}`, not `{group}`"
            ))),
            _ => Ok(()),
        },
    }
}

impl GraphConfig {
    pub fn from_json_str(text: &str) -> Result<GraphConfig> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml_str(text: &str) -> Result<GraphConfig> {
        toml::from_str(text).map_err(|err| AxisError::generic(format!("invalid graph toml: {err}")))
    }

    /// 结构校验，不涉及插件与 Schema。
    ///
    /// # 教案式说明
    /// - **契约（What）**：
    ///   - 同名节点（同类型、同 App）可以重复声明，但插件必须一致；
    ///   - 扩展节点必须给出 `extension_group`；
    ///   - 连接的源与（本 App 内的）目标必须是已声明的扩展，若连接写明了组则须与节点一致。
    pub fn validate(&self) -> Result<()> {
        let mut addons: HashMap<(NodeKind, Option<&str>, &str), &str> = HashMap::new();
        let mut groups_of: GroupsOf<'_> = HashMap::new();

        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(invalid("a node must have a non-empty name"));
            }
            let key = (node.kind, node.app.as_deref(), node.name.as_str());
            if let Some(previous) = addons.insert(key, node.addon.as_str()) {
                if previous != node.addon {
                    return Err(invalid(format!(
                        "node `{}` is declared with different addons: `{previous}` and `{}`",
                        node.name, node.addon
                    )));
                }
            }
            if node.kind == NodeKind::Extension {
                let group = node.extension_group.as_deref().ok_or_else(|| {
                    invalid(format!("extension `{}` has no extension_group", node.name))
                })?;
                let key = (node.app.as_deref(), node.name.as_str());
                if let Some(previous) = groups_of.insert(key, group) {
                    if previous != group {
                        return Err(invalid(format!(
                            "extension `{}` is declared in different groups: `{previous}` and `{group}`",
                            node.name
                        )));
                    }
                }
            }
        }

        for connection in &self.connections {
            check_endpoint(
                &groups_of,
                connection.app.as_deref(),
                connection.extension_group.as_deref(),
                &connection.extension,
            )?;
            for (kind, flow) in connection.flows() {
                if flow.name.is_empty() {
                    return Err(invalid(format!(
                        "a {} flow of `{}` has an empty name",
                        kind.as_str(),
                        connection.extension
                    )));
                }
                for dest in &flow.dest {
                    let Some(extension) = dest.extension.as_deref() else {
                        return Err(invalid(format!(
                            "the destination of {} `{}` must name an extension",
                            kind.as_str(),
                            flow.name
                        )));
                    };
                    // 进程外的目标无法在此校验。
                    if dest.app_uri.is_some() && dest.app_uri != connection.app {
                        continue;
                    }
                    check_endpoint(
                        &groups_of,
                        dest.app_uri.as_deref(),
                        dest.extension_group.as_deref(),
                        extension,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// 把属于 `app_uri` 的节点展开为按组划分的执行计划。
    pub fn plan(&self, app_uri: &str) -> Result<GraphPlan> {
        let mut plan = GraphPlan::default();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::new();

        let mut group_slot = |plan: &mut GraphPlan, name: &str| -> usize {
            *index.entry(name.to_owned()).or_insert_with(|| {
                plan.groups.push(GroupPlan {
                    name: name.to_owned(),
                    addon: None,
                    property: Value::object(),
                    extensions: Vec::new(),
                });
                plan.groups.len() - 1
            })
        };

        for node in &self.nodes {
            if !node_in_app(node.app.as_deref(), app_uri) {
                continue;
            }
            let property = match &node.property {
                Some(json) => Value::from_json(json),
                None => Value::object(),
            };
            match node.kind {
                NodeKind::ExtensionGroup => {
                    let slot = group_slot(&mut plan, &node.name);
                    let group = &mut plan.groups[slot];
                    group.addon = Some(node.addon.clone());
                    group.property = property;
                }
                NodeKind::Extension => {
                    if !seen.insert(node.name.as_str()) {
                        continue;
                    }
                    let group_name = node.extension_group.as_deref().ok_or_else(|| {
                        invalid(format!("extension `{}` has no extension_group", node.name))
                    })?;
                    let slot = group_slot(&mut plan, group_name);
                    plan.groups[slot].extensions.push(ExtensionPlan {
                        name: node.name.clone(),
                        addon: node.addon.clone(),
                        group: group_name.to_owned(),
                        property,
                    });
                }
            }
        }
        Ok(plan)
    }

    /// 检查每条本 App 内连接两端的消息 Schema 是否兼容。
    ///
    /// 插件尚未注册的一端视为未声明 Schema，缺失的插件会在创建扩展时以启动失败的形式报告。
    pub fn check_schemas(&self, app_uri: &str, registry: &AddonRegistry) -> Result<()> {
        let addon_of: HashMap<&str, &str> = self
            .nodes
            .iter()
            .filter(|node| node.kind == NodeKind::Extension)
            .filter(|node| node_in_app(node.app.as_deref(), app_uri))
            .map(|node| (node.name.as_str(), node.addon.as_str()))
            .collect();
        let schema_of = |extension: &str| {
            addon_of
                .get(extension)
                .and_then(|addon| registry.find_or_load(AddonType::Extension, addon))
        };

        for connection in &self.connections {
            if !node_in_app(connection.app.as_deref(), app_uri) {
                continue;
            }
            let Some(source_host) = schema_of(&connection.extension) else {
                continue;
            };
            for (kind, flow) in connection.flows() {
                let Some(source) = source_host.schema().msg_schema(kind, &flow.name, Direction::Out)
                else {
                    continue;
                };
                for dest in &flow.dest {
                    if !node_in_app(dest.app_uri.as_deref(), app_uri) {
                        continue;
                    }
                    let Some(target_host) = dest.extension.as_deref().and_then(schema_of) else {
                        continue;
                    };
                    let Some(target) =
                        target_host.schema().msg_schema(kind, &flow.name, Direction::In)
                    else {
                        continue;
                    };
                    source.is_compatible(target).map_err(|err| {
                        invalid(format!(
                            "{} `{}` from `{}` to `{}` is incompatible: {err}",
                            kind.as_str(),
                            flow.name,
                            connection.extension,
                            dest.extension.as_deref().unwrap_or_default()
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// 路由快照。
#[derive(Debug, Default)]
pub(crate) struct RoutingTable {
    groups_by_extension: HashMap<String, String>,
    flows: HashMap<(String, MsgKind, String), Vec<Loc>>,
}

impl RoutingTable {
    pub(crate) fn build(config: &GraphConfig, plan: &GraphPlan, app_uri: &str) -> RoutingTable {
        let groups_by_extension = plan
            .groups
            .iter()
            .flat_map(|group| {
                group
                    .extensions
                    .iter()
                    .map(|ext| (ext.name.clone(), group.name.clone()))
            })
            .collect();
        let mut flows: HashMap<(String, MsgKind, String), Vec<Loc>> = HashMap::new();
        for connection in &config.connections {
            if !node_in_app(connection.app.as_deref(), app_uri) {
                continue;
            }
            for (kind, flow) in connection.flows() {
                flows
                    .entry((connection.extension.clone(), kind, flow.name.clone()))
                    .or_default()
                    .extend(flow.dest.iter().cloned());
            }
        }
        RoutingTable {
            groups_by_extension,
            flows,
        }
    }
}

/// 进程内路由器：地址解析与线程句柄表。
pub(crate) struct Router {
    scope: Loc,
    table: ArcSwap<RoutingTable>,
    threads: DashMap<String, RunloopHandle<ExtThreadCore>>,
}

impl Router {
    pub(crate) fn new(app_uri: &str, graph_id: &str) -> Arc<Router> {
        Arc::new(Router {
            scope: Loc::new().with_app(app_uri).with_graph(graph_id),
            table: ArcSwap::from_pointee(RoutingTable::default()),
            threads: DashMap::new(),
        })
    }

    pub(crate) fn scope(&self) -> &Loc {
        &self.scope
    }

    pub(crate) fn publish(&self, table: RoutingTable) {
        self.table.store(Arc::new(table));
    }

    pub(crate) fn attach_thread(&self, group: &str, handle: RunloopHandle<ExtThreadCore>) {
        self.threads.insert(group.to_owned(), handle);
    }

    pub(crate) fn detach_thread(&self, group: &str) {
        self.threads.remove(group);
    }

    /// 扩展 `name` 在本图中的完整地址。
    pub(crate) fn loc_of(&self, group: &str, name: &str) -> Loc {
        let mut loc = Loc::new().with_group(group).with_extension(name);
        loc.fill_scope(&self.scope);
        loc
    }

    /// 无显式目标时由连接给出的默认目标。
    pub(crate) fn default_dests(&self, from: &str, kind: MsgKind, name: &str) -> Vec<Loc> {
        self.table
            .load()
            .flows
            .get(&(from.to_owned(), kind, name.to_owned()))
            .cloned()
            .unwrap_or_default()
    }

    /// 把地址解析为完整地址与目标线程。
    pub(crate) fn resolve(&self, dest: &Loc) -> Result<(Loc, RunloopHandle<ExtThreadCore>)> {
        let mut loc = dest.clone();
        loc.fill_scope(&self.scope);
        if loc.app_uri != self.scope.app_uri {
            return Err(AxisError::generic(format!(
                "the app `{}` is not reachable from this process",
                loc.app_uri.as_deref().unwrap_or_default()
            )));
        }
        if loc.graph_id != self.scope.graph_id {
            return Err(AxisError::generic(format!(
                "the graph `{}` is not reachable from graph `{}`",
                loc.graph_id.as_deref().unwrap_or_default(),
                self.scope.graph_id.as_deref().unwrap_or_default()
            )));
        }
        let Some(extension) = loc.extension.as_deref() else {
            return Err(AxisError::generic(format!(
                "the destination `{loc}` does not name an extension"
            )));
        };
        let table = self.table.load();
        let Some(group) = table.groups_by_extension.get(extension) else {
            return Err(AxisError::generic(format!(
                "the extension `{extension}` is not found in graph `{}`",
                self.scope.graph_id.as_deref().unwrap_or_default()
            )));
        };
        match loc.extension_group.as_deref() {
            Some(declared) if declared != group => {
                return Err(AxisError::generic(format!(
                    "the extension `{extension}` belongs to `{group}`, not `{declared}`"
                )));
            }
            Some(_) => {}
            None => loc.extension_group = Some(group.clone()),
        }
        let handle = self
            .threads
            .get(group.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                AxisError::generic(format!("the extension group `{group}` is not running"))
            })?;
        Ok((loc, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPH: &str = r#"{
        "nodes": [
            {"type": "extension_group", "name": "g1", "addon": "default_extension_group"},
            {"type": "extension", "name": "a", "addon": "addon_a", "extension_group": "g1",
             "property": {"x": 1}},
            {"type": "extension", "name": "b", "addon": "addon_b", "extension_group": "g2"}
        ],
        "connections": [
            {"extension": "a", "cmd": [{"name": "hello", "dest": [{"extension": "b"}]}]}
        ]
    }"#;

    #[test]
    fn plan_groups_extensions_in_declaration_order() {
        let config = GraphConfig::from_json_str(GRAPH).expect("解析图");
        config.validate().expect("合法图");
        let plan = config.plan("app").expect("生成计划");
        let names: Vec<_> = plan.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["g1", "g2"]);
        assert_eq!(plan.groups[0].addon.as_deref(), Some("default_extension_group"));
        assert!(plan.groups[1].addon.is_none(), "隐式组没有插件");
        assert_eq!(
            plan.groups[0].extensions[0].property.peek("x").ok().and_then(Value::as_i64),
            Some(1)
        );
        assert_eq!(plan.extension_count(), 2);
    }

    #[test]
    fn conflicting_addons_are_rejected() {
        let mut config = GraphConfig::from_json_str(GRAPH).expect("解析图");
        let mut duplicate = config.nodes[1].clone();
        duplicate.addon = "other".into();
        config.nodes.push(duplicate);
        assert!(matches!(config.validate(), Err(AxisError::InvalidGraph(_))));
    }

    #[test]
    fn unknown_connection_endpoint_is_rejected() {
        let mut config = GraphConfig::from_json_str(GRAPH).expect("解析图");
        config.connections[0].cmd[0].dest.push(Loc::extension("ghost"));
        let err = config.validate().expect_err("未知目标");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn router_fills_scope_and_rejects_foreign_app() {
        let config = GraphConfig::from_json_str(GRAPH).expect("解析图");
        let plan = config.plan("app").expect("生成计划");
        let router = Router::new("app", "graph-1");
        router.publish(RoutingTable::build(&config, &plan, "app"));

        assert_eq!(
            router.default_dests("a", MsgKind::Cmd, "hello"),
            vec![Loc::extension("b")]
        );
        let err = router
            .resolve(&Loc::extension("b"))
            .expect_err("线程尚未挂接");
        assert!(err.to_string().contains("not running"));

        let foreign = Loc::extension("b").with_app("elsewhere");
        let err = router.resolve(&foreign).expect_err("进程外目标");
        assert!(err.to_string().contains("not reachable"));
    }
}
