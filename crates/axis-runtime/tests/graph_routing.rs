//! 图内路由：命令与结果的往返、扇出、启动前暂存消息的顺序、不可达目标与 Schema 检查。

use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use axis_core::{AxisError, Loc, Message, StatusCode, Value};
use axis_runtime::{
    AddonRegistry, AddonType, App, AppConfig, Env, Extension, FnAddon, GraphConfig,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));
const RECV: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
struct Observed {
    status: Option<StatusCode>,
    is_final: bool,
    is_completed: bool,
    detail: Option<String>,
}

impl Observed {
    fn of(result: &Message) -> Self {
        Self {
            status: result.status_code(),
            is_final: result.is_final(),
            is_completed: result.is_completed(),
            detail: result.detail().and_then(Value::as_str).map(str::to_owned),
        }
    }
}

/// 在 `on_start` 中发出一条命令并上报收到的每个结果。
#[derive(Clone)]
struct Caller {
    cmd: &'static str,
    dests: Vec<Loc>,
    seen: mpsc::Sender<Observed>,
}

impl Extension for Caller {
    fn on_start(&mut self, env: &Env) {
        let mut cmd = Message::new_cmd(self.cmd).expect("构造命令");
        for dest in &self.dests {
            cmd.add_dest(dest.clone());
        }
        let seen = self.seen.clone();
        env.send_cmd(
            cmd,
            Some(Box::new(move |_env: &Env, result: Message| {
                seen.send(Observed::of(&result)).expect("测试线程仍在等待结果");
            })),
        )
        .expect("发送命令");
        env.on_start_done().expect("完成 start");
    }
}

/// 把收到的命令原样转发给连接中的下游。
struct Forwarder;

impl Extension for Forwarder {
    fn on_cmd(&mut self, env: &Env, cmd: Message) {
        env.send_cmd(cmd, None).expect("转发命令");
    }
}

/// 以自身名称作为 `detail` 回复。
struct Replier {
    name: String,
}

impl Extension for Replier {
    fn on_cmd(&mut self, env: &Env, cmd: Message) {
        let mut result = Message::new_cmd_result(StatusCode::Ok, &cmd).expect("构造结果");
        result.set_detail(self.name.clone()).expect("写入 detail");
        env.return_result(result, &cmd).expect("回复命令");
    }
}

fn register<E: Extension + 'static>(
    registry: &AddonRegistry,
    name: &str,
    make: impl Fn(&str) -> E + Send + Sync + 'static,
) {
    registry
        .register(AddonType::Extension, name, FnAddon::extension(make))
        .expect("注册插件");
}

fn start_app(name: &str, registry: Arc<AddonRegistry>) -> App {
    let app = App::builder(AppConfig::new(format!("test://{name}")))
        .registry(registry)
        .start()
        .expect("启动 App");
    assert!(app.wait_ready(WAIT), "App 应在超时前就绪");
    app
}

fn start_graph(app: &App, json: &str) -> Message {
    let graph = GraphConfig::from_json_str(json).expect("解析图");
    app.start_graph_blocking(graph, WAIT).expect("收到启动结果")
}

fn close(app: App) {
    app.close();
    assert!(app.wait_closed(WAIT), "App 应在超时前关闭");
}

#[test]
fn nested_cmd_round_trip_completes_once() {
    let registry = AddonRegistry::new();
    let (tx, rx) = mpsc::channel();
    register(&registry, "caller", move |_| Caller {
        cmd: "hello",
        dests: Vec::new(),
        seen: tx.clone(),
    });
    register(&registry, "forwarder", |_| Forwarder);
    register(&registry, "replier", |name| Replier {
        name: name.to_owned(),
    });

    let app = start_app("nested", registry);
    let started = start_graph(
        &app,
        r#"{
            "nodes": [
                {"type": "extension", "name": "a", "addon": "caller", "extension_group": "ga"},
                {"type": "extension", "name": "b", "addon": "forwarder", "extension_group": "gb"},
                {"type": "extension", "name": "c", "addon": "replier", "extension_group": "gc"}
            ],
            "connections": [
                {"extension": "a", "cmd": [{"name": "hello", "dest": [{"extension": "b"}]}]},
                {"extension": "b", "cmd": [{"name": "hello", "dest": [{"extension": "c"}]}]}
            ]
        }"#,
    );
    assert_eq!(started.status_code(), Some(StatusCode::Ok));

    let observed = rx.recv_timeout(RECV).expect("调用方收到结果");
    assert_eq!(observed.status, Some(StatusCode::Ok));
    assert!(observed.is_final && observed.is_completed, "唯一的最终结果即完成结果");
    assert_eq!(observed.detail.as_deref(), Some("c"), "结果来自最末端的扩展");
    assert!(
        rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "不应收到第二个结果"
    );

    close(app);
}

#[test]
fn fan_out_completes_on_the_last_final_result() {
    let registry = AddonRegistry::new();
    let (tx, rx) = mpsc::channel();
    register(&registry, "caller", move |_| Caller {
        cmd: "fan",
        dests: Vec::new(),
        seen: tx.clone(),
    });
    register(&registry, "replier", |name| Replier {
        name: name.to_owned(),
    });

    let app = start_app("fan-out", registry);
    let started = start_graph(
        &app,
        r#"{
            "nodes": [
                {"type": "extension", "name": "a", "addon": "caller", "extension_group": "g1"},
                {"type": "extension", "name": "b", "addon": "replier", "extension_group": "g2"},
                {"type": "extension", "name": "c", "addon": "replier", "extension_group": "g3"}
            ],
            "connections": [
                {"extension": "a", "cmd": [
                    {"name": "fan", "dest": [{"extension": "b"}, {"extension": "c"}]}
                ]}
            ]
        }"#,
    );
    assert_eq!(started.status_code(), Some(StatusCode::Ok));

    let first = rx.recv_timeout(RECV).expect("第一个结果");
    let second = rx.recv_timeout(RECV).expect("第二个结果");
    assert!(first.is_final && second.is_final);
    assert!(!first.is_completed, "先到的结果不是完成结果");
    assert!(second.is_completed, "最后一个最终结果标记完成");
    let mut details = vec![first.detail, second.detail];
    details.sort();
    assert_eq!(details, vec![Some("b".to_owned()), Some("c".to_owned())]);

    close(app);
}

/// 连续发出若干数据消息。
struct Streamer {
    names: Vec<&'static str>,
}

impl Extension for Streamer {
    fn on_start(&mut self, env: &Env) {
        for name in &self.names {
            env.send_data(Message::new_data(*name)).expect("发送数据");
        }
        env.on_start_done().expect("完成 start");
    }
}

/// 启动较慢的接收方：数据在它就绪之前到达。
struct SlowRecorder {
    started: bool,
    seen: mpsc::Sender<(String, bool)>,
}

impl Extension for SlowRecorder {
    fn on_start(&mut self, env: &Env) {
        thread::sleep(Duration::from_millis(100));
        self.started = true;
        env.on_start_done().expect("完成 start");
    }

    fn on_data(&mut self, _env: &Env, data: Message) {
        self.seen
            .send((data.name().to_owned(), self.started))
            .expect("测试线程仍在等待数据");
    }
}

#[test]
fn messages_sent_before_ready_are_flushed_in_order() {
    let registry = AddonRegistry::new();
    let (tx, rx) = mpsc::channel();
    register(&registry, "streamer", |_| Streamer {
        names: vec!["d1", "d2", "d3"],
    });
    register(&registry, "slow", move |_| SlowRecorder {
        started: false,
        seen: tx.clone(),
    });

    let app = start_app("flush", registry);
    let started = start_graph(
        &app,
        r#"{
            "nodes": [
                {"type": "extension", "name": "src", "addon": "streamer", "extension_group": "fast"},
                {"type": "extension", "name": "sink", "addon": "slow", "extension_group": "slow"}
            ],
            "connections": [
                {"extension": "src", "data": [
                    {"name": "d1", "dest": [{"extension": "sink"}]},
                    {"name": "d2", "dest": [{"extension": "sink"}]},
                    {"name": "d3", "dest": [{"extension": "sink"}]}
                ]}
            ]
        }"#,
    );
    assert_eq!(started.status_code(), Some(StatusCode::Ok));

    let received: Vec<(String, bool)> = (0..3)
        .map(|_| rx.recv_timeout(RECV).expect("数据应被投递"))
        .collect();
    let names: Vec<&str> = received.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["d1", "d2", "d3"], "暂存消息保持到达顺序");
    assert!(
        received.iter().all(|(_, started)| *started),
        "扩展启动完成之前不投递消息"
    );

    close(app);
}

#[test]
fn unreachable_destinations_answer_with_error_results() {
    let registry = AddonRegistry::new();
    let (remote_tx, remote_rx) = mpsc::channel();
    let (ghost_tx, ghost_rx) = mpsc::channel();
    register(&registry, "remote_caller", move |_| Caller {
        cmd: "hello",
        dests: vec![Loc::extension("x").with_app("msgpack://10.0.0.1:8001/")],
        seen: remote_tx.clone(),
    });
    register(&registry, "ghost_caller", move |_| Caller {
        cmd: "hello",
        dests: vec![Loc::extension("ghost")],
        seen: ghost_tx.clone(),
    });

    let app = start_app("unreachable", registry);
    let started = start_graph(
        &app,
        r#"{
            "nodes": [
                {"type": "extension", "name": "r", "addon": "remote_caller", "extension_group": "g"},
                {"type": "extension", "name": "h", "addon": "ghost_caller", "extension_group": "g"}
            ]
        }"#,
    );
    assert_eq!(started.status_code(), Some(StatusCode::Ok));

    let remote = remote_rx.recv_timeout(RECV).expect("跨 App 命令收到错误结果");
    assert_eq!(remote.status, Some(StatusCode::Error));
    assert!(remote.is_completed);
    assert!(
        remote.detail.as_deref().is_some_and(|d| d.contains("not reachable")),
        "detail 说明目标不可达：{remote:?}"
    );

    let ghost = ghost_rx.recv_timeout(RECV).expect("未知扩展收到错误结果");
    assert_eq!(ghost.status, Some(StatusCode::Error));
    assert!(
        ghost.detail.as_deref().is_some_and(|d| d.contains("not found")),
        "detail 说明目标不存在：{ghost:?}"
    );

    close(app);
}

#[test]
fn incoming_cmd_missing_a_required_property_is_rejected() {
    let registry = AddonRegistry::new();
    let (tx, rx) = mpsc::channel();
    register(&registry, "caller", move |_| Caller {
        cmd: "hello",
        dests: Vec::new(),
        seen: tx.clone(),
    });
    registry
        .register(
            AddonType::Extension,
            "strict",
            FnAddon::extension(|name| Replier {
                name: name.to_owned(),
            })
            .with_schema(
                r#"{"cmd_in": [{"name": "hello", "property": {"n": {"type": "int32"}}, "required": ["n"]}]}"#,
            ),
        )
        .expect("注册带 Schema 的插件");

    let app = start_app("required", registry);
    let started = start_graph(
        &app,
        r#"{
            "nodes": [
                {"type": "extension", "name": "a", "addon": "caller", "extension_group": "g1"},
                {"type": "extension", "name": "b", "addon": "strict", "extension_group": "g2"}
            ],
            "connections": [
                {"extension": "a", "cmd": [{"name": "hello", "dest": [{"extension": "b"}]}]}
            ]
        }"#,
    );
    assert_eq!(started.status_code(), Some(StatusCode::Ok));

    let observed = rx.recv_timeout(RECV).expect("收到拒收结果");
    assert_eq!(observed.status, Some(StatusCode::Error), "缺少必填属性的命令被拒收");
    assert!(observed.is_completed);
    assert_ne!(observed.detail.as_deref(), Some("b"), "接收方的 on_cmd 不应被调用");

    close(app);
}

#[test]
fn incompatible_connection_schemas_reject_the_graph() {
    let registry = AddonRegistry::new();
    registry
        .register(
            AddonType::Extension,
            "typed_out",
            FnAddon::extension(|name| Replier {
                name: name.to_owned(),
            })
            .with_schema(r#"{"cmd_out": [{"name": "hello", "property": {"n": {"type": "string"}}}]}"#),
        )
        .expect("注册发送方");
    registry
        .register(
            AddonType::Extension,
            "typed_in",
            FnAddon::extension(|name| Replier {
                name: name.to_owned(),
            })
            .with_schema(r#"{"cmd_in": [{"name": "hello", "property": {"n": {"type": "int32"}}}]}"#),
        )
        .expect("注册接收方");

    let json = r#"{
        "nodes": [
            {"type": "extension", "name": "a", "addon": "typed_out", "extension_group": "g"},
            {"type": "extension", "name": "b", "addon": "typed_in", "extension_group": "g"}
        ],
        "connections": [
            {"extension": "a", "cmd": [{"name": "hello", "dest": [{"extension": "b"}]}]}
        ]
    }"#;
    let graph = GraphConfig::from_json_str(json).expect("解析图");
    let err = graph
        .check_schemas("test://schema", &registry)
        .expect_err("string 不能送往 int32");
    assert!(matches!(err, AxisError::InvalidGraph(_)), "实际错误：{err:?}");

    let app = start_app("schema", Arc::clone(&registry));
    let result = start_graph(&app, json);
    assert_eq!(result.status_code(), Some(StatusCode::Error));
    assert!(
        result
            .detail()
            .and_then(Value::as_str)
            .is_some_and(|detail| detail.contains("incompatible")),
        "detail 说明 Schema 不兼容"
    );
    assert!(app.graph_ids().is_empty(), "被拒绝的图不会运行");

    close(app);
}
