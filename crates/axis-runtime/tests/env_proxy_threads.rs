//! 环境代理的跨线程契约：锁模式互斥、同步通知的前置条件、引用计数驱动的延迟反初始化。

use std::{
    sync::{
        Arc, mpsc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use axis_core::{AxisError, StatusCode, Value};
use axis_runtime::{
    AddonRegistry, AddonType, App, AppConfig, Env, EnvProxy, Extension, FnAddon, GraphConfig,
    NotifyMode,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

/// 在 `on_start` 中创建代理并交给测试线程的扩展。
struct ProxyHost {
    proxies: mpsc::Sender<EnvProxy>,
    dropped: Arc<AtomicUsize>,
}

impl Extension for ProxyHost {
    fn on_start(&mut self, env: &Env) {
        let proxy = EnvProxy::create(env, 1).expect("所有者线程上可以创建代理");
        self.proxies.send(proxy).expect("测试线程仍在等待代理");
        env.on_start_done().expect("完成 start");
    }
}

impl Drop for ProxyHost {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    app: App,
    graph_id: String,
    proxy: EnvProxy,
    dropped: Arc<AtomicUsize>,
}

fn launch(name: &str) -> Fixture {
    let registry = AddonRegistry::new();
    let (tx, rx) = mpsc::channel();
    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dropped);
    registry
        .register(
            AddonType::Extension,
            "proxy_host",
            FnAddon::extension(move |_| ProxyHost {
                proxies: tx.clone(),
                dropped: Arc::clone(&counter),
            }),
        )
        .expect("注册插件");

    let app = App::builder(AppConfig::new(format!("test://{name}")))
        .registry(registry)
        .start()
        .expect("启动 App");
    assert!(app.wait_ready(WAIT), "App 应在超时前就绪");

    let graph = GraphConfig::from_json_str(
        r#"{"nodes": [{"type": "extension", "name": "host", "addon": "proxy_host", "extension_group": "worker"}]}"#,
    )
    .expect("解析图");
    let result = app.start_graph_blocking(graph, WAIT).expect("收到启动结果");
    assert_eq!(result.status_code(), Some(StatusCode::Ok));
    let graph_id = result
        .detail()
        .and_then(Value::as_str)
        .expect("成功结果的 detail 为图 ID")
        .to_owned();
    let proxy = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("扩展应交出代理");

    Fixture {
        app,
        graph_id,
        proxy,
        dropped,
    }
}

fn shutdown(fixture: Fixture) {
    fixture.proxy.release().expect("释放测试线程持有的计数");
    fixture.app.close();
    assert!(fixture.app.wait_closed(WAIT), "App 应在超时前关闭");
    assert_eq!(fixture.dropped.load(Ordering::SeqCst), 1, "扩展实例恰好销毁一次");
}

#[test]
fn lock_mode_admits_one_holder_at_a_time() {
    let fixture = launch("lock-mode");
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let proxy = fixture.proxy.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            let hits = Arc::clone(&hits);
            thread::spawn(move || {
                proxy.acquire().expect("新线程登记使用代理");
                for _ in 0..5 {
                    proxy.acquire_lock_mode().expect("获取锁模式");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);

                    let counted = Arc::clone(&hits);
                    proxy
                        .notify(
                            move |env: &Env| {
                                assert!(!env.in_owner_thread(), "同步通知在调用方线程执行");
                                assert!(
                                    !env.is_property_exist("absent").expect("持有者可访问环境")
                                );
                                counted.fetch_add(1, Ordering::SeqCst);
                            },
                            NotifyMode::Sync,
                        )
                        .expect("持有者可以同步通知");

                    thread::sleep(Duration::from_millis(1));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    proxy.release_lock_mode().expect("释放锁模式");
                }
                proxy.release().expect("线程结束使用代理");
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("工作线程不应 panic");
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1, "同一时刻至多一个持有者");
    assert_eq!(hits.load(Ordering::SeqCst), 20);
    assert_eq!(fixture.proxy.thread_count(), 1, "只剩测试线程的计数");
    shutdown(fixture);
}

#[test]
fn sync_notify_requires_lock_mode() {
    let fixture = launch("sync-notify");

    let err = fixture
        .proxy
        .notify(|_env: &Env| {}, NotifyMode::Sync)
        .expect_err("未持有锁模式时同步通知必须失败");
    assert!(
        err.message().contains("without acquiring lock_mode"),
        "错误信息应说明缺少锁模式：{err}"
    );
    assert!(
        fixture.proxy.release_lock_mode().is_err(),
        "非持有者不能释放锁模式"
    );

    let (tx, rx) = mpsc::channel();
    fixture
        .proxy
        .notify(
            move |env: &Env| {
                tx.send(env.in_owner_thread()).expect("测试线程仍在等待");
            },
            NotifyMode::Async,
        )
        .expect("异步通知投递成功");
    assert!(
        rx.recv_timeout(Duration::from_secs(5)).expect("通知应被执行"),
        "异步通知在所有者线程执行"
    );

    fixture.proxy.acquire_lock_mode().expect("获取锁模式");
    let (tx, rx) = mpsc::channel();
    fixture
        .proxy
        .notify(
            move |env: &Env| {
                tx.send(EnvProxy::create(env, 1).is_err()).expect("测试线程仍在等待");
            },
            NotifyMode::Sync,
        )
        .expect("持有者可以同步通知");
    assert!(rx.recv().expect("同步通知已执行"), "代理只能在所有者线程上创建");
    fixture.proxy.release_lock_mode().expect("释放锁模式");

    shutdown(fixture);
}

#[test]
fn deinit_waits_for_the_last_proxy_release() {
    let fixture = launch("deferred-deinit");
    let engine = fixture.app.graph(&fixture.graph_id).expect("图在运行");

    fixture.app.stop_graph(&fixture.graph_id).expect("请求关闭图");
    assert!(
        !engine.wait_closed(Some(Duration::from_millis(200))),
        "代理存活时扩展的反初始化被推迟"
    );
    assert_eq!(fixture.dropped.load(Ordering::SeqCst), 0);

    fixture.proxy.release().expect("最后一次释放");
    assert!(engine.wait_closed(WAIT), "最后一个代理释放后图完成关闭");
    assert_eq!(fixture.dropped.load(Ordering::SeqCst), 1, "扩展实例恰好销毁一次");

    let err = fixture.proxy.release().expect_err("多余的释放");
    assert!(matches!(err, AxisError::InvalidArgument(_)), "实际错误：{err:?}");
    assert!(fixture.proxy.acquire().is_err(), "归零后的代理不可复活");

    fixture.app.close();
    assert!(fixture.app.wait_closed(WAIT));
    assert!(fixture.app.graph_ids().is_empty());
}
