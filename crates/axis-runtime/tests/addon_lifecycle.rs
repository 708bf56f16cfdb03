//! 插件注册表与实例生命周期：唯一性、身份校验、所属线程上的异步创建与销毁、注册表关闭。

use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use axis_core::AxisError;
use axis_runtime::{
    AddonRegistry, AddonType, CreatedInstance, Extension, FnAddon, create_instance_async,
    destroy_instance_async,
    runloop::{Runloop, RunloopHandle},
};
use tracing_test::traced_test;

struct Noop;

impl Extension for Noop {}

fn registry_with(names: &[&str]) -> Arc<AddonRegistry> {
    let registry = AddonRegistry::new();
    for name in names {
        registry
            .register(AddonType::Extension, *name, FnAddon::extension(|_| Noop))
            .expect("注册插件");
    }
    registry
}

/// 在独立线程上驱动一个空上下文的 runloop，模拟某个所有者线程。
fn spawn_owner(name: &str) -> (RunloopHandle<()>, thread::JoinHandle<()>) {
    let runloop = Runloop::<()>::new(name.to_owned());
    let handle = runloop.handle();
    let join = thread::spawn(move || {
        runloop.run(&mut ()).expect("驱动 runloop");
    });
    (handle, join)
}

#[test]
fn duplicate_registration_is_rejected() {
    let registry = registry_with(&["echo"]);
    let err = registry
        .register(AddonType::Extension, "echo", FnAddon::extension(|_| Noop))
        .expect_err("同类型同名插件只能注册一次");
    assert!(matches!(err, AxisError::Generic { .. }), "实际错误：{err:?}");

    registry
        .register(AddonType::ExtensionGroup, "echo", FnAddon::extension(|_| Noop))
        .expect("不同类型的命名空间相互独立");
    assert_eq!(registry.names(AddonType::Extension), vec!["echo".to_owned()]);

    assert!(registry.unregister(AddonType::Extension, "echo").is_some());
    assert!(registry.find(AddonType::Extension, "echo").is_none());
    registry
        .register(AddonType::Extension, "echo", FnAddon::extension(|_| Noop))
        .expect("注销后可以重新注册");
}

#[test]
fn invalid_schema_fails_registration() {
    let registry = AddonRegistry::new();
    let err = registry
        .register(
            AddonType::Extension,
            "broken",
            FnAddon::extension(|_| Noop).with_schema(r#"{"required": ["a"]}"#),
        )
        .expect_err("顶层 required 是非法 Schema");
    assert!(err.message().contains("broken"), "错误信息应指明插件：{err}");
    assert!(registry.find(AddonType::Extension, "broken").is_none());
}

#[test]
fn instance_type_must_match_the_registration() {
    let registry = AddonRegistry::new();
    let host = registry
        .register(AddonType::ExtensionGroup, "liar", FnAddon::extension(|_| Noop))
        .expect("注册插件");
    assert!(host.create_instance("g").is_err(), "扩展组插件产出扩展实例时报错");
    assert_eq!(host.live_instances(), 0);
}

#[traced_test]
#[test]
fn destroying_an_identity_the_host_does_not_own_fails() {
    let registry = registry_with(&["left", "right"]);
    let left = registry.find(AddonType::Extension, "left").expect("left 已注册");
    let right = registry.find(AddonType::Extension, "right").expect("right 已注册");

    let (id, instance) = left.create_instance("one").expect("创建实例");
    let err = right
        .destroy_instance(id, instance)
        .expect_err("其它插件签发的身份不能销毁");
    assert!(matches!(err, AxisError::InvalidArgument(_)), "实际错误：{err:?}");
    assert!(logs_contain("does not own"), "非法销毁以 error 级别记录");
    assert_eq!(left.live_instances(), 1, "身份仍归 left 所有");

    let (second, instance) = left.create_instance("two").expect("创建实例");
    let (_, spare) = left.create_instance("three").expect("创建实例");
    left.destroy_instance(second, instance).expect("首次销毁成功");
    let err = left
        .destroy_instance(second, spare)
        .expect_err("同一身份不能销毁两次");
    assert!(matches!(err, AxisError::InvalidArgument(_)));
}

#[test]
fn async_creation_completes_on_the_owner_thread() {
    let registry = registry_with(&["echo"]);
    let (owner, join) = spawn_owner("addon-owner");

    let (tx, rx) = mpsc::channel();
    let owner_check = owner.clone();
    create_instance_async(
        &registry,
        &owner,
        AddonType::Extension,
        "echo",
        "instance",
        move |outcome| {
            tx.send((outcome, owner_check.is_current())).expect("测试线程仍在等待");
        },
    );
    let (outcome, on_owner): (axis_core::Result<CreatedInstance>, bool) =
        rx.recv_timeout(Duration::from_secs(5)).expect("创建回调应执行");
    assert!(on_owner, "完成回调在所属线程执行");
    let created = outcome.expect("创建成功");
    assert_eq!(created.host.live_instances(), 1);
    let host = Arc::clone(&created.host);

    let (tx, rx) = mpsc::channel();
    let owner_check = owner.clone();
    destroy_instance_async(&owner, created, move |outcome| {
        tx.send((outcome.is_ok(), owner_check.is_current())).expect("测试线程仍在等待");
    });
    let (destroyed, on_owner) = rx.recv_timeout(Duration::from_secs(5)).expect("销毁回调应执行");
    assert!(destroyed && on_owner, "销毁在所属线程完成");
    assert_eq!(host.live_instances(), 0);

    owner.stop();
    join.join().expect("runloop 线程正常退出");
}

#[test]
fn creation_on_the_owner_thread_runs_inline() {
    let registry = registry_with(&["echo"]);
    let (owner, join) = spawn_owner("inline-owner");

    let (tx, rx) = mpsc::channel();
    let caller = owner.clone();
    owner
        .post_tail(move |_| {
            let slot = Arc::new(parking_lot::Mutex::new(None));
            let filled = Arc::clone(&slot);
            create_instance_async(
                &registry,
                &caller,
                AddonType::Extension,
                "missing",
                "instance",
                move |outcome| *filled.lock() = Some(outcome.map(|_| ())),
            );
            let inline = slot.lock().take();
            tx.send(inline).expect("测试线程仍在等待");
        })
        .expect("投递任务");

    let inline = rx.recv_timeout(Duration::from_secs(5)).expect("任务应执行");
    let err = inline
        .expect("所属线程上的创建同步完成")
        .expect_err("未注册的插件创建失败");
    assert!(err.message().contains("Failed to find"), "实际错误：{err}");

    owner.stop();
    join.join().expect("runloop 线程正常退出");
}

#[test]
fn shutdown_clears_the_registry_and_refuses_new_addons() {
    let registry = registry_with(&["a", "b"]);
    assert_eq!(registry.names(AddonType::Extension), vec!["a", "b"]);

    registry.shutdown();
    assert!(registry.is_shutdown());
    assert!(registry.names(AddonType::Extension).is_empty());
    assert!(
        registry
            .register(AddonType::Extension, "late", FnAddon::extension(|_| Noop))
            .is_err(),
        "关闭后注册一律失败"
    );
    registry.shutdown();
}

#[test]
fn global_registry_is_a_process_singleton() {
    let first = AddonRegistry::global();
    let second = AddonRegistry::global();
    assert!(Arc::ptr_eq(first, second));
}
