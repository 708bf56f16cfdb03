//! 全局安装契约。
//!
//! # 教案式说明
//! - **测试目标（Why）**：安装只生效一次，且安装后运行时的 `tracing` 事件能被全局 Subscriber 接收；
//! - **测试设计（How）**：全局状态无法在同一进程内重置，因此所有断言集中在单个测试函数中。

#[test]
fn install_is_once_only() {
    assert!(!axis_otel::is_installed());
    axis_otel::install_with_directive("debug").expect("首次安装成功");
    assert!(axis_otel::is_installed());
    assert_eq!(axis_otel::installed_directive(), Some("debug"));

    let span = tracing::info_span!("extension_thread", group = "g1");
    let _entered = span.enter();
    tracing::info!("global subscriber accepts runtime events");

    assert!(matches!(
        axis_otel::install(),
        Err(axis_otel::Error::AlreadyInstalled)
    ));
}
