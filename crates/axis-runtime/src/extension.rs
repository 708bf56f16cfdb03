//! 扩展的行为接口。
//!
//! 所有回调都在所属扩展线程上调用；回调完成阶段工作后必须调用 `Env` 上对应的 `on_*_done`，
//! 可以立即调用，也可以在之后（例如经由 [`EnvProxy`](crate::env_proxy::EnvProxy)）调用。

use axis_core::{Message, StatusCode};

use crate::env::Env;

/// 扩展。
///
/// # 教案式说明
/// - **契约（What）**：
///   - 生命周期顺序固定为 configure → init → start → (消息) → stop → deinit；
///   - 默认实现立即完成各阶段；`on_cmd` 默认以 `Ok` 回复，`detail` 为 `"default"`；
///   - 数据与音视频帧默认丢弃。
pub trait Extension: Send {
    fn on_configure(&mut self, env: &Env) {
        log_done(env, "on_configure", env.on_configure_done());
    }

    fn on_init(&mut self, env: &Env) {
        log_done(env, "on_init", env.on_init_done());
    }

    fn on_start(&mut self, env: &Env) {
        log_done(env, "on_start", env.on_start_done());
    }

    fn on_stop(&mut self, env: &Env) {
        log_done(env, "on_stop", env.on_stop_done());
    }

    fn on_deinit(&mut self, env: &Env) {
        log_done(env, "on_deinit", env.on_deinit_done());
    }

    fn on_cmd(&mut self, env: &Env, cmd: Message) {
        let replied = Message::new_cmd_result(StatusCode::Ok, &cmd).and_then(|mut result| {
            result.set_detail("default")?;
            env.return_result(result, &cmd)
        });
        log_done(env, "on_cmd", replied);
    }

    fn on_data(&mut self, _env: &Env, _data: Message) {}

    fn on_audio_frame(&mut self, _env: &Env, _frame: Message) {}

    fn on_video_frame(&mut self, _env: &Env, _frame: Message) {}
}

pub(crate) fn log_done(env: &Env, stage: &'static str, outcome: axis_core::Result<()>) {
    if let Err(err) = outcome {
        tracing::error!(owner = env.name(), stage, %err, "default lifecycle callback failed");
    }
}
