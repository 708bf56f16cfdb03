//! 扩展组的行为接口与默认实现。
//!
//! 扩展组决定其线程上创建哪些扩展；图中未给出组插件时，线程使用 [`DefaultExtensionGroup`]，
//! 它按图中声明逐个创建扩展。

use crate::{env::Env, extension::log_done, graph::ExtensionPlan};

/// 扩展组：决定本线程上创建哪些扩展。
pub trait ExtensionGroup: Send {
    fn on_configure(&mut self, env: &Env) {
        log_done(env, "on_configure", env.on_configure_done());
    }

    fn on_init(&mut self, env: &Env) {
        log_done(env, "on_init", env.on_init_done());
    }

    /// 默认逐个请求创建图中声明的扩展。
    fn on_create_extensions(&mut self, env: &Env, plans: &[ExtensionPlan]) {
        for plan in plans {
            log_done(env, "on_create_extensions", env.create_extension(plan.clone()));
        }
    }

    fn on_destroy_extensions(&mut self, env: &Env) {
        log_done(
            env,
            "on_destroy_extensions",
            env.on_destroy_extensions_done(),
        );
    }

    fn on_deinit(&mut self, env: &Env) {
        log_done(env, "on_deinit", env.on_deinit_done());
    }
}

/// 图中未声明组插件时使用的组实现。
#[derive(Debug, Default)]
pub struct DefaultExtensionGroup;

impl ExtensionGroup for DefaultExtensionGroup {}
