use axis_core::Result;

use super::{AddonRegistry, AddonType};

/// 插件加载器：注册表查找未命中时按需把插件注册进来。
///
/// # 教案式说明
/// - **意图（Why）**：插件可能来自运行时之外的来源（其它语言的绑定层、动态库目录），
///   加载器把“如何找到插件”与“如何使用插件”分开；
/// - **契约（What）**：
///   - App 启动时为每个已注册的加载器插件创建一个实例，调用 `on_init` 后安装到注册表；
///   - `load_addon` 返回 `Ok(true)` 表示已把目标插件注册进 `registry`；
///   - `load_addon` 在注册表的加载器表锁之外执行，其中可以注册插件或查询注册表；
///     嵌套的 `find_or_load` 只查已注册的插件，不会再次询问加载器；
///   - App 关闭时调用 `on_deinit`，随后实例经由其插件销毁。
pub trait AddonLoader: Send {
    fn on_init(&mut self, _registry: &AddonRegistry) -> Result<()> {
        Ok(())
    }

    fn on_deinit(&mut self) {}

    fn load_addon(
        &mut self,
        registry: &AddonRegistry,
        addon_type: AddonType,
        addon_name: &str,
    ) -> Result<bool>;
}
