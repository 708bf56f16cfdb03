//! 命令路径表：记录每条在途命令的来路与去路。
//!
//! - **出向路径**：本扩展发出的命令，保存回复处理器、上游命令 ID 与尚待到达的最终结果数；
//! - **入向路径**：本扩展收到的命令，保存其来源地址，回复时据此逆向返回。
//!
//! 扇出到 N 个目标的命令需要收齐 N 个最终结果才算完成；只有最后一个最终结果会被标记为
//! `is_completed`，处理器在此之后被移除。

use std::collections::HashMap;

use axis_core::{Loc, Message};

use crate::env::Env;

/// 命令结果处理器；每个结果（含非最终结果）调用一次。
pub type ResultHandler = Box<dyn FnMut(&Env, Message) + Send + 'static>;

pub(crate) struct OutPath {
    handler: Option<ResultHandler>,
    parent_cmd_id: Option<String>,
    pending_finals: usize,
}

pub(crate) struct InPath {
    src: Loc,
}

/// 结果到达后应当如何处理。
pub(crate) enum ResultRoute {
    /// 交给本扩展的处理器；`completed` 为假时调用方需通过 [`PathTable::restore_handler`] 归还处理器。
    Handle {
        handler: ResultHandler,
        completed: bool,
    },
    /// 本扩展是转发者：结果改写为上游命令 ID 后继续回传。
    Forward { parent_cmd_id: String },
    /// 无人等待该结果。
    Drop,
}

#[derive(Default)]
pub(crate) struct PathTable {
    out_paths: HashMap<String, OutPath>,
    in_paths: HashMap<String, InPath>,
}

impl PathTable {
    pub(crate) fn add_out_path(
        &mut self,
        cmd_id: String,
        handler: Option<ResultHandler>,
        parent_cmd_id: Option<String>,
        fan_out: usize,
    ) {
        self.out_paths.insert(
            cmd_id,
            OutPath {
                handler,
                parent_cmd_id,
                pending_finals: fan_out.max(1),
            },
        );
    }

    pub(crate) fn add_in_path(&mut self, cmd_id: String, src: Loc) {
        self.in_paths.insert(cmd_id, InPath { src });
    }

    pub(crate) fn has_in_path(&self, cmd_id: &str) -> bool {
        self.in_paths.contains_key(cmd_id)
    }

    pub(crate) fn in_path_src(&self, cmd_id: &str) -> Option<&Loc> {
        self.in_paths.get(cmd_id).map(|path| &path.src)
    }

    pub(crate) fn remove_in_path(&mut self, cmd_id: &str) -> Option<Loc> {
        self.in_paths.remove(cmd_id).map(|path| path.src)
    }

    /// 为到达的结果决定去向，并维护完成计数。
    ///
    /// # 教案式说明
    /// - **契约（What）**：
    ///   - 最终结果使待到达计数减一，计数归零的那个结果被标记为 `is_completed`，路径随之移除；
    ///   - 非最终结果与未归零时的最终结果都不带 `is_completed`；
    ///   - 未知 `cmd_id` 返回 [`ResultRoute::Drop`]。
    pub(crate) fn take_result_route(&mut self, result: &mut Message) -> ResultRoute {
        let Some(cmd_id) = result.cmd_id().map(str::to_owned) else {
            return ResultRoute::Drop;
        };
        let is_final = result.is_final();
        let Some(path) = self.out_paths.get_mut(&cmd_id) else {
            return ResultRoute::Drop;
        };

        let mut completed = false;
        if is_final {
            path.pending_finals = path.pending_finals.saturating_sub(1);
            completed = path.pending_finals == 0;
        }
        if let Some(fields) = result.cmd_result_mut() {
            fields.is_completed = completed;
        }

        let route = if let Some(parent) = path.parent_cmd_id.clone() {
            ResultRoute::Forward {
                parent_cmd_id: parent,
            }
        } else if let Some(handler) = path.handler.take() {
            ResultRoute::Handle { handler, completed }
        } else {
            ResultRoute::Drop
        };

        if completed {
            self.out_paths.remove(&cmd_id);
        }
        route
    }

    pub(crate) fn restore_handler(&mut self, cmd_id: &str, handler: ResultHandler) {
        if let Some(path) = self.out_paths.get_mut(cmd_id) {
            path.handler = Some(handler);
        }
    }

    /// 仍在等待结果的出向命令。
    pub(crate) fn pending_out(&self) -> usize {
        self.out_paths.len()
    }

    pub(crate) fn pending_in(&self) -> usize {
        self.in_paths.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axis_core::StatusCode;

    fn result_for(cmd: &Message, is_final: bool) -> Message {
        let mut result = Message::new_cmd_result(StatusCode::Ok, cmd).expect("构造结果");
        result.set_final(is_final).expect("设置 is_final");
        result
    }

    #[test]
    fn only_last_final_result_completes_fan_out() {
        let cmd = Message::new_cmd("hello").expect("构造命令");
        let cmd_id = cmd.cmd_id().expect("命令带 ID").to_owned();
        let mut table = PathTable::default();
        table.add_out_path(cmd_id.clone(), Some(Box::new(|_, _| {})), None, 2);

        let mut partial = result_for(&cmd, false);
        match table.take_result_route(&mut partial) {
            ResultRoute::Handle { handler, completed } => {
                assert!(!completed, "非最终结果不会完成命令");
                table.restore_handler(&cmd_id, handler);
            }
            _ => panic!("应交给处理器"),
        }

        let mut first = result_for(&cmd, true);
        match table.take_result_route(&mut first) {
            ResultRoute::Handle { handler, completed } => {
                assert!(!completed && !first.is_completed(), "第一个最终结果尚未完成");
                table.restore_handler(&cmd_id, handler);
            }
            _ => panic!("应交给处理器"),
        }

        let mut second = result_for(&cmd, true);
        assert!(matches!(
            table.take_result_route(&mut second),
            ResultRoute::Handle { completed: true, .. }
        ));
        assert!(second.is_completed(), "最后一个最终结果被标记完成");
        assert_eq!(table.pending_out(), 0, "完成后路径被移除");
    }

    #[test]
    fn forwarded_result_reports_parent() {
        let cmd = Message::new_cmd("relay").expect("构造命令");
        let mut table = PathTable::default();
        table.add_out_path(
            cmd.cmd_id().expect("命令带 ID").to_owned(),
            None,
            Some("upstream".into()),
            1,
        );
        let mut result = result_for(&cmd, true);
        match table.take_result_route(&mut result) {
            ResultRoute::Forward { parent_cmd_id } => assert_eq!(parent_cmd_id, "upstream"),
            _ => panic!("应转发给上游"),
        }
        assert!(matches!(
            table.take_result_route(&mut result_for(&cmd, true)),
            ResultRoute::Drop
        ));
    }
}
