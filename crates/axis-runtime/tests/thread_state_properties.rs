use axis_runtime::{ThreadState, ThreadStateMachine};
use proptest::prelude::*;

fn any_state() -> impl Strategy<Value = ThreadState> {
    proptest::sample::select(ThreadState::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    /// 任意迁移序列下，状态只前进、从不回退；被拒绝的迁移不改变状态。
    #[test]
    fn transitions_are_monotonic(targets in proptest::collection::vec(any_state(), 0..24)) {
        let mut machine = ThreadStateMachine::new();
        let mut visited = vec![machine.state()];

        for target in targets {
            let before = machine.state();
            match machine.transition(target) {
                Ok(from) => {
                    prop_assert_eq!(from, before);
                    prop_assert!(target > before, "接受的迁移必须前进：{} -> {}", before, target);
                    prop_assert_eq!(machine.state(), target);
                    visited.push(target);
                }
                Err(err) => {
                    prop_assert!(target <= before, "拒绝的迁移只能是回退或原地：{} -> {}", before, target);
                    prop_assert_eq!(err.from, before);
                    prop_assert_eq!(machine.state(), before, "拒绝不改变状态");
                }
            }
        }

        prop_assert!(visited.windows(2).all(|pair| pair[0] < pair[1]));
    }

    /// `Closed` 是吸收态。
    #[test]
    fn closed_is_terminal(target in any_state()) {
        let mut machine = ThreadStateMachine::new();
        machine.transition(ThreadState::Closed).expect("任意状态都可直接关闭");
        prop_assert!(machine.transition(target).is_err());
        prop_assert!(!machine.can_transition(target));
        prop_assert_eq!(machine.state(), ThreadState::Closed);
    }
}

#[test]
fn display_names_follow_the_lifecycle() {
    let names: Vec<_> = ThreadState::ALL.iter().map(|state| state.to_string()).collect();
    assert_eq!(names.len(), 5);
    assert_eq!(ThreadState::default(), ThreadState::Init);
    assert!(ThreadState::ALL.windows(2).all(|pair| pair[0] < pair[1]), "ALL 按生命周期排序");
}
