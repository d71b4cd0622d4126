//! 生命周期状态机性质验证
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：对任意操作序列，`NodeHandle` 的结果必须与影子模型一致；非法操作
//!   同步失败且不产生任何原生调用，`free` 在释放后保持幂等。
//! - **设计手法 (How)**：Proptest 生成 `Op` 序列，每个用例在独立的单线程、暂停时钟运行时上
//!   执行；仿真节点的调用记录用于判定“是否触达原生层”。
//! - **合同 (What)**：合法操作至少追加一条原生调用记录，非法操作不追加；最终状态与模型相同。

use proptest::prelude::*;
use zerolink_native::NetworkId;
use zerolink_native::sim::{SimConfig, SimNetwork};
use zerolink_node::{LifecycleError, NodeError, NodeHandle, NodeState, StartOptions};

#[derive(Clone, Copy, Debug)]
enum Op {
    Start,
    Stop,
    Free,
    Join,
    Leave,
    KeepAlive(bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Start),
        Just(Op::Stop),
        Just(Op::Free),
        Just(Op::Join),
        Just(Op::Leave),
        any::<bool>().prop_map(Op::KeepAlive),
    ]
}

/// 影子模型：给出期望的结果与下一状态。
fn expected(state: NodeState, op: Op) -> (Result<(), LifecycleError>, NodeState) {
    use NodeState::*;
    match (op, state) {
        (Op::Start, Uninitialized | Stopped) => (Ok(()), Started),
        (Op::Start, Started) => (Err(LifecycleError::AlreadyStarted), state),
        (Op::Start, Freed) => (Err(LifecycleError::AlreadyFreed), state),
        (Op::Stop, Started) => (Ok(()), Stopped),
        (Op::Free, Uninitialized) => (Err(LifecycleError::NeverStarted), state),
        (Op::Free, _) => (Ok(()), Freed),
        (Op::Join | Op::Leave | Op::KeepAlive(_), Started) => (Ok(()), state),
        (_, Freed) => (Err(LifecycleError::AlreadyFreed), state),
        _ => (Err(LifecycleError::NotRunning), state),
    }
}

async fn apply(node: &NodeHandle, op: Op) -> Result<(), NodeError> {
    let network = NetworkId::new(0x8056_c2e2_1c00_0001);
    match op {
        Op::Start => node.start(StartOptions::default()).await.map(|_| ()),
        Op::Stop => node.stop(),
        Op::Free => node.free(),
        Op::Join => node.join_network(network).await,
        Op::Leave => node.leave_network(network),
        Op::KeepAlive(keep) => node.set_keep_alive(keep),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_lifecycle_matches_model(ops in prop::collection::vec(op(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");
        let sim = SimNetwork::new().node(SimConfig {
            online_after_polls: 1,
            ready_after_polls: 1,
            ..SimConfig::default()
        });
        let node = NodeHandle::new(sim.clone());
        let mut model = NodeState::Uninitialized;

        for op in ops {
            let calls_before = sim.calls().len();
            let (want, next) = expected(model, op);
            let got = runtime.block_on(apply(&node, op));
            prop_assert_eq!(got, want.map_err(NodeError::from), "op {:?} from {:?}", op, model);

            let touched_native = sim.calls().len() > calls_before;
            let idempotent_free = matches!((op, model), (Op::Free, NodeState::Freed));
            prop_assert_eq!(touched_native, want.is_ok() && !idempotent_free);

            model = next;
            prop_assert_eq!(node.state(), model);
        }
    }
}
