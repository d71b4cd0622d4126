use crate::LifecycleError;

/// 节点生命周期状态。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - `Uninitialized → Started ⇄ Stopped`，`Started`/`Stopped → Freed`；
/// - `Freed` 为终止态，只允许自身的幂等跃迁；
/// - 跃迁受 [`NodeState::can_transition_to`] 限制，非法跃迁由
///   [`NodeState::check_transition`] 翻译为具体的 [`LifecycleError`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    Uninitialized,
    Started,
    Stopped,
    Freed,
}

impl NodeState {
    /// 通过匹配元组 `(self, target)` 判定状态图中的合法边。
    pub fn can_transition_to(self, target: NodeState) -> bool {
        matches!(
            (self, target),
            (NodeState::Uninitialized, NodeState::Started)
                | (NodeState::Started, NodeState::Stopped)
                | (NodeState::Stopped, NodeState::Started)
                | (NodeState::Started, NodeState::Freed)
                | (NodeState::Stopped, NodeState::Freed)
                | (NodeState::Freed, NodeState::Freed)
        )
    }

    /// 与 [`can_transition_to`](Self::can_transition_to) 一致，但在非法时给出原因。
    pub fn check_transition(self, target: NodeState) -> Result<(), LifecycleError> {
        if self.can_transition_to(target) {
            return Ok(());
        }
        Err(match (self, target) {
            (NodeState::Freed, _) => LifecycleError::AlreadyFreed,
            (NodeState::Started, NodeState::Started) => LifecycleError::AlreadyStarted,
            (NodeState::Uninitialized, NodeState::Freed) => LifecycleError::NeverStarted,
            _ => LifecycleError::NotRunning,
        })
    }

    pub fn is_running(self) -> bool {
        matches!(self, NodeState::Started)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Freed)
    }
}
