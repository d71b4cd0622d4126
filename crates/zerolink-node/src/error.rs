use std::time::Duration;

use thiserror::Error;
use zerolink_native::{AddressFamily, NativeError, NetworkId};

/// 错误的处置分类，供上层决定“重试 / 放弃 / 视为编程错误”。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 调用方往往只关心“能否重试、多久后重试”，而不关心具体变体；稳定的分类让重试、
///   告警与日志聚合逻辑不必逐一匹配错误枚举。
///
/// ## 契约 (What)
/// - `Retryable { after }`：同一操作在 `after` 之后重试有意义；
/// - `Timeout`：等待超过配置的截止时间，是否重试由调用方决定；
/// - `ContractViolation`：调用顺序或参数违反契约，重试不会成功；
/// - `NonRetryable`：其余终止性失败。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Retryable { after: Duration },
    Timeout,
    ContractViolation,
    NonRetryable,
}

/// 非法的生命周期跃迁。总是同步返回，且不会产生任何原生副作用。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("node is already started")]
    AlreadyStarted,
    #[error("node has been freed")]
    AlreadyFreed,
    #[error("node was never started")]
    NeverStarted,
    #[error("node is not running")]
    NotRunning,
}

impl LifecycleError {
    /// 稳定错误码。
    pub const fn code(self) -> &'static str {
        match self {
            Self::AlreadyStarted => "zerolink.node.already_started",
            Self::AlreadyFreed => "zerolink.node.already_freed",
            Self::NeverStarted => "zerolink.node.never_started",
            Self::NotRunning => "zerolink.node.not_running",
        }
    }
}

/// 生命周期协调器的失败结果。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("network {network} has no {family} address assigned")]
    AddressUnavailable {
        network: NetworkId,
        family: AddressFamily,
    },
    #[error("waiting for {operation} gave up after {waited:?}")]
    Timeout {
        operation: &'static str,
        waited: Duration,
    },
    #[error("native call `{call}` failed: {source}")]
    Native {
        call: &'static str,
        #[source]
        source: NativeError,
    },
}

impl NodeError {
    pub(crate) fn native(call: &'static str) -> impl FnOnce(NativeError) -> Self {
        move |source| Self::Native { call, source }
    }

    /// 稳定错误码，形如 `zerolink.<域>.<语义>`。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Lifecycle(err) => err.code(),
            Self::AddressUnavailable { .. } => "zerolink.node.address_unavailable",
            Self::Timeout { .. } => "zerolink.node.timeout",
            Self::Native { .. } => "zerolink.node.native_failed",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Lifecycle(_) => ErrorCategory::ContractViolation,
            Self::AddressUnavailable { .. } => ErrorCategory::NonRetryable,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Native {
                source: NativeError::Service,
                ..
            } => ErrorCategory::Retryable {
                after: Duration::from_millis(50),
            },
            Self::Native { .. } => ErrorCategory::NonRetryable,
        }
    }
}
