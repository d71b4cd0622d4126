//! 建连重试策略。
//!
//! ## 意图（Why）
//! - 虚拟网络中对端路由建立需要时间，刚入网时的建连常以路由失败（`ERR_RTE`）告终；
//!   这类失败是瞬时的，按固定间隔重试即可成功，其余错误码则应立即上报。
//!
//! ## 契约（What）
//! - [`ConnectRetryPolicy`]：最多重试次数、重试间隔与可重试错误码集合，默认
//!   `120 / 250ms / [ERR_RTE]`；
//! - [`ConnectAttempt`]：一次 `connect` 调用的重试预算，每次失败消费一次，成功后丢弃；
//! - 总尝试次数上限为 `max_retries + 1`。

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zerolink_native::ErrorCode;

use crate::ContractViolation;

pub const DEFAULT_MAX_RETRIES: u32 = 120;
pub const DEFAULT_BACKOFF_MS: u64 = 250;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectRetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// 原生错误码数值。
    pub retryable_codes: Vec<i32>,
}

impl Default for ConnectRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_ms: DEFAULT_BACKOFF_MS,
            retryable_codes: vec![ErrorCode::RTE.value()],
        }
    }
}

impl ConnectRetryPolicy {
    /// 不重试：首个失败即为终止结果。
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn is_retryable(&self, code: ErrorCode) -> bool {
        self.retryable_codes.contains(&code.value())
    }

    pub fn validate(&self) -> Result<(), ContractViolation> {
        if self.max_retries > 0 && self.backoff_ms == 0 {
            return Err(ContractViolation::InvalidOptions("retry.backoff_ms"));
        }
        Ok(())
    }

    pub fn begin(&self, remote: SocketAddr) -> ConnectAttempt {
        ConnectAttempt {
            remote,
            policy: self.clone(),
            retries: 0,
        }
    }
}

/// 一次失败之后的处置。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待 `after` 后发起第 `retry` 次重试。
    Retry { after: Duration, retry: u32 },
    /// 终止，`attempts` 为包含首次在内的总尝试次数。
    GiveUp { code: ErrorCode, attempts: u32 },
}

/// 单次建连调用的重试状态。
#[derive(Clone, Debug)]
pub struct ConnectAttempt {
    remote: SocketAddr,
    policy: ConnectRetryPolicy,
    retries: u32,
}

impl ConnectAttempt {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn remaining(&self) -> u32 {
        self.policy.max_retries.saturating_sub(self.retries)
    }

    pub fn on_failure(&mut self, code: ErrorCode) -> RetryDecision {
        if self.policy.is_retryable(code) && self.remaining() > 0 {
            self.retries += 1;
            return RetryDecision::Retry {
                after: self.policy.backoff(),
                retry: self.retries,
            };
        }
        RetryDecision::GiveUp {
            code,
            attempts: self.retries + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "10.147.17.2:8080".parse().expect("addr")
    }

    #[test]
    fn routing_failures_retry_until_budget_is_spent() {
        let mut attempt = ConnectRetryPolicy::default().begin(remote());
        for expected in 1..=DEFAULT_MAX_RETRIES {
            assert_eq!(
                attempt.on_failure(ErrorCode::RTE),
                RetryDecision::Retry {
                    after: Duration::from_millis(250),
                    retry: expected,
                }
            );
        }
        assert_eq!(attempt.remaining(), 0);
        assert_eq!(
            attempt.on_failure(ErrorCode::RTE),
            RetryDecision::GiveUp {
                code: ErrorCode::RTE,
                attempts: 121,
            }
        );
    }

    #[test]
    fn other_codes_are_terminal_immediately() {
        let mut attempt = ConnectRetryPolicy::default().begin(remote());
        assert_eq!(
            attempt.on_failure(ErrorCode::RST),
            RetryDecision::GiveUp {
                code: ErrorCode::RST,
                attempts: 1,
            }
        );
        assert_eq!(attempt.retries(), 0);
    }

    #[test]
    fn never_policy_gives_up_on_first_failure() {
        let mut attempt = ConnectRetryPolicy::never().begin(remote());
        assert!(matches!(
            attempt.on_failure(ErrorCode::RTE),
            RetryDecision::GiveUp { attempts: 1, .. }
        ));
    }

    #[test]
    fn policy_loads_from_toml() {
        let policy: ConnectRetryPolicy =
            toml::from_str("max_retries = 3\nretryable_codes = [-4, -3]").expect("policy");
        assert_eq!(policy.backoff(), Duration::from_millis(250));
        assert!(policy.is_retryable(ErrorCode::TIMEOUT));
        assert!(policy.validate().is_ok());
        let zero = ConnectRetryPolicy {
            backoff_ms: 0,
            ..ConnectRetryPolicy::default()
        };
        assert_eq!(
            zero.validate(),
            Err(ContractViolation::InvalidOptions("retry.backoff_ms"))
        );
    }
}
