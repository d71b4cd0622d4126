//! 节点配置：轮询策略与启动参数的 TOML 表示。
//!
//! ## 契约（What）
//! - 所有字段都有默认值，空文档即得到与内置常量一致的配置；
//! - 解析后立即校验，非法取值以 [`ConfigError::Invalid`] 报告字段名与原因。
//!
//! ```toml
//! storage_path = "/var/lib/zerolink"
//! keep_alive = false
//!
//! [poll]
//! interval_ms = 50
//! deadline_ms = 30000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::options::{Identity, StartOptions};

/// 默认轮询间隔（毫秒）。
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// 配置解析或校验失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "zerolink.config.parse_failed",
            Self::Invalid { .. } => "zerolink.config.invalid",
        }
    }
}

/// 就绪条件的轮询策略。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 原生层只提供可重复查询的布尔条件，没有唤醒原语；轮询间隔决定了响应延迟与
///   空转开销之间的折中，截止时间则避免网络永远不就绪时调用方无限挂起。
///
/// ## 契约 (What)
/// - `interval_ms` 必须大于 0；
/// - `deadline_ms = None` 表示不设截止时间，`Some(0)` 被视为非法。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub deadline_ms: Option<u64>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            deadline_ms: None,
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, deadline: Option<Duration>) -> Result<Self, ConfigError> {
        let policy = Self {
            interval_ms: duration_ms(interval),
            deadline_ms: deadline.map(duration_ms),
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll.interval_ms",
                reason: "must be greater than zero",
            });
        }
        if self.deadline_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "poll.deadline_ms",
                reason: "must be greater than zero when set",
            });
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// 节点级配置。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// 身份存储目录；缺省时节点生成临时身份。
    pub storage_path: Option<PathBuf>,
    /// 启动后是否阻止宿主进程退出；缺省时沿用原生层默认值。
    pub keep_alive: Option<bool>,
    pub poll: PollPolicy,
}

impl NodeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(input).map_err(|err| ConfigError::Parse(err.message().to_owned()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.storage_path
            && path.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid {
                field: "storage_path",
                reason: "must not be empty",
            });
        }
        self.poll.validate()
    }

    /// 由配置得到启动参数；事件监听器需另行设置。
    pub fn start_options(&self) -> StartOptions {
        StartOptions {
            identity: self.storage_path.clone().map(Identity::Storage),
            keep_alive: self.keep_alive,
            ..StartOptions::default()
        }
    }
}
