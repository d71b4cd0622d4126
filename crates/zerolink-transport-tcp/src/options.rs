use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use zerolink_node::ConfigError;

use crate::{ConnectRetryPolicy, ContractViolation, TcpError};

/// 默认读缓冲高水位（字节）。
pub const DEFAULT_READ_HIGH_WATER: usize = 16 * 1024;

/// 单个流适配器的参数。
///
/// - `read_high_water`：面向消费者的缓冲上限；缓冲为空时即便单块超过上限也会被接收；
/// - `allow_half_open = false` 时，读方向结束后自动结束写方向；
/// - `no_delay = true` 时关闭 Nagle 合并。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketOptions {
    pub read_high_water: usize,
    pub allow_half_open: bool,
    pub no_delay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            read_high_water: DEFAULT_READ_HIGH_WATER,
            allow_half_open: true,
            no_delay: false,
        }
    }
}

impl SocketOptions {
    pub fn validate(&self) -> Result<(), ContractViolation> {
        if self.read_high_water == 0 {
            return Err(ContractViolation::InvalidOptions("socket.read_high_water"));
        }
        Ok(())
    }
}

/// 主动建连参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub remote: SocketAddr,
    #[serde(default)]
    pub socket: SocketOptions,
    #[serde(default)]
    pub retry: ConnectRetryPolicy,
}

impl ConnectOptions {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            socket: SocketOptions::default(),
            retry: ConnectRetryPolicy::default(),
        }
    }

    pub fn with_socket(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_retry(mut self, retry: ConnectRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ContractViolation> {
        if self.remote.port() == 0 {
            return Err(ContractViolation::InvalidOptions("remote.port"));
        }
        if self.remote.ip().is_unspecified() {
            return Err(ContractViolation::InvalidOptions("remote.ip"));
        }
        self.socket.validate()?;
        self.retry.validate()
    }
}

/// 监听参数；端口为 0 时由原生层分配。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenOptions {
    pub addr: SocketAddr,
}

impl ListenOptions {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// 在所有地址上监听 `port`。
    pub fn port(port: u16) -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }
}

/// 准入层参数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerOptions {
    /// 活动连接上限；`None` 表示不限。
    pub max_connections: Option<usize>,
    /// 应用于每个被接受连接的参数。
    pub socket: SocketOptions,
}

impl ServerOptions {
    /// 从 TOML 文本加载；解析失败保留解析器的原因，取值非法报告具体字段。
    pub fn from_toml_str(input: &str) -> Result<Self, TcpError> {
        let options: Self =
            toml::from_str(input).map_err(|err| ConfigError::Parse(err.message().to_owned()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn validate(&self) -> Result<(), ContractViolation> {
        self.socket.validate()
    }
}
