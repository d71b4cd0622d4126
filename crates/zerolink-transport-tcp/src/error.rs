use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use zerolink_native::{ErrorCode, NativeError};
use zerolink_node::{ConfigError, ErrorCategory, NodeError};

use crate::retry::DEFAULT_BACKOFF_MS;

/// 在不兼容状态下调用套接字或监听端点。总是同步返回，且对该次调用是致命的。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("server is already binding or listening")]
    AlreadyListening,
    #[error("server is not listening")]
    NotListening,
    #[error("write after end")]
    WriteAfterEnd,
    #[error("socket is already connected")]
    AlreadyConnected,
    #[error("invalid option `{0}`")]
    InvalidOptions(&'static str),
}

impl ContractViolation {
    pub const fn code(self) -> &'static str {
        match self {
            Self::AlreadyListening => "zerolink.transport.tcp.already_listening",
            Self::NotListening => "zerolink.transport.tcp.not_listening",
            Self::WriteAfterEnd => "zerolink.transport.tcp.write_after_end",
            Self::AlreadyConnected => "zerolink.transport.tcp.already_connected",
            Self::InvalidOptions(_) => "zerolink.transport.tcp.invalid_options",
        }
    }
}

/// 流适配器与准入层的失败结果。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 同一个故障需要同时交给读方、写方与 `closed()` 的等待者，因此错误实现 `Clone`；
/// - 每个变体带稳定错误码（`zerolink.transport.tcp.*`）与处置分类，日志与重试逻辑
///   不必解析文案。
///
/// ## 契约 (What)
/// - `Connect`：建连失败，携带原生错误码与已尝试次数；路由失败已按重试策略重试过；
/// - `SocketFault`：连接被中止或重置，流异常终止；
/// - `Bind`：监听失败，以服务端 `Error` 事件交付，而非 `listen` 的返回值；
/// - `Config`：参数文本无法解析，保留解析器给出的原因；
/// - 转换为 `io::Error` 时按原生错误码选择最接近的 `io::ErrorKind`。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TcpError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("connect failed with {code} after {attempts} attempt(s)")]
    Connect { code: ErrorCode, attempts: u32 },
    #[error("socket fault {code}")]
    SocketFault { code: ErrorCode },
    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: NativeError,
    },
    #[error("native call `{call}` failed: {source}")]
    Native {
        call: &'static str,
        #[source]
        source: NativeError,
    },
}

impl TcpError {
    pub(crate) fn native(call: &'static str) -> impl FnOnce(NativeError) -> Self {
        move |source| Self::Native { call, source }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Node(err) => err.code(),
            Self::Contract(violation) => violation.code(),
            Self::Config(err) => err.code(),
            Self::Connect { .. } => "zerolink.transport.tcp.connect_failed",
            Self::SocketFault { .. } => "zerolink.transport.tcp.socket_fault",
            Self::Bind { .. } => "zerolink.transport.tcp.bind_failed",
            Self::Native { .. } => "zerolink.transport.tcp.native_failed",
        }
    }

    /// 原生错误码（若有）。
    pub fn native_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Connect { code, .. } | Self::SocketFault { code } => Some(*code),
            Self::Bind { source, .. } | Self::Native { source, .. } => source.socket_code(),
            Self::Node(_) | Self::Contract(_) | Self::Config(_) => None,
        }
    }

    /// 处置分类。路由失败的建议等待时间取默认重试策略的退避间隔
    /// （[`DEFAULT_BACKOFF_MS`]），与建连自身使用的策略无关。
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Node(err) => err.category(),
            Self::Contract(_) => ErrorCategory::ContractViolation,
            Self::Connect { code, .. } if code.is_routing_failure() => ErrorCategory::Retryable {
                after: Duration::from_millis(DEFAULT_BACKOFF_MS),
            },
            Self::Bind { source, .. } if source.socket_code() == Some(ErrorCode::USE) => {
                ErrorCategory::Retryable {
                    after: Duration::from_millis(50),
                }
            }
            _ => ErrorCategory::NonRetryable,
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        use io::ErrorKind;
        match self {
            Self::Node(NodeError::Timeout { .. }) => ErrorKind::TimedOut,
            Self::Node(_) => ErrorKind::NotConnected,
            Self::Contract(ContractViolation::WriteAfterEnd) => ErrorKind::BrokenPipe,
            Self::Contract(_) | Self::Config(_) => ErrorKind::InvalidInput,
            Self::Connect { code, .. } if code.is_routing_failure() => ErrorKind::HostUnreachable,
            Self::Connect { code, .. } if *code == ErrorCode::TIMEOUT => ErrorKind::TimedOut,
            Self::Connect { .. } => ErrorKind::ConnectionRefused,
            Self::SocketFault { code } => match *code {
                ErrorCode::RST => ErrorKind::ConnectionReset,
                ErrorCode::ABRT => ErrorKind::ConnectionAborted,
                ErrorCode::CLSD => ErrorKind::BrokenPipe,
                ErrorCode::CONN => ErrorKind::NotConnected,
                _ => ErrorKind::Other,
            },
            Self::Bind { source, .. } => match source.socket_code() {
                Some(ErrorCode::USE) => ErrorKind::AddrInUse,
                _ => ErrorKind::AddrNotAvailable,
            },
            Self::Native { .. } => ErrorKind::Other,
        }
    }
}

impl From<TcpError> for io::Error {
    fn from(error: TcpError) -> Self {
        io::Error::new(error.io_kind(), error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_faults_map_to_matching_io_kinds() {
        let reset: io::Error = TcpError::SocketFault {
            code: ErrorCode::RST,
        }
        .into();
        assert_eq!(reset.kind(), io::ErrorKind::ConnectionReset);

        let aborted: io::Error = TcpError::SocketFault {
            code: ErrorCode::ABRT,
        }
        .into();
        assert_eq!(aborted.kind(), io::ErrorKind::ConnectionAborted);

        let ended: io::Error = TcpError::from(ContractViolation::WriteAfterEnd).into();
        assert_eq!(ended.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn io_error_keeps_the_original_error_as_source() {
        let err: io::Error = TcpError::Connect {
            code: ErrorCode::RTE,
            attempts: 121,
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::HostUnreachable);
        let inner = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<TcpError>())
            .expect("inner TcpError");
        assert_eq!(inner.native_code(), Some(ErrorCode::RTE));
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(matches!(
            TcpError::Connect {
                code: ErrorCode::RTE,
                attempts: 1
            }
            .category(),
            ErrorCategory::Retryable { .. }
        ));
        assert_eq!(
            TcpError::Connect {
                code: ErrorCode::RTE,
                attempts: 121
            }
            .category(),
            ErrorCategory::Retryable {
                after: Duration::from_millis(DEFAULT_BACKOFF_MS)
            }
        );
        assert_eq!(
            TcpError::Config(ConfigError::Parse("expected `=`".into())).category(),
            ErrorCategory::NonRetryable
        );
        assert_eq!(
            TcpError::Connect {
                code: ErrorCode::RST,
                attempts: 1
            }
            .category(),
            ErrorCategory::NonRetryable
        );
        assert_eq!(
            TcpError::from(ContractViolation::NotListening).code(),
            "zerolink.transport.tcp.not_listening"
        );
    }
}
