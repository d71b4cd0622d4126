use core::fmt;
use thiserror::Error;

/// 原生 TCP/IP 栈回报的套接字错误码。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 建连失败、连接中止等事件只携带一个整数，保留原始数值才能让上层在
///   错误里把它原样交还给调用方检查；
/// - 以关联常量命名常见取值，避免在重试策略里散落魔法数字。
///
/// ## 契约 (What)
/// - 取值与内嵌协议栈保持一致：`0` 表示成功，负数表示具体错误；
/// - [`ErrorCode::is_routing_failure`] 仅对 `RTE` 返回 `true`，这是唯一被视为
///   “瞬时”的建连失败类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const OK: Self = Self(0);
    pub const MEM: Self = Self(-1);
    pub const BUF: Self = Self(-2);
    pub const TIMEOUT: Self = Self(-3);
    pub const RTE: Self = Self(-4);
    pub const INPROGRESS: Self = Self(-5);
    pub const VAL: Self = Self(-6);
    pub const WOULDBLOCK: Self = Self(-7);
    pub const USE: Self = Self(-8);
    pub const ALREADY: Self = Self(-9);
    pub const ISCONN: Self = Self(-10);
    pub const CONN: Self = Self(-11);
    pub const IF: Self = Self(-12);
    pub const ABRT: Self = Self(-13);
    pub const RST: Self = Self(-14);
    pub const CLSD: Self = Self(-15);
    pub const ARG: Self = Self(-16);

    /// 原始数值。
    pub const fn value(self) -> i32 {
        self.0
    }

    /// 是否为路由失败（对端暂不可达），仅此类失败允许建连重试。
    pub const fn is_routing_failure(self) -> bool {
        self.0 == Self::RTE.0
    }

    /// 稳定的符号名，供日志字段使用；未知取值返回 `None`。
    pub const fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "ERR_OK",
            -1 => "ERR_MEM",
            -2 => "ERR_BUF",
            -3 => "ERR_TIMEOUT",
            -4 => "ERR_RTE",
            -5 => "ERR_INPROGRESS",
            -6 => "ERR_VAL",
            -7 => "ERR_WOULDBLOCK",
            -8 => "ERR_USE",
            -9 => "ERR_ALREADY",
            -10 => "ERR_ISCONN",
            -11 => "ERR_CONN",
            -12 => "ERR_IF",
            -13 => "ERR_ABRT",
            -14 => "ERR_RST",
            -15 => "ERR_CLSD",
            -16 => "ERR_ARG",
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}({})", self.0),
            None => write!(f, "code({})", self.0),
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// 原生调用的失败结果。
///
/// 服务级状态码（`-2..=-5`）与套接字错误码分开建模：前者描述“调用本身不被允许”，
/// 后者描述协议栈内部的连接状态。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NativeError {
    /// 协议栈套接字错误，携带原始错误码。
    #[error("native socket error {0}")]
    Socket(ErrorCode),
    /// 当前不允许该操作，通常意味着节点尚未启动。
    #[error("native service rejected the operation")]
    Service,
    /// 参数非法。
    #[error("invalid argument passed to native layer")]
    InvalidArgument,
    /// 没有结果，例如请求的地址族尚未分配地址。
    #[error("native layer returned no result")]
    NoResult,
    #[error("general native failure")]
    General,
}

impl NativeError {
    /// 根据服务级状态码构造错误；`0` 表示成功，返回 `None`。
    ///
    /// `-1`（套接字错误）需要额外的 errno，这里以 `ERR_VAL` 占位。
    pub fn from_status(status: i32) -> Option<Self> {
        match status {
            0 => None,
            -1 => Some(Self::Socket(ErrorCode::VAL)),
            -2 => Some(Self::Service),
            -3 => Some(Self::InvalidArgument),
            -4 => Some(Self::NoResult),
            _ => Some(Self::General),
        }
    }

    /// 若为套接字错误则返回其错误码。
    pub fn socket_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Socket(code) => Some(*code),
            _ => None,
        }
    }
}
