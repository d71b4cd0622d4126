use core::fmt;
use core::str::FromStr;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{NativeError, NodeEventSink, SocketEvent};

/// 原始套接字的事件出口：单消费者、无界，由持有该套接字的适配器独占接收端。
pub type SocketEventSink = mpsc::UnboundedSender<SocketEvent>;

/// 监听端点的入站连接出口。
pub type AcceptSink = mpsc::UnboundedSender<Result<Incoming, NativeError>>;

/// 地址族。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// 另一种地址族，用于“先 IPv6 后 IPv4”式的回退。
    pub const fn other(self) -> Self {
        match self {
            Self::Ipv4 => Self::Ipv6,
            Self::Ipv6 => Self::Ipv4,
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ipv4 => "IPv4",
            Self::Ipv6 => "IPv6",
        })
    }
}

/// 一条连接的本端与对端地址。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AddrInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// 虚拟网络标识：16 位十六进制字符串，内部以 `u64` 保存。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 网络标识在引擎侧是定长字符串，格式错误的输入应在调用前被拒绝，而不是
///   变成一次失败的原生调用；
///
/// ## 契约 (What)
/// - `FromStr` 只接受恰好 16 个十六进制字符（大小写均可）；
/// - `Display` 输出 16 位小写十六进制，与解析互逆。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(u64);

impl NetworkId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// 网络标识解析失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("network id must be 16 hexadecimal digits, got `{input}`")]
pub struct ParseNetworkIdError {
    pub input: String,
}

impl FromStr for NetworkId {
    type Err = ParseNetworkIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseNetworkIdError {
            input: s.to_owned(),
        };
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        u64::from_str_radix(s, 16).map(Self).map_err(|_| invalid())
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// 节点身份：40 位地址，展示为 10 位十六进制。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

/// 监听端点交付的一条入站连接：原始套接字已处于连接态。
#[derive(Clone)]
pub struct Incoming {
    pub socket: Arc<dyn NativeSocket>,
    pub addr: AddrInfo,
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// 节点与网络控制面。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - `init_from_storage`/`init_from_key` 必须在 `start` 之前调用，引擎启动后不再
///   接受身份变更；
/// - `start` 接收唯一的事件回调，之后无法重新绑定；
/// - `is_online`/`is_transport_ready` 是可重复查询的布尔条件，不提供唤醒原语；
/// - `resolve_address` 在请求的地址族没有分配地址时返回 [`NativeError::NoResult`]。
///
/// ## 注意事项 (Trade-offs)
/// - 接口不做状态校验，调用顺序由上层的生命周期协调器保证。
pub trait NodeControl: Send + Sync + 'static {
    fn init_from_storage(&self, path: &Path) -> Result<(), NativeError>;
    fn init_from_key(&self, key: &[u8]) -> Result<(), NativeError>;
    fn start(&self, sink: NodeEventSink) -> Result<(), NativeError>;
    fn is_online(&self) -> bool;
    fn node_id(&self) -> NodeId;
    fn stop(&self) -> Result<(), NativeError>;
    fn free(&self);
    /// 节点是否阻止宿主进程退出（ref/unref）。
    fn set_keep_alive(&self, keep_alive: bool);

    fn join(&self, network: NetworkId) -> Result<(), NativeError>;
    fn leave(&self, network: NetworkId) -> Result<(), NativeError>;
    fn is_transport_ready(&self, network: NetworkId) -> bool;
    fn resolve_address(
        &self,
        network: NetworkId,
        family: AddressFamily,
    ) -> Result<IpAddr, NativeError>;
}

/// 套接字与监听端点的工厂。
#[async_trait]
pub trait TcpControl: Send + Sync + 'static {
    /// 创建一个未连接的原始套接字。
    fn create_socket(&self) -> Result<Arc<dyn NativeSocket>, NativeError>;

    /// 绑定并开始监听；入站连接通过 `accept` 投递，监听关闭后发送端被释放。
    async fn bind(
        &self,
        addr: SocketAddr,
        accept: AcceptSink,
    ) -> Result<Arc<dyn NativeListener>, NativeError>;
}

/// 完整的原生能力面。
pub trait NativeStack: NodeControl + TcpControl {}

impl<T: NodeControl + TcpControl> NativeStack for T {}

/// 以确认驱动流控的原始套接字。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - `set_event_sink` 必须先于其他调用；在此之前产生的事件由实现缓存；
/// - `connect` 立即返回，结果以 `Connect`/`ConnectError` 事件送达；
/// - `send` 返回协议栈实际接收的字节数，可能小于 `data.len()`，发送缓冲有空间
///   后会收到 `Sent` 事件；
/// - `ack(n)` 告知协议栈已消费 `n` 个接收字节，从而释放接收窗口；
/// - `shutdown_write` 关闭写方向，确认后送达 `Close`。
#[async_trait]
pub trait NativeSocket: Send + Sync + 'static {
    fn set_event_sink(&self, sink: SocketEventSink);
    fn connect(&self, remote: SocketAddr) -> Result<(), NativeError>;
    async fn send(&self, data: Bytes) -> Result<usize, NativeError>;
    fn ack(&self, len: usize);
    fn shutdown_write(&self);
    fn set_keep_alive(&self, keep_alive: bool);
    fn set_nagle(&self, enabled: bool);
}

/// 原生监听端点。
#[async_trait]
pub trait NativeListener: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;
    async fn close(&self) -> Result<(), NativeError>;
    fn set_keep_alive(&self, keep_alive: bool);
}
