use std::sync::Arc;

use bytes::Bytes;

use crate::{AddrInfo, ErrorCode};

/// 原生节点事件回调。
///
/// 节点在启动时接收唯一的回调实例；引擎的内部线程会直接调用它，因此实现必须
/// `Send + Sync` 且不得阻塞。
pub type NodeEventSink = Arc<dyn Fn(NodeEvent) + Send + Sync>;

/// 原始套接字上报的异步事件。
///
/// # 契约 (What)
/// - `Connect`：建连成功，携带本端/对端地址；
/// - `ConnectError`：建连失败，携带原生错误码；
/// - `Data(Some)`：按发送顺序送达的字节块；`Data(None)` 表示对端半关闭；
/// - `Sent(n)`：发送缓冲释放了 `n` 字节，可据此继续写入；
/// - `Close`：写半关闭已被协议栈确认，或连接已被协议栈关闭；
/// - `Error`：连接被中止或重置，流应异常终止。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    Connect(AddrInfo),
    ConnectError(ErrorCode),
    Data(Option<Bytes>),
    Sent(usize),
    Close,
    Error(ErrorCode),
}

/// 节点级事件码。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 引擎以整数上报节点、网络、协议栈、网卡、对等体、路由、地址与持久化事件；
///   将其映射为枚举后，监听方可以直接 `match`，同时 [`NodeEvent::Unknown`]
///   保证新版引擎新增的事件码不会丢失。
///
/// ## 契约 (What)
/// - `from_code(code).code() == code` 对任意整数成立；
/// - [`NodeEvent::is_status_change`] 标记会影响“在线/传输就绪”判断的事件，
///   生命周期协调器据此提前唤醒轮询。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NodeEvent {
    NodeUp,
    NodeOnline,
    NodeOffline,
    NodeDown,
    /// 身份与其他节点冲突等致命错误，需要删除身份后重新初始化。
    NodeFatalError,
    NetworkNotFound,
    NetworkClientTooOld,
    NetworkRequestConfig,
    NetworkOk,
    NetworkAccessDenied,
    NetworkReadyIp4,
    NetworkReadyIp6,
    NetworkReadyIp4Ip6,
    NetworkDown,
    NetworkUpdate,
    StackUp,
    StackDown,
    NetifUp,
    NetifDown,
    NetifRemoved,
    NetifLinkUp,
    NetifLinkDown,
    PeerDirect,
    PeerRelay,
    PeerUnreachable,
    PeerPathDiscovered,
    PeerPathDead,
    RouteAdded,
    RouteRemoved,
    AddrAddedIp4,
    AddrRemovedIp4,
    AddrAddedIp6,
    AddrRemovedIp6,
    StoreIdentitySecret,
    StoreIdentityPublic,
    StorePlanet,
    StorePeer,
    StoreNetwork,
    Unknown(i32),
}

impl NodeEvent {
    pub fn from_code(code: i32) -> Self {
        match code {
            200 => Self::NodeUp,
            201 => Self::NodeOnline,
            202 => Self::NodeOffline,
            203 => Self::NodeDown,
            204 => Self::NodeFatalError,
            210 => Self::NetworkNotFound,
            211 => Self::NetworkClientTooOld,
            212 => Self::NetworkRequestConfig,
            213 => Self::NetworkOk,
            214 => Self::NetworkAccessDenied,
            215 => Self::NetworkReadyIp4,
            216 => Self::NetworkReadyIp6,
            217 => Self::NetworkReadyIp4Ip6,
            218 => Self::NetworkDown,
            219 => Self::NetworkUpdate,
            220 => Self::StackUp,
            221 => Self::StackDown,
            230 => Self::NetifUp,
            231 => Self::NetifDown,
            232 => Self::NetifRemoved,
            233 => Self::NetifLinkUp,
            234 => Self::NetifLinkDown,
            240 => Self::PeerDirect,
            241 => Self::PeerRelay,
            242 => Self::PeerUnreachable,
            243 => Self::PeerPathDiscovered,
            244 => Self::PeerPathDead,
            250 => Self::RouteAdded,
            251 => Self::RouteRemoved,
            260 => Self::AddrAddedIp4,
            261 => Self::AddrRemovedIp4,
            262 => Self::AddrAddedIp6,
            263 => Self::AddrRemovedIp6,
            270 => Self::StoreIdentitySecret,
            271 => Self::StoreIdentityPublic,
            272 => Self::StorePlanet,
            273 => Self::StorePeer,
            274 => Self::StoreNetwork,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::NodeUp => 200,
            Self::NodeOnline => 201,
            Self::NodeOffline => 202,
            Self::NodeDown => 203,
            Self::NodeFatalError => 204,
            Self::NetworkNotFound => 210,
            Self::NetworkClientTooOld => 211,
            Self::NetworkRequestConfig => 212,
            Self::NetworkOk => 213,
            Self::NetworkAccessDenied => 214,
            Self::NetworkReadyIp4 => 215,
            Self::NetworkReadyIp6 => 216,
            Self::NetworkReadyIp4Ip6 => 217,
            Self::NetworkDown => 218,
            Self::NetworkUpdate => 219,
            Self::StackUp => 220,
            Self::StackDown => 221,
            Self::NetifUp => 230,
            Self::NetifDown => 231,
            Self::NetifRemoved => 232,
            Self::NetifLinkUp => 233,
            Self::NetifLinkDown => 234,
            Self::PeerDirect => 240,
            Self::PeerRelay => 241,
            Self::PeerUnreachable => 242,
            Self::PeerPathDiscovered => 243,
            Self::PeerPathDead => 244,
            Self::RouteAdded => 250,
            Self::RouteRemoved => 251,
            Self::AddrAddedIp4 => 260,
            Self::AddrRemovedIp4 => 261,
            Self::AddrAddedIp6 => 262,
            Self::AddrRemovedIp6 => 263,
            Self::StoreIdentitySecret => 270,
            Self::StoreIdentityPublic => 271,
            Self::StorePlanet => 272,
            Self::StorePeer => 273,
            Self::StoreNetwork => 274,
            Self::Unknown(code) => code,
        }
    }

    /// 该事件是否可能改变“节点在线”或“网络传输就绪”的判定结果。
    pub fn is_status_change(self) -> bool {
        matches!(
            self,
            Self::NodeOnline
                | Self::NodeOffline
                | Self::NodeDown
                | Self::NetworkOk
                | Self::NetworkReadyIp4
                | Self::NetworkReadyIp6
                | Self::NetworkReadyIp4Ip6
                | Self::NetworkDown
                | Self::AddrAddedIp4
                | Self::AddrAddedIp6
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_round_trip_including_unknown() {
        for code in (195..280).chain([-1, 0, 9999]) {
            assert_eq!(NodeEvent::from_code(code).code(), code);
        }
        assert_eq!(NodeEvent::from_code(216), NodeEvent::NetworkReadyIp6);
        assert_eq!(NodeEvent::from_code(205), NodeEvent::Unknown(205));
    }

    #[test]
    fn only_readiness_events_wake_waiters() {
        assert!(NodeEvent::NodeOnline.is_status_change());
        assert!(NodeEvent::NetworkReadyIp4.is_status_change());
        assert!(!NodeEvent::PeerDirect.is_status_change());
        assert!(!NodeEvent::StorePlanet.is_status_change());
    }
}
