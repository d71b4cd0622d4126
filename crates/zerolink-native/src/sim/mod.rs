//! # sim：内存虚拟网络后端
//!
//! ## 意图（Why）
//! - 流控适配器、准入层与生命周期协调器都只依赖原生能力面的 trait；本模块以纯内存
//!   结构实现这些 trait，使上层测试无需真实引擎即可覆盖建连重试、部分写、背压与
//!   半关闭等路径。
//!
//! ## 结构（How）
//! - [`SimNetwork`]：共享的“网络”，登记监听端点并把建连请求路由到对应的接受通道；
//! - [`SimNode`]：单个节点，实现 [`NodeControl`](crate::NodeControl) 与
//!   [`TcpControl`](crate::TcpControl)，记录每次原生调用以便断言副作用；
//! - [`SimSocket`]：成对链接的原始套接字，模拟有限发送缓冲与“对端确认后释放空间”。
//!
//! ## 契约（What）
//! - 发送方的可用缓冲 = `send_buffer - 未被对端确认的字节`；对端 `ack(n)` 后发送方
//!   收到 `Sent(n)`；
//! - 建连失败脚本按先进先出消费，每次 `connect` 消耗一项；
//! - 所有事件都经由无界通道异步送达，不会在调用方栈上同步回调适配器。

mod node;
mod socket;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{AcceptSink, NodeId};

pub use node::SimNode;
pub use socket::{SimListener, SimSocket};

const FIRST_EPHEMERAL_PORT: u16 = 49_152;

/// 单个仿真节点的参数。
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub node_id: NodeId,
    /// `is_online` 在前若干次查询中返回 `false`。
    pub online_after_polls: u32,
    /// `is_transport_ready` 在加入网络后的前若干次查询中返回 `false`。
    pub ready_after_polls: u32,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    /// 每个套接字的发送缓冲字节数。
    pub send_buffer: usize,
    /// 单次 `send` 最多接收的字节数，`None` 表示只受发送缓冲限制。
    pub max_send_chunk: Option<usize>,
    /// `true` 时对端在 `send` 完成之前就确认本次接受的字节：`Sent` 先于 `send` 的结果
    /// 到达发送方，对端随后的 `ack` 不再释放窗口。
    pub ack_during_send: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(0x00c0_ffee_01),
            online_after_polls: 2,
            ready_after_polls: 2,
            ipv4: Some(Ipv4Addr::new(10, 147, 17, 1)),
            ipv6: Some(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)),
            send_buffer: 8 * 1024,
            max_send_chunk: None,
            ack_during_send: false,
        }
    }
}

/// 共享的内存网络。克隆得到同一网络的另一个句柄。
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<SocketAddr, AcceptSink>,
    next_port: Option<u16>,
    sockets: Vec<Weak<SimSocket>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在该网络上创建一个节点。
    pub fn node(&self, config: SimConfig) -> Arc<SimNode> {
        Arc::new(SimNode::new(self.clone(), config))
    }

    /// 仍然存活的全部原始套接字（含主动建连与被动接受），按创建顺序排列。
    pub fn sockets(&self) -> Vec<Arc<SimSocket>> {
        let mut state = self.inner.lock();
        state.sockets.retain(|socket| socket.strong_count() > 0);
        state.sockets.iter().filter_map(Weak::upgrade).collect()
    }

    /// 当前登记的监听地址数量。
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub(crate) fn track(&self, socket: &Arc<SimSocket>) {
        self.inner.lock().sockets.push(Arc::downgrade(socket));
    }

    pub(crate) fn ephemeral_port(&self) -> u16 {
        let mut state = self.inner.lock();
        let port = state.next_port.unwrap_or(FIRST_EPHEMERAL_PORT);
        state.next_port = Some(port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT));
        port
    }

    /// 登记监听地址；地址已被占用时返回 `false`。
    pub(crate) fn register_listener(&self, addr: SocketAddr, accept: AcceptSink) -> bool {
        let mut state = self.inner.lock();
        if state.listeners.contains_key(&addr) {
            return false;
        }
        state.listeners.insert(addr, accept);
        true
    }

    pub(crate) fn remove_listener(&self, addr: SocketAddr) {
        self.inner.lock().listeners.remove(&addr);
    }

    /// 查找能够接受 `remote` 的监听端点：精确匹配优先，其次是同端口的通配地址。
    pub(crate) fn lookup(&self, remote: SocketAddr) -> Option<AcceptSink> {
        let state = self.inner.lock();
        if let Some(sink) = state.listeners.get(&remote) {
            return Some(sink.clone());
        }
        state
            .listeners
            .iter()
            .find(|(bound, _)| bound.port() == remote.port() && bound.ip().is_unspecified())
            .map(|(_, sink)| sink.clone())
    }
}

pub(crate) fn local_ip_for(config: &SimConfig, remote: &IpAddr) -> IpAddr {
    match remote {
        IpAddr::V4(_) => config
            .ipv4
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        IpAddr::V6(_) => config
            .ipv6
            .map(IpAddr::V6)
            .unwrap_or(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    }
}
