use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{SimConfig, SimListener, SimNetwork, SimSocket};
use crate::{
    AcceptSink, AddressFamily, ErrorCode, NativeError, NativeListener, NativeSocket, NetworkId,
    NodeControl, NodeEvent, NodeEventSink, NodeId, TcpControl,
};

/// 仿真节点。
///
/// 每次原生调用都会按名称记录到 [`SimNode::calls`]，测试据此断言“非法调用没有产生
/// 原生副作用”。
pub struct SimNode {
    network: SimNetwork,
    config: SimConfig,
    state: Mutex<NodeState>,
    connect_failures: Arc<Mutex<VecDeque<ErrorCode>>>,
}

#[derive(Default)]
struct NodeState {
    calls: Vec<&'static str>,
    sink: Option<NodeEventSink>,
    storage: Option<PathBuf>,
    key: Option<Vec<u8>>,
    started: bool,
    online_polls: u32,
    announced_online: bool,
    keep_alive: bool,
    networks: HashMap<NetworkId, u32>,
}

impl SimNode {
    pub(crate) fn new(network: SimNetwork, config: SimConfig) -> Self {
        Self {
            network,
            config,
            state: Mutex::new(NodeState::default()),
            connect_failures: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// 已发生的原生调用名称，按调用顺序排列。
    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    /// 某个原生调用发生的次数。
    pub fn call_count(&self, name: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == name).count()
    }

    pub fn storage_path(&self) -> Option<PathBuf> {
        self.state.lock().storage.clone()
    }

    pub fn identity_key(&self) -> Option<Vec<u8>> {
        self.state.lock().key.clone()
    }

    pub fn keep_alive(&self) -> bool {
        self.state.lock().keep_alive
    }

    pub fn joined(&self, network: NetworkId) -> bool {
        self.state.lock().networks.contains_key(&network)
    }

    /// 让该节点接下来的 `count` 次建连以 `code` 失败。
    pub fn fail_connects(&self, code: ErrorCode, count: usize) {
        let mut failures = self.connect_failures.lock();
        failures.extend(std::iter::repeat_n(code, count));
    }

    /// 主动推送一个节点事件，模拟引擎内部线程的回调。
    pub fn emit(&self, event: NodeEvent) {
        let sink = self.state.lock().sink.clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    fn record(&self, name: &'static str) {
        self.state.lock().calls.push(name);
    }
}

impl NodeControl for SimNode {
    fn init_from_storage(&self, path: &Path) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.calls.push("init_from_storage");
        state.storage = Some(path.to_path_buf());
        Ok(())
    }

    fn init_from_key(&self, key: &[u8]) -> Result<(), NativeError> {
        if key.is_empty() {
            return Err(NativeError::InvalidArgument);
        }
        let mut state = self.state.lock();
        state.calls.push("init_from_key");
        state.key = Some(key.to_vec());
        Ok(())
    }

    fn start(&self, sink: NodeEventSink) -> Result<(), NativeError> {
        {
            let mut state = self.state.lock();
            state.calls.push("start");
            state.started = true;
            state.online_polls = 0;
            state.announced_online = false;
            state.sink = Some(sink);
        }
        self.emit(NodeEvent::NodeUp);
        Ok(())
    }

    fn is_online(&self) -> bool {
        let (online, announce) = {
            let mut state = self.state.lock();
            if !state.started {
                return false;
            }
            let seen = state.online_polls;
            state.online_polls = state.online_polls.saturating_add(1);
            let online = seen >= self.config.online_after_polls;
            let announce = online && !state.announced_online;
            if announce {
                state.announced_online = true;
            }
            (online, announce)
        };
        if announce {
            self.emit(NodeEvent::NodeOnline);
        }
        online
    }

    fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    fn stop(&self) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.calls.push("stop");
        state.started = false;
        Ok(())
    }

    fn free(&self) {
        let mut state = self.state.lock();
        state.calls.push("free");
        state.started = false;
        state.networks.clear();
    }

    fn set_keep_alive(&self, keep_alive: bool) {
        let mut state = self.state.lock();
        state.calls.push(if keep_alive { "ref" } else { "unref" });
        state.keep_alive = keep_alive;
    }

    fn join(&self, network: NetworkId) -> Result<(), NativeError> {
        {
            let mut state = self.state.lock();
            state.calls.push("join");
            if !state.started {
                return Err(NativeError::Service);
            }
            state.networks.insert(network, 0);
        }
        self.emit(NodeEvent::NetworkRequestConfig);
        Ok(())
    }

    fn leave(&self, network: NetworkId) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.calls.push("leave");
        state.networks.remove(&network);
        Ok(())
    }

    fn is_transport_ready(&self, network: NetworkId) -> bool {
        let ready_now = {
            let mut state = self.state.lock();
            let Some(polls) = state.networks.get_mut(&network) else {
                return false;
            };
            let seen = *polls;
            *polls = polls.saturating_add(1);
            if seen < self.config.ready_after_polls {
                return false;
            }
            seen == self.config.ready_after_polls
        };
        if ready_now {
            self.emit(NodeEvent::NetworkOk);
            if self.config.ipv6.is_some() {
                self.emit(NodeEvent::NetworkReadyIp6);
            }
            if self.config.ipv4.is_some() {
                self.emit(NodeEvent::NetworkReadyIp4);
            }
        }
        true
    }

    fn resolve_address(
        &self,
        network: NetworkId,
        family: AddressFamily,
    ) -> Result<IpAddr, NativeError> {
        self.record("resolve_address");
        if !self.joined(network) {
            return Err(NativeError::NoResult);
        }
        match family {
            AddressFamily::Ipv4 => self.config.ipv4.map(IpAddr::V4),
            AddressFamily::Ipv6 => self.config.ipv6.map(IpAddr::V6),
        }
        .ok_or(NativeError::NoResult)
    }
}

#[async_trait]
impl TcpControl for SimNode {
    fn create_socket(&self) -> Result<Arc<dyn NativeSocket>, NativeError> {
        self.record("create_socket");
        let socket = SimSocket::new(
            self.network.clone(),
            self.config.clone(),
            self.connect_failures.clone(),
        );
        Ok(socket)
    }

    async fn bind(
        &self,
        addr: SocketAddr,
        accept: AcceptSink,
    ) -> Result<Arc<dyn NativeListener>, NativeError> {
        self.record("bind");
        let addr = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), self.network.ephemeral_port())
        } else {
            addr
        };
        if !self.network.register_listener(addr, accept) {
            return Err(NativeError::Socket(ErrorCode::USE));
        }
        tracing::debug!(%addr, "sim listener bound");
        Ok(Arc::new(SimListener::new(self.network.clone(), addr)))
    }
}
