use std::collections::VecDeque;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::task::Poll;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{SimConfig, SimNetwork, local_ip_for};
use crate::{
    AddrInfo, ErrorCode, Incoming, NativeError, NativeListener, NativeSocket, SocketEvent,
    SocketEventSink,
};

/// 仿真原始套接字。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 建连成功后与对端套接字成对链接，`send` 的字节以 `Data` 事件送达对端；
/// - 发送方可用窗口为 `send_buffer - unacked`，对端 `ack(n)` 后窗口恢复并收到 `Sent(n)`；
/// - 事件出口绑定前产生的事件进入积压队列，绑定时按序补发。
///
/// ## 注意事项 (Trade-offs)
/// - 任何时刻最多持有一把套接字锁；访问对端前先释放本端锁，避免成对死锁。
pub struct SimSocket {
    me: Weak<SimSocket>,
    network: SimNetwork,
    config: SimConfig,
    connect_failures: Arc<Mutex<VecDeque<ErrorCode>>>,
    state: Mutex<SocketState>,
}

#[derive(Default)]
struct SocketState {
    sink: Option<SocketEventSink>,
    backlog: Vec<SocketEvent>,
    peer: Option<Weak<SimSocket>>,
    addr: Option<AddrInfo>,
    connected: bool,
    write_shut: bool,
    unacked: usize,
    send_calls: usize,
    connect_calls: usize,
    bytes_received: usize,
    bytes_acked: usize,
    keep_alive: bool,
    nagle: bool,
}

impl SimSocket {
    pub(crate) fn new(
        network: SimNetwork,
        config: SimConfig,
        connect_failures: Arc<Mutex<VecDeque<ErrorCode>>>,
    ) -> Arc<Self> {
        let socket = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            network: network.clone(),
            config,
            connect_failures,
            state: Mutex::new(SocketState {
                nagle: true,
                ..SocketState::default()
            }),
        });
        network.track(&socket);
        socket
    }

    /// 已调用 `send` 的次数（含返回 0 的调用）。
    pub fn send_calls(&self) -> usize {
        self.state.lock().send_calls
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    /// 已发出但尚未被对端确认的字节数。
    pub fn unacked(&self) -> usize {
        self.state.lock().unacked
    }

    /// 以 `Data` 事件送达本端的字节总数。
    pub fn bytes_received(&self) -> usize {
        self.state.lock().bytes_received
    }

    /// 本端通过 `ack` 确认的字节总数。
    pub fn bytes_acked(&self) -> usize {
        self.state.lock().bytes_acked
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_write_shut(&self) -> bool {
        self.state.lock().write_shut
    }

    pub fn keep_alive(&self) -> bool {
        self.state.lock().keep_alive
    }

    pub fn nagle(&self) -> bool {
        self.state.lock().nagle
    }

    pub fn addr(&self) -> Option<AddrInfo> {
        self.state.lock().addr
    }

    /// 模拟协议栈中止或重置连接：本端收到 `Error(code)`，对端随之看到重置。
    pub fn inject_error(&self, code: ErrorCode) {
        let peer = {
            let mut state = self.state.lock();
            state.connected = false;
            state.peer.take().and_then(|peer| peer.upgrade())
        };
        self.emit(SocketEvent::Error(code));
        if let Some(peer) = peer {
            peer.reset_by_peer();
        }
    }

    fn reset_by_peer(&self) {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.peer = None;
        }
        self.emit(SocketEvent::Error(ErrorCode::RST));
    }

    fn emit(&self, event: SocketEvent) {
        let mut state = self.state.lock();
        if let SocketEvent::Data(Some(chunk)) = &event {
            state.bytes_received += chunk.len();
        }
        match &state.sink {
            Some(sink) => {
                let _ = sink.send(event);
            }
            None => state.backlog.push(event),
        }
    }

    fn release(&self, len: usize) {
        if self.config.ack_during_send {
            return;
        }
        {
            let mut state = self.state.lock();
            state.unacked = state.unacked.saturating_sub(len);
        }
        self.emit(SocketEvent::Sent(len));
    }

    fn link(&self, peer: Weak<SimSocket>, addr: AddrInfo) {
        let mut state = self.state.lock();
        state.peer = Some(peer);
        state.addr = Some(addr);
        state.connected = true;
    }

    fn peer(&self) -> Option<Arc<SimSocket>> {
        self.state.lock().peer.as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl NativeSocket for SimSocket {
    fn set_event_sink(&self, sink: SocketEventSink) {
        let mut state = self.state.lock();
        for event in state.backlog.drain(..) {
            let _ = sink.send(event);
        }
        state.sink = Some(sink);
    }

    fn connect(&self, remote: SocketAddr) -> Result<(), NativeError> {
        {
            let mut state = self.state.lock();
            if state.connected {
                return Err(NativeError::Socket(ErrorCode::ISCONN));
            }
            state.connect_calls += 1;
        }
        if let Some(code) = self.connect_failures.lock().pop_front() {
            self.emit(SocketEvent::ConnectError(code));
            return Ok(());
        }
        let Some(accept) = self.network.lookup(remote) else {
            self.emit(SocketEvent::ConnectError(ErrorCode::RST));
            return Ok(());
        };

        let local = SocketAddr::new(
            local_ip_for(&self.config, &remote.ip()),
            self.network.ephemeral_port(),
        );
        let client_addr = AddrInfo { local, remote };
        let server_addr = AddrInfo {
            local: remote,
            remote: local,
        };
        let server = SimSocket::new(
            self.network.clone(),
            self.config.clone(),
            self.connect_failures.clone(),
        );
        server.link(self.me.clone(), server_addr);
        self.link(Arc::downgrade(&server), client_addr);

        let incoming = Incoming {
            socket: server,
            addr: server_addr,
        };
        if accept.send(Ok(incoming)).is_err() {
            let mut state = self.state.lock();
            state.connected = false;
            state.peer = None;
            drop(state);
            self.emit(SocketEvent::ConnectError(ErrorCode::RST));
            return Ok(());
        }
        self.emit(SocketEvent::Connect(client_addr));
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<usize, NativeError> {
        let (peer, accepted) = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(NativeError::Socket(ErrorCode::CONN));
            }
            if state.write_shut {
                return Err(NativeError::Socket(ErrorCode::CLSD));
            }
            let Some(peer) = state.peer.as_ref().and_then(Weak::upgrade) else {
                return Err(NativeError::Socket(ErrorCode::RST));
            };
            state.send_calls += 1;
            let window = self.config.send_buffer.saturating_sub(state.unacked);
            let cap = self.config.max_send_chunk.unwrap_or(usize::MAX);
            let accepted = data.len().min(window).min(cap);
            if !self.config.ack_during_send {
                state.unacked += accepted;
            }
            (peer, accepted)
        };
        if accepted > 0 {
            peer.emit(SocketEvent::Data(Some(data.slice(..accepted))));
            if self.config.ack_during_send {
                self.emit(SocketEvent::Sent(accepted));
                yield_once().await;
            }
        }
        Ok(accepted)
    }

    fn ack(&self, len: usize) {
        if len == 0 {
            return;
        }
        self.state.lock().bytes_acked += len;
        if let Some(peer) = self.peer() {
            peer.release(len);
        }
    }

    fn shutdown_write(&self) {
        let (connected, peer) = {
            let mut state = self.state.lock();
            if state.write_shut {
                return;
            }
            state.write_shut = true;
            (
                state.connected,
                state.peer.as_ref().and_then(Weak::upgrade),
            )
        };
        if let Some(peer) = peer {
            peer.emit(SocketEvent::Data(None));
        }
        if connected {
            self.emit(SocketEvent::Close);
        }
    }

    fn set_keep_alive(&self, keep_alive: bool) {
        self.state.lock().keep_alive = keep_alive;
    }

    fn set_nagle(&self, enabled: bool) {
        self.state.lock().nagle = enabled;
    }
}

/// 让出一次执行权：调用方在本次 `send` 完成之前先处理已送达的事件。
async fn yield_once() {
    let mut yielded = false;
    poll_fn(|cx| {
        if yielded {
            return Poll::Ready(());
        }
        yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    })
    .await
}

/// 仿真监听端点。关闭时注销地址并释放接受通道的发送端。
pub struct SimListener {
    network: SimNetwork,
    addr: SocketAddr,
    state: Mutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    closed: bool,
    keep_alive: bool,
}

impl SimListener {
    pub(crate) fn new(network: SimNetwork, addr: SocketAddr) -> Self {
        Self {
            network,
            addr,
            state: Mutex::new(ListenerState {
                closed: false,
                keep_alive: true,
            }),
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.state.lock().keep_alive
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl NativeListener for SimListener {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn close(&self) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(NativeError::Socket(ErrorCode::CLSD));
        }
        state.closed = true;
        drop(state);
        self.network.remove_listener(self.addr);
        Ok(())
    }

    fn set_keep_alive(&self, keep_alive: bool) {
        self.state.lock().keep_alive = keep_alive;
    }
}

impl Drop for SimListener {
    fn drop(&mut self) {
        if !self.state.get_mut().closed {
            self.network.remove_listener(self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::TcpControl;
    use crate::sim::SimConfig;

    fn drain(rx: &mut mpsc::UnboundedReceiver<SocketEvent>) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn send_is_capped_by_window_and_released_by_peer_ack() {
        let network = SimNetwork::new();
        let node = network.node(SimConfig {
            send_buffer: 4,
            ..SimConfig::default()
        });
        let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "10.147.17.1:7000".parse().expect("addr");
        let _listener = node.bind(addr, accept_tx).await.expect("bind");

        let client = node.create_socket().expect("socket");
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        client.set_event_sink(client_tx);
        client.connect(addr).expect("connect");
        let incoming = accept_rx.recv().await.expect("incoming").expect("accepted");
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        incoming.socket.set_event_sink(server_tx);

        assert!(matches!(drain(&mut client_rx).as_slice(), [SocketEvent::Connect(_)]));
        assert_eq!(client.send(Bytes::from_static(b"abcdef")).await, Ok(4));
        assert_eq!(client.send(Bytes::from_static(b"ef")).await, Ok(0));
        assert_eq!(
            drain(&mut server_rx),
            vec![SocketEvent::Data(Some(Bytes::from_static(b"abcd")))]
        );

        incoming.socket.ack(4);
        assert_eq!(drain(&mut client_rx), vec![SocketEvent::Sent(4)]);
        assert_eq!(client.send(Bytes::from_static(b"ef")).await, Ok(2));
    }

    #[tokio::test]
    async fn ack_during_send_delivers_sent_before_the_send_resolves() {
        let network = SimNetwork::new();
        let node = network.node(SimConfig {
            max_send_chunk: Some(3),
            ack_during_send: true,
            ..SimConfig::default()
        });
        let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "10.147.17.1:7000".parse().expect("addr");
        let _listener = node.bind(addr, accept_tx).await.expect("bind");

        let client = node.create_socket().expect("socket");
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        client.set_event_sink(client_tx);
        client.connect(addr).expect("connect");
        let incoming = accept_rx.recv().await.expect("incoming").expect("accepted");
        drain(&mut client_rx);

        assert_eq!(client.send(Bytes::from_static(b"abcdef")).await, Ok(3));
        assert_eq!(drain(&mut client_rx), vec![SocketEvent::Sent(3)]);

        incoming.socket.ack(3);
        assert!(drain(&mut client_rx).is_empty(), "window was already released");
    }

    #[tokio::test]
    async fn connect_without_listener_reports_reset() {
        let network = SimNetwork::new();
        let node = network.node(SimConfig::default());
        let socket = node.create_socket().expect("socket");
        let (tx, mut rx) = mpsc::unbounded_channel();
        socket
            .connect("10.147.17.9:1".parse().expect("addr"))
            .expect("connect call");
        socket.set_event_sink(tx);
        assert_eq!(drain(&mut rx), vec![SocketEvent::ConnectError(ErrorCode::RST)]);
    }

    #[tokio::test]
    async fn bind_twice_reports_address_in_use() {
        let network = SimNetwork::new();
        let node = network.node(SimConfig::default());
        let addr: SocketAddr = "0.0.0.0:80".parse().expect("addr");
        let (tx, _rx) = mpsc::unbounded_channel();
        let listener = node.bind(addr, tx.clone()).await.expect("first bind");
        assert_eq!(
            node.bind(addr, tx).await.err(),
            Some(NativeError::Socket(ErrorCode::USE))
        );
        listener.close().await.expect("close");
        assert_eq!(network.listener_count(), 0);
    }
}
