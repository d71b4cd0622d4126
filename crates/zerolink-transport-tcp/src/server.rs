use core::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use zerolink_native::{AddrInfo, Incoming, NativeError, NativeListener, NativeStack};
use zerolink_node::NodeHandle;

use crate::{ContractViolation, ListenOptions, ServerOptions, SocketOptions, TcpError, TcpStream};

/// 准入层交付给应用的通知。
pub enum ServerEvent {
    /// 绑定完成，开始接受连接。
    Listening(SocketAddr),
    /// 新连接；流适配器已完全初始化。
    Connection(TcpStream),
    /// 达到连接上限，入站连接被丢弃，对端会读到流结束。
    Drop(AddrInfo),
    /// 绑定或接受失败。
    Error(TcpError),
    /// 监听端点已关闭，且所有已接受的连接都已结束。
    Close,
}

impl fmt::Debug for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening(addr) => f.debug_tuple("Listening").field(addr).finish(),
            Self::Connection(stream) => f.debug_tuple("Connection").field(stream).finish(),
            Self::Drop(addr) => f.debug_tuple("Drop").field(addr).finish(),
            Self::Error(err) => f.debug_tuple("Error").field(err).finish(),
            Self::Close => f.write_str("Close"),
        }
    }
}

/// 监听端点的阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenPhase {
    Idle,
    Binding,
    Listening,
    /// 已停止接受连接，等待已接受的连接结束。
    Closing,
    Closed,
}

/// 连接准入层。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为监听端点施加连接上限：超过上限的连接在成为应用可见的流之前就被丢弃；
/// - 关闭分两阶段：立即停止接受新连接，但 `Close` 通知要等所有已接受连接结束后才发出。
///
/// ## 逻辑 (How)
/// - `listen` 同步校验状态后在后台任务中绑定，绑定结果以 `Listening`/`Error` 事件交付；
/// - 每个被接受的连接携带一个关闭钩子，连接结束时递减活动计数；
/// - 事件经无界通道送达，`Connection` 因此不会在接受回调的栈上同步交付。
///
/// ## 契约 (What)
/// - 活动连接数达到 `max_connections` 时，新连接触发 `Drop`，不创建适配器、不递增计数；
/// - 在绑定中或监听中再次 `listen` 返回 [`ContractViolation::AlreadyListening`]；
/// - 未监听时 `close` 返回 [`ContractViolation::NotListening`]。
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    node: NodeHandle,
    socket_options: SocketOptions,
    events: mpsc::UnboundedSender<ServerEvent>,
    state: Mutex<ServerState>,
}

struct ServerState {
    phase: ListenPhase,
    active: usize,
    max_connections: Option<usize>,
    listener: Option<Arc<dyn NativeListener>>,
    local_addr: Option<SocketAddr>,
    keep_alive: Option<bool>,
}

impl TcpServer {
    pub fn new(
        node: &NodeHandle,
        options: ServerOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), TcpError> {
        options.validate()?;
        let (events, receiver) = mpsc::unbounded_channel();
        let server = Self {
            inner: Arc::new(ServerInner {
                node: node.clone(),
                socket_options: options.socket,
                events,
                state: Mutex::new(ServerState {
                    phase: ListenPhase::Idle,
                    active: 0,
                    max_connections: options.max_connections,
                    listener: None,
                    local_addr: None,
                    keep_alive: None,
                }),
            }),
        };
        Ok((server, receiver))
    }

    /// 开始监听。绑定在后台完成，失败以 `ServerEvent::Error` 交付。
    pub fn listen(&self, options: ListenOptions) -> Result<(), TcpError> {
        let stack = {
            let mut state = self.inner.state.lock();
            if matches!(
                state.phase,
                ListenPhase::Binding | ListenPhase::Listening | ListenPhase::Closing
            ) {
                return Err(ContractViolation::AlreadyListening.into());
            }
            let stack = self.inner.node.stack()?;
            state.phase = ListenPhase::Binding;
            state.local_addr = None;
            stack
        };
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.serve(stack, options.addr).await });
        Ok(())
    }

    /// 停止接受连接；`Close` 事件在所有已接受连接结束后发出。
    pub async fn close(&self) -> Result<(), TcpError> {
        let listener = {
            let mut state = self.inner.state.lock();
            match state.phase {
                ListenPhase::Listening => {
                    state.phase = ListenPhase::Closing;
                    state.listener.take()
                }
                ListenPhase::Binding => {
                    state.phase = ListenPhase::Closing;
                    None
                }
                _ => return Err(ContractViolation::NotListening.into()),
            }
        };
        tracing::debug!(active = self.connection_count(), "server closing");
        if let Some(listener) = listener {
            let closed = listener.close().await.map_err(TcpError::native("close"));
            self.inner.finish_close_if_drained();
            closed?;
        }
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.inner.state.lock().max_connections
    }

    /// 调整连接上限；只影响之后到达的连接。
    pub fn set_max_connections(&self, max: Option<usize>) {
        self.inner.state.lock().max_connections = max;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().local_addr
    }

    pub fn phase(&self) -> ListenPhase {
        self.inner.state.lock().phase
    }

    /// 设置监听端点是否阻止宿主进程退出；绑定完成前调用时在绑定后生效。
    pub fn set_keep_alive(&self, keep_alive: bool) {
        let mut state = self.inner.state.lock();
        state.keep_alive = Some(keep_alive);
        if let Some(listener) = &state.listener {
            listener.set_keep_alive(keep_alive);
        }
    }
}

impl ServerInner {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    async fn serve(self: Arc<Self>, stack: Arc<dyn NativeStack>, addr: SocketAddr) {
        let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
        let listener = match stack.bind(addr, accept_tx).await {
            Ok(listener) => listener,
            Err(source) => {
                self.on_bind_failed(addr, source);
                return;
            }
        };

        let local = listener.local_addr();
        let admitted = {
            let mut state = self.state.lock();
            if state.phase == ListenPhase::Binding {
                state.phase = ListenPhase::Listening;
                state.local_addr = Some(local);
                state.listener = Some(listener.clone());
                if let Some(keep_alive) = state.keep_alive {
                    listener.set_keep_alive(keep_alive);
                }
                true
            } else {
                false
            }
        };
        if !admitted {
            if let Err(err) = listener.close().await {
                tracing::debug!(error = %err, "closing listener bound after close()");
            }
            self.finish_close_if_drained();
            return;
        }

        tracing::info!(%local, "listening");
        self.emit(ServerEvent::Listening(local));
        while let Some(incoming) = accept_rx.recv().await {
            match incoming {
                Ok(incoming) => self.on_incoming(incoming),
                Err(source) => {
                    tracing::warn!(error = %source, "accept failed");
                    self.emit(ServerEvent::Error(TcpError::Native {
                        call: "accept",
                        source,
                    }));
                }
            }
        }
        tracing::debug!(%local, "accept loop finished");
    }

    fn on_bind_failed(&self, addr: SocketAddr, source: NativeError) {
        {
            let mut state = self.state.lock();
            state.phase = match state.phase {
                ListenPhase::Closing => ListenPhase::Closing,
                _ => ListenPhase::Idle,
            };
        }
        tracing::warn!(%addr, error = %source, "bind failed");
        self.emit(ServerEvent::Error(TcpError::Bind { addr, source }));
        self.finish_close_if_drained();
    }

    fn on_incoming(self: &Arc<Self>, incoming: Incoming) {
        let admission = {
            let mut state = self.state.lock();
            let full = state
                .max_connections
                .is_some_and(|max| state.active >= max);
            if state.phase != ListenPhase::Listening {
                Err(false)
            } else if full {
                Err(true)
            } else {
                state.active += 1;
                Ok(state.active)
            }
        };
        let active = match admission {
            Ok(active) => active,
            Err(over_ceiling) => {
                incoming.socket.shutdown_write();
                // `Drop` 只报告超过上限的连接；关闭期间到达的连接静默结束。
                if over_ceiling {
                    tracing::warn!(remote = %incoming.addr.remote, "connection dropped");
                    self.emit(ServerEvent::Drop(incoming.addr));
                } else {
                    tracing::debug!(remote = %incoming.addr.remote, "connection arrived while closing");
                }
                return;
            }
        };

        let remote = incoming.addr.remote;
        let weak = Arc::downgrade(self);
        let stream = TcpStream::accepted(
            incoming,
            self.socket_options,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_connection_closed();
                }
            }),
        );
        tracing::debug!(%remote, active, "connection accepted");
        self.emit(ServerEvent::Connection(stream));
    }

    fn on_connection_closed(&self) {
        let active = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            state.active
        };
        tracing::debug!(active, "connection closed");
        self.finish_close_if_drained();
    }

    fn finish_close_if_drained(&self) {
        let closed = {
            let mut state = self.state.lock();
            if state.phase == ListenPhase::Closing && state.active == 0 {
                state.phase = ListenPhase::Closed;
                true
            } else {
                false
            }
        };
        if closed {
            tracing::info!("server closed");
            self.emit(ServerEvent::Close);
        }
    }
}
