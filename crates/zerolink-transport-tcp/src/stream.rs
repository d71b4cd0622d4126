use core::fmt;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use zerolink_native::{AddrInfo, ErrorCode, Incoming, NativeSocket, SocketEvent};
use zerolink_node::NodeHandle;

use crate::driver::{CloseHook, Command, Driver, Shared};
use crate::retry::ConnectAttempt;
use crate::{ConnectOptions, ContractViolation, SocketOptions, SocketPhase, TcpError};

/// 单条连接的字节计数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// 原生层送达的字节数。
    pub bytes_read: u64,
    /// 原生层接受的字节数。
    pub bytes_written: u64,
    /// 对端确认的字节数。
    pub bytes_acked: u64,
    /// 已收到但尚未被读走的字节数。
    pub buffered: usize,
}

type Pending = oneshot::Receiver<Result<(), TcpError>>;

/// 以确认驱动流控的原生套接字之上的字节流。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 原生套接字只提供 `send`（可能部分接受）、`ack`（显式释放接收窗口）与异步事件；
///   本类型把它们适配为 `AsyncRead`/`AsyncWrite`，背压与半关闭语义与常规 TCP 流一致。
///
/// ## 逻辑 (How)
/// - 每条连接由一个驱动任务独占原始套接字，句柄通过命令通道提交写入与关闭，通过共享
///   缓冲读取数据；
/// - `poll_write` 采用“提交即返回”的方式：数据交给驱动后立即报告写入成功，下一次写入、
///   `flush` 或 `shutdown` 会先等待上一块被原生层完整接受，因此同一时刻至多一块在途；
/// - 不读取即构成背压：缓冲达到高水位后驱动停止确认，对端的发送窗口随之耗尽。
///
/// ## 契约 (What)
/// - 建连前提交的写入会排队，建连成功后按序发出；
/// - `end` 在从未建连时立即完成，否则等待原生层确认写方向关闭；
/// - 原生层的中止/重置以 [`TcpError::SocketFault`] 交付给读方、写方与 `closed()`，
///   且优先于尚未读走的数据；
/// - 句柄释放时写方向被关闭，剩余入站数据被丢弃并确认。
///
/// ## 注意事项 (Trade-offs)
/// - 故障若从未被观察（读、写或 `closed()` 都没有拿到它），句柄释放时以 `error` 级日志
///   上报，而不是 panic。
pub struct TcpStream {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    pending_write: Option<Pending>,
    pending_end: Option<Pending>,
    write_ended: bool,
}

impl TcpStream {
    /// 发起建连并立即返回；连接在后台建立，期间的写入会排队。
    pub fn open(node: &NodeHandle, options: ConnectOptions) -> Result<Self, TcpError> {
        options.validate()?;
        let stack = node.stack()?;
        let socket = stack
            .create_socket()
            .map_err(TcpError::native("create_socket"))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        socket.set_event_sink(events_tx);
        socket
            .connect(options.remote)
            .map_err(|source| match source.socket_code() {
                Some(ErrorCode::ISCONN) => ContractViolation::AlreadyConnected.into(),
                _ => TcpError::Native {
                    call: "connect",
                    source,
                },
            })?;
        tracing::debug!(remote = %options.remote, "connecting");
        let attempt = options.retry.begin(options.remote);
        Ok(Self::start(
            socket,
            events_rx,
            options.socket,
            Some(attempt),
            None,
            None,
        ))
    }

    /// 建连并等待连接建立；路由失败按重试策略重试。
    pub async fn connect(node: &NodeHandle, options: ConnectOptions) -> Result<Self, TcpError> {
        let stream = Self::open(node, options)?;
        stream.connected().await?;
        Ok(stream)
    }

    pub(crate) fn accepted(
        incoming: Incoming,
        options: SocketOptions,
        on_closed: CloseHook,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        incoming.socket.set_event_sink(events_tx);
        Self::start(
            incoming.socket,
            events_rx,
            options,
            None,
            Some(incoming.addr),
            Some(on_closed),
        )
    }

    fn start(
        socket: Arc<dyn NativeSocket>,
        events: mpsc::UnboundedReceiver<SocketEvent>,
        options: SocketOptions,
        connecting: Option<ConnectAttempt>,
        addr: Option<AddrInfo>,
        on_closed: Option<CloseHook>,
    ) -> Self {
        let driver = Driver::new(socket, options, connecting, addr, on_closed);
        let shared = driver.shared();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(driver.run(events, commands_rx));
        Self {
            shared,
            commands,
            pending_write: None,
            pending_end: None,
            write_ended: false,
        }
    }

    /// 等待连接建立，返回本端与对端地址。
    pub async fn connected(&self) -> Result<AddrInfo, TcpError> {
        let mut phase = self.shared.phase.subscribe();
        let reached = *phase
            .wait_for(|phase| *phase != SocketPhase::Unconnected)
            .await
            .map_err(|_| self.terminal_error())?;
        if reached == SocketPhase::Errored {
            return Err(self.terminal_error());
        }
        self.shared.state.lock().addr.ok_or(TcpError::SocketFault {
            code: ErrorCode::CLSD,
        })
    }

    /// 等待连接彻底结束：两个方向都关闭时返回 `Ok`，异常终止时返回故障。
    pub async fn closed(&self) -> Result<(), TcpError> {
        let mut phase = self.shared.phase.subscribe();
        let reached = *phase
            .wait_for(|phase| phase.is_terminal())
            .await
            .map_err(|_| self.terminal_error())?;
        match reached {
            SocketPhase::Errored => Err(self.terminal_error()),
            _ => Ok(()),
        }
    }

    pub fn phase(&self) -> SocketPhase {
        *self.shared.phase.borrow()
    }

    pub fn stats(&self) -> SocketStats {
        self.shared.state.lock().stats
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().addr.map(|addr| addr.local)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().addr.map(|addr| addr.remote)
    }

    /// 设置该连接是否阻止宿主进程退出（ref/unref）。
    pub fn set_keep_alive(&self, keep_alive: bool) {
        let _ = self.commands.send(Command::KeepAlive(keep_alive));
    }

    /// `true` 时关闭 Nagle 合并。
    pub fn set_no_delay(&self, no_delay: bool) {
        let _ = self.commands.send(Command::NoDelay(no_delay));
    }

    /// 写入一块数据并等待其被原生层完整接受。
    pub async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), TcpError> {
        poll_fn(|cx| self.poll_pending_write(cx)).await?;
        self.submit(chunk)?;
        poll_fn(|cx| self.poll_pending_write(cx)).await
    }

    /// 结束写方向；重复调用返回同一结果。
    pub async fn end(&mut self) -> Result<(), TcpError> {
        poll_fn(|cx| self.poll_end(cx)).await
    }

    fn terminal_error(&self) -> TcpError {
        self.shared
            .state
            .lock()
            .observe_fault()
            .unwrap_or_else(|| ContractViolation::WriteAfterEnd.into())
    }

    fn submit(&mut self, chunk: Bytes) -> Result<(), TcpError> {
        if self.write_ended {
            return Err(ContractViolation::WriteAfterEnd.into());
        }
        if let Some(fault) = self.shared.state.lock().observe_fault() {
            return Err(fault);
        }
        let (done, pending) = oneshot::channel();
        self.commands
            .send(Command::Write { chunk, done })
            .map_err(|_| self.terminal_error())?;
        self.pending_write = Some(pending);
        Ok(())
    }

    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), TcpError>> {
        let Some(pending) = self.pending_write.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(Pin::new(pending).poll(cx));
        self.pending_write = None;
        Poll::Ready(result.unwrap_or_else(|_| Err(self.terminal_error())))
    }

    fn poll_end(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), TcpError>> {
        ready!(self.poll_pending_write(cx))?;
        if !self.write_ended {
            self.write_ended = true;
            let (done, pending) = oneshot::channel();
            if self
                .commands
                .send(Command::Shutdown { done: Some(done) })
                .is_err()
            {
                return Poll::Ready(Err(self.terminal_error()));
            }
            self.pending_end = Some(pending);
        }
        let Some(pending) = self.pending_end.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(Pin::new(pending).poll(cx));
        self.pending_end = None;
        Poll::Ready(result.unwrap_or_else(|_| Err(self.terminal_error())))
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let mut state = this.shared.state.lock();
        if let Some(fault) = state.observe_fault() {
            return Poll::Ready(Err(fault.into()));
        }
        if state.inbound.is_empty() {
            if state.eof || state.finished {
                return Poll::Ready(Ok(()));
            }
            state.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let mut copied = 0;
        while buf.remaining() > 0 {
            let Some(front) = state.inbound.front_mut() else {
                break;
            };
            let len = front.len().min(buf.remaining());
            buf.put_slice(&front[..len]);
            front.advance(len);
            if front.is_empty() {
                state.inbound.pop_front();
            }
            copied += len;
        }
        state.inbound_len -= copied;
        state.stats.buffered = state.stats.buffered.saturating_sub(copied);
        drop(state);
        this.shared.progress.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx)).map_err(io::Error::from)?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.submit(Bytes::copy_from_slice(buf))
            .map_err(io::Error::from)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .poll_pending_write(cx)
            .map_err(io::Error::from)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_end(cx).map_err(io::Error::from)
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let state = self.shared.state.lock();
        if let Some(fault) = &state.fault
            && !state.fault_observed
        {
            tracing::error!(code = fault.code(), error = %fault, "socket fault was never observed");
        }
    }
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TcpStream")
            .field("phase", &*self.shared.phase.borrow())
            .field("addr", &state.addr)
            .field("stats", &state.stats)
            .finish_non_exhaustive()
    }
}
