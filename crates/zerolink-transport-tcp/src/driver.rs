//! 单个原始套接字的驱动任务。
//!
//! ## 意图（Why）
//! - 原生层的事件（数据、确认、建连结果、关闭、错误）与应用侧的读写请求都在同一个任务
//!   里逐条处理，套接字的全部状态跃迁因此发生在单一逻辑线程上，无需为每个字段加锁；
//! - 只有需要与消费者共享的部分（入站缓冲、故障、统计、地址）放进 [`Shared`]。
//!
//! ## 结构（How）
//! - 入站：原生数据先进入暂存队列，再在缓冲有空间时提升到面向消费者的缓冲，并在提升的
//!   同一时刻向原生层确认；消费者读走数据后通过 `Notify` 唤醒驱动继续提升；
//! - 出站：写请求按序排队，同一时刻至多一个 `send` 在途；部分写在确认计数变化后发送
//!   余量，否则等待下一个 `Sent` 事件；
//! - 建连：`ConnectError` 交给 [`ConnectAttempt`] 判定，可重试时以定时器延后再次建连。
//!
//! ## 契约（What）
//! - 已确认但未被消费者读走的字节数不超过 `max(read_high_water, 最大单块)`；
//! - 写请求的完成通知只在整块数据都被原生层接受后发出，且每块只通知一次；
//! - 故障会同时交付给所有等待者；句柄已释放时故障以 `error` 级日志上报。

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Waker;

use bytes::Bytes;
use futures::future::{BoxFuture, OptionFuture};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::Sleep;
use zerolink_native::{AddrInfo, ErrorCode, NativeError, NativeSocket, SocketEvent};

use crate::retry::{ConnectAttempt, RetryDecision};
use crate::state::{SocketLifecycle, SocketPhase};
use crate::{ContractViolation, SocketOptions, SocketStats, TcpError};

/// 连接彻底结束（或句柄释放后写方向结束）时调用一次，供准入层递减计数。
pub(crate) type CloseHook = Box<dyn FnOnce() + Send>;

pub(crate) type Completion = oneshot::Sender<Result<(), TcpError>>;

pub(crate) enum Command {
    Write { chunk: Bytes, done: Completion },
    Shutdown { done: Option<Completion> },
    KeepAlive(bool),
    NoDelay(bool),
}

/// 驱动任务与句柄共享的状态。
pub(crate) struct Shared {
    pub(crate) state: Mutex<SharedState>,
    /// 消费者读走数据后通知驱动。
    pub(crate) progress: Notify,
    pub(crate) phase: watch::Sender<SocketPhase>,
}

#[derive(Default)]
pub(crate) struct SharedState {
    pub(crate) inbound: VecDeque<Bytes>,
    pub(crate) inbound_len: usize,
    pub(crate) eof: bool,
    pub(crate) finished: bool,
    pub(crate) fault: Option<TcpError>,
    pub(crate) fault_observed: bool,
    pub(crate) read_waker: Option<Waker>,
    pub(crate) stats: SocketStats,
    pub(crate) addr: Option<AddrInfo>,
}

impl SharedState {
    /// 取出故障并标记为已被观察。
    pub(crate) fn observe_fault(&mut self) -> Option<TcpError> {
        let fault = self.fault.clone()?;
        self.fault_observed = true;
        Some(fault)
    }
}

enum Outbound {
    Write { chunk: Bytes, done: Completion },
    Shutdown { done: Option<Completion> },
}

struct PendingWrite {
    remaining: Bytes,
    done: Completion,
    acked_before: usize,
}

enum WriteState {
    Idle,
    Sending(PendingWrite),
    AwaitingSpace(PendingWrite),
}

pub(crate) struct Driver {
    socket: Arc<dyn NativeSocket>,
    shared: Arc<Shared>,
    options: SocketOptions,
    lifecycle: SocketLifecycle,
    connecting: Option<ConnectAttempt>,
    staging: VecDeque<Bytes>,
    staged_len: usize,
    remote_ended: bool,
    queue: VecDeque<Outbound>,
    write: WriteState,
    end_queued: bool,
    shutdown_requested: bool,
    closing: Vec<Completion>,
    acked_total: usize,
    detached: bool,
    on_closed: Option<CloseHook>,
}

type SendFuture = BoxFuture<'static, Result<usize, NativeError>>;

impl Driver {
    pub(crate) fn new(
        socket: Arc<dyn NativeSocket>,
        options: SocketOptions,
        connecting: Option<ConnectAttempt>,
        addr: Option<AddrInfo>,
        on_closed: Option<CloseHook>,
    ) -> Self {
        let lifecycle = SocketLifecycle::new(addr.is_some());
        let (phase, _) = watch::channel(lifecycle.phase());
        let shared = Arc::new(Shared {
            state: Mutex::new(SharedState {
                addr,
                ..SharedState::default()
            }),
            progress: Notify::new(),
            phase,
        });
        if options.no_delay {
            socket.set_nagle(false);
        }
        Self {
            socket,
            shared,
            options,
            lifecycle,
            connecting,
            staging: VecDeque::new(),
            staged_len: 0,
            remote_ended: false,
            queue: VecDeque::new(),
            write: WriteState::Idle,
            end_queued: false,
            shutdown_requested: false,
            closing: Vec::new(),
            acked_total: 0,
            detached: false,
            on_closed,
        }
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    pub(crate) async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let shared = self.shared.clone();
        let mut in_flight: Option<SendFuture> = None;
        let mut retry: Option<Pin<Box<Sleep>>> = None;

        while !self.is_done() {
            if in_flight.is_none() {
                in_flight = self.next_send();
            }
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.on_event(event, &mut retry),
                    None => self.fail(TcpError::SocketFault { code: ErrorCode::CLSD }),
                },
                Some(result) = OptionFuture::from(in_flight.as_mut()) => {
                    in_flight = None;
                    self.on_send_result(result);
                }
                Some(()) = OptionFuture::from(retry.as_mut()) => {
                    retry = None;
                    self.retry_connect();
                }
                command = commands.recv(), if !self.detached => {
                    match command {
                        Some(command) => self.on_command(command),
                        None => self.detach(),
                    }
                    if self.connecting.is_none() {
                        retry = None;
                    }
                }
                () = shared.progress.notified() => self.promote(),
            }
        }
        self.finish();
    }

    fn is_done(&self) -> bool {
        self.lifecycle.phase().is_terminal() || (self.detached && self.lifecycle.write_closed())
    }

    fn publish(&self) {
        self.shared.phase.send_replace(self.lifecycle.phase());
    }

    fn on_event(&mut self, event: SocketEvent, retry: &mut Option<Pin<Box<Sleep>>>) {
        match event {
            SocketEvent::Connect(addr) => {
                *retry = None;
                self.connecting = None;
                self.shared.state.lock().addr = Some(addr);
                if self.lifecycle.connect() {
                    self.publish();
                    tracing::debug!(local = %addr.local, remote = %addr.remote, "socket connected");
                }
            }
            SocketEvent::ConnectError(code) => {
                let Some(attempt) = self.connecting.as_mut() else {
                    tracing::debug!(%code, "connect error without a pending attempt");
                    return;
                };
                match attempt.on_failure(code) {
                    RetryDecision::Retry { after, retry: n } => {
                        tracing::warn!(%code, retry = n, remote = %attempt.remote(), "connect failed, retrying");
                        *retry = Some(Box::pin(tokio::time::sleep(after)));
                    }
                    RetryDecision::GiveUp { code, attempts } => {
                        self.connecting = None;
                        self.fail(TcpError::Connect { code, attempts });
                    }
                }
            }
            SocketEvent::Data(Some(chunk)) => self.on_data(chunk),
            SocketEvent::Data(None) => {
                self.remote_ended = true;
                self.promote();
            }
            SocketEvent::Sent(len) => {
                self.acked_total += len;
                self.shared.state.lock().stats.bytes_acked += len as u64;
            }
            SocketEvent::Close => self.on_close(),
            SocketEvent::Error(code) => self.fail(TcpError::SocketFault { code }),
        }
    }

    fn retry_connect(&mut self) {
        let Some(attempt) = &self.connecting else {
            return;
        };
        if let Err(source) = self.socket.connect(attempt.remote()) {
            self.connecting = None;
            self.fail(TcpError::Native {
                call: "connect",
                source,
            });
        }
    }

    fn on_data(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let len = chunk.len();
        self.shared.state.lock().stats.bytes_read += len as u64;
        if self.detached {
            self.socket.ack(len);
            return;
        }
        self.staged_len += len;
        self.staging.push_back(chunk);
        self.promote();
    }

    /// 把暂存数据提升到消费者缓冲并确认；缓冲为空时无论块大小都接收一块。
    fn promote(&mut self) {
        let high_water = self.options.read_high_water;
        let mut promoted = 0;
        let (drained, waker) = {
            let mut state = self.shared.state.lock();
            while let Some(len) = self.staging.front().map(Bytes::len) {
                if state.inbound_len != 0 && state.inbound_len + len > high_water {
                    break;
                }
                let Some(chunk) = self.staging.pop_front() else {
                    break;
                };
                self.staged_len -= len;
                state.inbound_len += len;
                state.inbound.push_back(chunk);
                promoted += len;
            }
            if self.remote_ended && self.staging.is_empty() {
                state.eof = true;
            }
            state.stats.buffered = state.inbound_len + self.staged_len;
            let drained = state.eof && state.inbound.is_empty();
            let waker = if promoted > 0 || state.eof {
                state.read_waker.take()
            } else {
                None
            };
            (drained, waker)
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        if promoted > 0 {
            self.socket.ack(promoted);
        }
        if drained {
            self.on_read_closed();
        }
    }

    fn on_read_closed(&mut self) {
        if !self.lifecycle.close_read() {
            return;
        }
        self.publish();
        tracing::debug!("read side closed");
        if !self.options.allow_half_open && !self.end_queued {
            self.end_queued = true;
            self.queue.push_back(Outbound::Shutdown { done: None });
        }
    }

    fn on_close(&mut self) {
        if !self.shutdown_requested {
            self.fail(TcpError::SocketFault {
                code: ErrorCode::CLSD,
            });
            return;
        }
        for done in self.closing.drain(..) {
            let _ = done.send(Ok(()));
        }
        if self.lifecycle.close_write() {
            self.publish();
            tracing::debug!("write side closed");
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Write { chunk, done } => self.queue.push_back(Outbound::Write { chunk, done }),
            Command::Shutdown { done } => {
                self.end_queued = true;
                // 尚未建连就结束写方向：放弃建连与重试，排在前面的写入以 CONN 失败。
                if let Some(attempt) = self.connecting.take() {
                    tracing::debug!(remote = %attempt.remote(), "write shutdown while connecting, connect abandoned");
                }
                self.queue.push_back(Outbound::Shutdown { done });
            }
            Command::KeepAlive(keep_alive) => self.socket.set_keep_alive(keep_alive),
            Command::NoDelay(no_delay) => self.socket.set_nagle(!no_delay),
        }
    }

    /// 选出下一次 `send`；没有可发送的数据或需要等待空间时返回 `None`。
    fn next_send(&mut self) -> Option<SendFuture> {
        if self.lifecycle.phase().is_terminal() {
            return None;
        }
        loop {
            match std::mem::replace(&mut self.write, WriteState::Idle) {
                WriteState::Idle => {}
                WriteState::AwaitingSpace(pending) if pending.acked_before != self.acked_total => {
                    return Some(self.issue(pending));
                }
                other => {
                    self.write = other;
                    return None;
                }
            }
            if !self.lifecycle.phase().is_connected() && self.connecting.is_some() {
                return None;
            }
            match self.queue.pop_front()? {
                Outbound::Write { chunk, done } => {
                    if self.shutdown_requested {
                        let _ = done.send(Err(ContractViolation::WriteAfterEnd.into()));
                        continue;
                    }
                    if !self.lifecycle.phase().is_connected() {
                        let _ = done.send(Err(TcpError::SocketFault {
                            code: ErrorCode::CONN,
                        }));
                        continue;
                    }
                    if chunk.is_empty() {
                        let _ = done.send(Ok(()));
                        continue;
                    }
                    return Some(self.issue(PendingWrite {
                        remaining: chunk,
                        done,
                        acked_before: self.acked_total,
                    }));
                }
                Outbound::Shutdown { done } => self.shutdown(done),
            }
        }
    }

    fn issue(&mut self, mut pending: PendingWrite) -> SendFuture {
        pending.acked_before = self.acked_total;
        let socket = self.socket.clone();
        let chunk = pending.remaining.clone();
        self.write = WriteState::Sending(pending);
        Box::pin(async move { socket.send(chunk).await })
    }

    fn on_send_result(&mut self, result: Result<usize, NativeError>) {
        let WriteState::Sending(mut pending) = std::mem::replace(&mut self.write, WriteState::Idle)
        else {
            return;
        };
        match result {
            Ok(accepted) => {
                let accepted = accepted.min(pending.remaining.len());
                self.shared.state.lock().stats.bytes_written += accepted as u64;
                if accepted == pending.remaining.len() {
                    let _ = pending.done.send(Ok(()));
                    return;
                }
                pending.remaining = pending.remaining.slice(accepted..);
                tracing::trace!(
                    accepted,
                    remaining = pending.remaining.len(),
                    "partial send, waiting for space"
                );
                self.write = WriteState::AwaitingSpace(pending);
            }
            Err(source) => {
                self.write = WriteState::Sending(pending);
                let error = match source.socket_code() {
                    Some(code) => TcpError::SocketFault { code },
                    None => TcpError::Native {
                        call: "send",
                        source,
                    },
                };
                self.fail(error);
            }
        }
    }

    fn shutdown(&mut self, done: Option<Completion>) {
        if self.shutdown_requested {
            match done {
                Some(done) if self.lifecycle.write_closed() => {
                    let _ = done.send(Ok(()));
                }
                Some(done) => self.closing.push(done),
                None => {}
            }
            return;
        }
        self.shutdown_requested = true;
        self.socket.shutdown_write();
        if self.lifecycle.phase().is_connected() {
            self.closing.extend(done);
            tracing::debug!("write shutdown requested");
            return;
        }
        if let Some(done) = done {
            let _ = done.send(Ok(()));
        }
        if self.lifecycle.close_write() {
            self.publish();
        }
    }

    fn detach(&mut self) {
        self.detached = true;
        let unread = {
            let mut state = self.shared.state.lock();
            state.inbound.clear();
            state.inbound_len = 0;
            state.stats.buffered = 0;
            self.staging.clear();
            std::mem::take(&mut self.staged_len)
        };
        if unread > 0 {
            self.socket.ack(unread);
        }
        if !self.end_queued {
            self.end_queued = true;
            self.queue.push_back(Outbound::Shutdown { done: None });
        }
        tracing::debug!(phase = ?self.lifecycle.phase(), "stream handle dropped");
    }

    fn fail(&mut self, error: TcpError) {
        if !self.lifecycle.fail() {
            return;
        }
        self.publish();
        self.connecting = None;

        let mut observed = false;
        let mut deliver = |done: Completion| observed |= done.send(Err(error.clone())).is_ok();
        match std::mem::replace(&mut self.write, WriteState::Idle) {
            WriteState::Sending(pending) | WriteState::AwaitingSpace(pending) => {
                deliver(pending.done)
            }
            WriteState::Idle => {}
        }
        for outbound in self.queue.drain(..) {
            match outbound {
                Outbound::Write { done, .. } | Outbound::Shutdown { done: Some(done) } => {
                    deliver(done)
                }
                Outbound::Shutdown { done: None } => {}
            }
        }
        for done in self.closing.drain(..) {
            deliver(done);
        }

        let waker = {
            let mut state = self.shared.state.lock();
            state.fault = Some(error.clone());
            state.fault_observed |= observed;
            state.read_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        if self.detached {
            tracing::error!(code = error.code(), error = %error, "socket fault with no owner");
        } else {
            tracing::debug!(code = error.code(), error = %error, "socket fault");
        }
    }

    fn finish(&mut self) {
        let rejection = || {
            self.shared
                .state
                .lock()
                .fault
                .clone()
                .unwrap_or_else(|| ContractViolation::WriteAfterEnd.into())
        };
        if let WriteState::Sending(pending) | WriteState::AwaitingSpace(pending) =
            std::mem::replace(&mut self.write, WriteState::Idle)
        {
            let _ = pending.done.send(Err(rejection()));
        }
        for outbound in std::mem::take(&mut self.queue) {
            match outbound {
                Outbound::Write { done, .. } | Outbound::Shutdown { done: Some(done) } => {
                    let _ = done.send(Err(rejection()));
                }
                Outbound::Shutdown { done: None } => {}
            }
        }
        let waker = {
            let mut state = self.shared.state.lock();
            state.finished = true;
            state.read_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        if let Some(on_closed) = self.on_closed.take() {
            on_closed();
        }
        tracing::debug!(phase = ?self.lifecycle.phase(), "socket driver finished");
    }
}
