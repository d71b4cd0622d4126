use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use zerolink_native::{
    AddressFamily, NativeError, NativeStack, NetworkId, NodeEvent, NodeEventSink, NodeId,
};

use crate::{
    EventListener, Identity, Joined, LifecycleError, NodeConfig, NodeError, NodeState, PollPolicy,
    StartOptions,
};

/// 节点生命周期协调器的句柄。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 原生节点的启动是多步异步过程（身份 → 启动 → 等待在线 → 入网 → 等待传输就绪），
///   且每一步都有前置状态；把它收敛为显式状态机后，非法调用在触达原生层之前即被拒绝；
/// - 句柄由调用方显式构造并传递给依赖方，同一进程内可以并存多个互不干扰的节点。
///
/// ## 逻辑 (How)
/// - 状态保存在 `parking_lot::Mutex<NodeState>` 中，先在锁内完成校验与跃迁，再在锁外
///   调用原生接口，避免原生层同步回调事件监听器时与状态锁相互等待；
/// - 每个句柄只向原生层安装一个事件出口（`OnceLock` 保存），出口持有内部状态的 `Weak`
///   引用，把事件转发给 `ArcSwapOption` 中当前注册的监听器；
/// - 就绪等待按 [`PollPolicy`] 轮询，状态类事件通过 `Notify` 提前唤醒。
///
/// ## 契约 (What)
/// - 网络相关操作（入网、离网、地址查询、套接字创建）只在 `Started` 状态合法，否则返回
///   [`LifecycleError::NotRunning`]；
/// - `free` 对已释放节点幂等；
/// - 克隆句柄共享同一节点。
///
/// ## 注意事项 (Trade-offs)
/// - 在套接字仍在使用时释放节点属于调用方契约，句柄不做引用计数校验。
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    native: Arc<dyn NativeStack>,
    state: Mutex<NodeState>,
    listener: ArcSwapOption<EventListener>,
    sink: OnceLock<NodeEventSink>,
    status: Notify,
    policy: PollPolicy,
}

impl NodeInner {
    fn dispatch(&self, event: NodeEvent) {
        tracing::debug!(code = event.code(), ?event, "node event");
        if let Some(listener) = self.listener.load_full() {
            listener(event);
        }
        if event.is_status_change() {
            self.status.notify_waiters();
        }
    }
}

impl NodeHandle {
    pub fn new(native: Arc<dyn NativeStack>) -> Self {
        Self::with_policy(native, PollPolicy::default())
    }

    pub fn with_policy(native: Arc<dyn NativeStack>, policy: PollPolicy) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                native,
                state: Mutex::new(NodeState::Uninitialized),
                listener: ArcSwapOption::empty(),
                sink: OnceLock::new(),
                status: Notify::new(),
                policy,
            }),
        }
    }

    pub fn from_config(native: Arc<dyn NativeStack>, config: &NodeConfig) -> Self {
        Self::with_policy(native, config.poll)
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.lock()
    }

    pub fn poll_policy(&self) -> PollPolicy {
        self.inner.policy
    }

    /// 替换事件监听器；最后一次注册生效。
    pub fn set_event_listener<F>(&self, listener: F)
    where
        F: Fn(NodeEvent) + Send + Sync + 'static,
    {
        let listener: EventListener = Arc::new(listener);
        self.inner.listener.store(Some(Arc::new(listener)));
    }

    pub fn clear_event_listener(&self) {
        self.inner.listener.store(None);
    }

    /// 启动节点并等待其上线，返回节点身份。
    ///
    /// 合法起点为 `Uninitialized` 与 `Stopped`；在 `Started` 或 `Freed` 状态调用时
    /// 直接返回错误，不触达原生层。
    pub async fn start(&self, options: StartOptions) -> Result<NodeId, NodeError> {
        let previous = {
            let mut state = self.inner.state.lock();
            state.check_transition(NodeState::Started)?;
            let previous = *state;
            *state = NodeState::Started;
            previous
        };

        if let Err(err) = self.launch(options) {
            *self.inner.state.lock() = previous;
            tracing::warn!(code = err.code(), error = %err, "node start failed");
            return Err(err);
        }

        self.wait_until("node online", || self.inner.native.is_online())
            .await?;
        let node_id = self.inner.native.node_id();
        tracing::info!(%node_id, "node online");
        Ok(node_id)
    }

    fn launch(&self, options: StartOptions) -> Result<(), NodeError> {
        let native = &self.inner.native;
        match &options.identity {
            Some(Identity::Storage(path)) => native
                .init_from_storage(Path::new(path))
                .map_err(NodeError::native("init_from_storage"))?,
            Some(Identity::Key(key)) => native
                .init_from_key(key)
                .map_err(NodeError::native("init_from_key"))?,
            None => {}
        }
        if let Some(listener) = options.event_listener {
            self.inner.listener.store(Some(Arc::new(listener)));
        }
        native
            .start(self.event_sink())
            .map_err(NodeError::native("start"))?;
        if let Some(keep_alive) = options.keep_alive {
            native.set_keep_alive(keep_alive);
        }
        Ok(())
    }

    fn event_sink(&self) -> NodeEventSink {
        self.inner
            .sink
            .get_or_init(|| {
                let weak: Weak<NodeInner> = Arc::downgrade(&self.inner);
                Arc::new(move |event| {
                    if let Some(inner) = weak.upgrade() {
                        inner.dispatch(event);
                    }
                })
            })
            .clone()
    }

    /// 停止节点。只在 `Started` 状态合法。
    pub fn stop(&self) -> Result<(), NodeError> {
        self.transition(NodeState::Stopped)?;
        self.inner.status.notify_waiters();
        self.inner
            .native
            .stop()
            .map_err(NodeError::native("stop"))?;
        tracing::info!("node stopped");
        Ok(())
    }

    /// 释放节点。已释放时为空操作；从未启动时返回 [`LifecycleError::NeverStarted`]。
    pub fn free(&self) -> Result<(), NodeError> {
        {
            let mut state = self.inner.state.lock();
            if state.is_terminal() {
                return Ok(());
            }
            state.check_transition(NodeState::Freed)?;
            *state = NodeState::Freed;
        }
        self.inner.status.notify_waiters();
        self.inner.native.free();
        tracing::info!("node freed");
        Ok(())
    }

    /// 设置节点是否阻止宿主进程退出（ref/unref）。
    pub fn set_keep_alive(&self, keep_alive: bool) -> Result<(), NodeError> {
        self.ensure_running()?;
        self.inner.native.set_keep_alive(keep_alive);
        Ok(())
    }

    pub fn node_id(&self) -> Result<NodeId, NodeError> {
        self.ensure_running()?;
        Ok(self.inner.native.node_id())
    }

    /// 加入网络并等待其传输就绪。
    pub async fn join_network(&self, network: NetworkId) -> Result<(), NodeError> {
        self.ensure_running()?;
        self.inner
            .native
            .join(network)
            .map_err(NodeError::native("join"))?;
        tracing::debug!(%network, "join requested");
        self.wait_until("network transport ready", || {
            self.inner.native.is_transport_ready(network)
        })
        .await?;
        tracing::info!(%network, "network ready");
        Ok(())
    }

    pub fn leave_network(&self, network: NetworkId) -> Result<(), NodeError> {
        self.ensure_running()?;
        self.inner
            .native
            .leave(network)
            .map_err(NodeError::native("leave"))?;
        tracing::info!(%network, "network left");
        Ok(())
    }

    /// 查询本节点在 `network` 中的 `family` 地址。
    pub fn address(&self, network: NetworkId, family: AddressFamily) -> Result<IpAddr, NodeError> {
        self.ensure_running()?;
        self.inner
            .native
            .resolve_address(network, family)
            .map_err(|source| match source {
                NativeError::NoResult => NodeError::AddressUnavailable { network, family },
                source => NodeError::Native {
                    call: "resolve_address",
                    source,
                },
            })
    }

    /// 启动、入网并取得地址：优先 IPv6，未分配时回退到 IPv4。
    pub async fn start_and_join(
        &self,
        options: StartOptions,
        network: NetworkId,
    ) -> Result<Joined, NodeError> {
        let node_id = self.start(options).await?;
        self.join_network(network).await?;
        let address = match self.address(network, AddressFamily::Ipv6) {
            Err(NodeError::AddressUnavailable { .. }) => {
                tracing::debug!(%network, "no IPv6 address, falling back to IPv4");
                self.address(network, AddressFamily::Ipv4)?
            }
            other => other?,
        };
        tracing::info!(%node_id, %address, %network, "node joined");
        Ok(Joined { node_id, address })
    }

    /// 取得原生能力面，供传输层创建套接字与监听端点。只在 `Started` 状态合法。
    pub fn stack(&self) -> Result<Arc<dyn NativeStack>, NodeError> {
        self.ensure_running()?;
        Ok(self.inner.native.clone())
    }

    fn ensure_running(&self) -> Result<(), LifecycleError> {
        let state = self.state();
        if state.is_running() {
            return Ok(());
        }
        Err(match state {
            NodeState::Freed => LifecycleError::AlreadyFreed,
            _ => LifecycleError::NotRunning,
        })
    }

    fn transition(&self, target: NodeState) -> Result<(), LifecycleError> {
        let mut state = self.inner.state.lock();
        state.check_transition(target)?;
        *state = target;
        Ok(())
    }

    /// 轮询 `ready` 直至其返回 `true`。
    ///
    /// 每轮先登记 `Notify` 再检查条件，保证检查与等待之间到达的状态事件不会丢失；
    /// 节点在等待期间离开 `Started` 时返回生命周期错误。
    async fn wait_until<F>(&self, operation: &'static str, mut ready: F) -> Result<(), NodeError>
    where
        F: FnMut() -> bool,
    {
        let policy = self.inner.policy;
        let begun = Instant::now();
        let deadline = policy.deadline().map(|limit| begun + limit);
        loop {
            let notified = self.inner.status.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if ready() {
                return Ok(());
            }
            self.ensure_running()?;

            let mut pause = policy.interval();
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    let waited = now - begun;
                    tracing::warn!(operation, ?waited, "readiness wait timed out");
                    return Err(NodeError::Timeout { operation, waited });
                }
                pause = pause.min(deadline - now);
            }
            tracing::trace!(operation, ?pause, "waiting for readiness");
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

impl core::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("state", &self.state())
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}
