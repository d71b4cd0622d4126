#![deny(unsafe_code)]
#![doc = r#"
# zerolink-node

## 设计动机（Why）
- **定位**：把虚拟网络节点“初始化 → 启动 → 等待在线 → 入网 → 等待传输就绪”的多步
  异步过程收敛为显式状态机，非法调用在触达原生层之前即被拒绝；
- **架构角色**：传输层的前置条件。流适配器与准入层通过 [`NodeHandle::stack`] 取得
  原生能力面，节点未运行时得到生命周期错误，而不是一次静默失败的原生调用。

## 核心契约（What）
- [`NodeHandle`]：`start`/`stop`/`free`/`set_keep_alive`/`join_network`/
  `leave_network`/`address`/`start_and_join`/`set_event_listener`；
- [`NodeState`]：`Uninitialized → Started ⇄ Stopped → Freed`；
- [`NodeError`]：生命周期错误、地址不可用、等待超时与原生调用失败，均带稳定错误码；
- [`NodeConfig`]/[`PollPolicy`]：可由 TOML 加载的轮询与启动参数。

## 实现策略（How）
- 就绪条件按固定间隔轮询，原生层上报的状态类事件通过 `tokio::sync::Notify` 提前
  唤醒等待方；配置了截止时间时，超时以 [`NodeError::Timeout`] 报告；
- 事件监听器保存在 `arc-swap` 槽中，替换监听器无需与事件分发互斥。

## 风险与考量（Trade-offs）
- 轮询意味着就绪感知存在至多一个间隔的延迟；引擎若不上报状态事件，这一延迟无法
  消除。
"#]

mod config;
mod error;
mod handle;
mod options;
mod state;

pub use config::{ConfigError, DEFAULT_POLL_INTERVAL_MS, NodeConfig, PollPolicy};
pub use error::{ErrorCategory, LifecycleError, NodeError};
pub use handle::NodeHandle;
pub use options::{EventListener, Identity, Joined, StartOptions};
pub use state::NodeState;
