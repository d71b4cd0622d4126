use core::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use zerolink_native::{NodeEvent, NodeId};

/// 应用侧的节点事件监听器。
pub type EventListener = Arc<dyn Fn(NodeEvent) + Send + Sync>;

/// 节点身份来源：二选一，由类型保证不会同时指定。
#[derive(Clone, PartialEq, Eq)]
pub enum Identity {
    /// 从目录加载；目录中没有身份时由引擎生成并写回。
    Storage(PathBuf),
    /// 直接使用内存中的身份材料。
    Key(Vec<u8>),
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(path) => f.debug_tuple("Storage").field(path).finish(),
            Self::Key(key) => write!(f, "Key(<{} bytes>)", key.len()),
        }
    }
}

/// `start` 的参数。
#[derive(Clone, Default)]
pub struct StartOptions {
    pub identity: Option<Identity>,
    /// 在原生启动前注册，确保不会漏掉启动期间的事件。
    pub event_listener: Option<EventListener>,
    /// `Some` 时在启动后立即应用 ref/unref。
    pub keep_alive: Option<bool>,
}

impl StartOptions {
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_event_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(NodeEvent) + Send + Sync + 'static,
    {
        self.event_listener = Some(Arc::new(listener));
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }
}

impl fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartOptions")
            .field("identity", &self.identity)
            .field("event_listener", &self.event_listener.is_some())
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// `start_and_join` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Joined {
    pub node_id: NodeId,
    pub address: IpAddr,
}
