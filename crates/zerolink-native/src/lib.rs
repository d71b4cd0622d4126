#![deny(unsafe_code)]
#![doc = r#"
# zerolink-native

## 设计动机（Why）
- **定位**：把虚拟网络引擎（身份、发现、加密、内嵌 TCP/IP 栈）收敛为一组窄接口，
  上层的生命周期协调器与流适配器只通过这些 trait 与引擎交互；
- **可测性**：接口全部以 trait 对象注入，`sim` 特性提供的内存后端可以在没有真实
  引擎的情况下驱动完整的流控状态机。

## 核心契约（What）
- [`NodeControl`]：节点身份、启动/停止/释放、在线状态、网络加入/离开与地址查询；
- [`TcpControl`]：创建原始套接字与监听端点；
- [`NativeSocket`]：字节级 `send`/`ack`/`shutdown_write`，事件经由
  [`SocketEventSink`] 以单消费者通道异步送达；
- [`NativeListener`]：监听端点的地址查询与关闭。

## 实现策略（How）
- 原生层的异步事件统一投递到 `tokio::sync::mpsc` 无界通道，消费者因此在单一逻辑
  线程上逐条处理事件；
- 错误码表（[`ErrorCode`]）与事件码表（[`NodeEvent`]）沿用引擎的数值定义，便于与
  真实后端的日志对照。
"#]

mod error;
mod event;
mod surface;

#[cfg(feature = "sim")]
pub mod sim;

pub use error::{ErrorCode, NativeError};
pub use event::{NodeEvent, NodeEventSink, SocketEvent};
pub use surface::{
    AcceptSink, AddrInfo, AddressFamily, Incoming, NativeListener, NativeSocket, NativeStack,
    NetworkId, NodeControl, NodeId, ParseNetworkIdError, SocketEventSink, TcpControl,
};
