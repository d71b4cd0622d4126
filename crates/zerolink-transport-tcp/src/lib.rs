#![deny(unsafe_code)]
#![doc = r#"
# zerolink-transport-tcp

## 设计动机（Why）
- **定位**：把虚拟网络原生套接字的回调式接口（连接、数据、已发送、关闭、错误）
  适配为带背压的字节流，并在监听端点上施加连接上限；
- **架构角色**：位于 `zerolink-node` 之上。所有原生调用都经由
  [`NodeHandle::stack`](zerolink_node::NodeHandle::stack) 取得能力面，节点未运行时
  立即得到生命周期错误。

## 核心契约（What）
- [`TcpStream`]：实现 `tokio::io::{AsyncRead, AsyncWrite}`；
  - 只有被放入面向消费者缓冲的字节才会向原生层确认，确认窗口因此受消费速度约束；
  - 写操作在原生层接受全部字节后才完成，部分接受时等待确认推进后续传剩余部分；
  - 两个半关闭方向独立，两者俱全才进入 [`SocketPhase::Closed`]；
- [`TcpServer`]：两阶段关闭；超过 `max_connections` 的入站连接被丢弃并上报
  [`ServerEvent::Drop`]；
- [`ConnectRetryPolicy`]：仅对路由类失败在同一套接字上定间隔重试。

## 实现策略（How）
- 每个流由一个驱动任务独占原生套接字，原生事件、应用命令、在途发送与重试计时器
  在同一个 `tokio::select!` 中串行处理；
- 应用侧句柄只持有共享缓冲与命令通道，读路径通过 `Notify` 唤醒驱动任务补充缓冲。

## 风险与考量（Trade-offs）
- 单块大于高水位的数据在缓冲为空时仍会被接收，缓冲量上界因此为
  `max(高水位, 最大单块)`。
"#]

mod driver;
mod error;
mod options;
pub mod retry;
mod server;
mod state;
mod stream;

pub use error::{ContractViolation, TcpError};
pub use options::{
    ConnectOptions, DEFAULT_READ_HIGH_WATER, ListenOptions, ServerOptions, SocketOptions,
};
pub use retry::{ConnectAttempt, ConnectRetryPolicy, RetryDecision};
pub use server::{ListenPhase, ServerEvent, TcpServer};
pub use state::SocketPhase;
pub use stream::{SocketStats, TcpStream};
