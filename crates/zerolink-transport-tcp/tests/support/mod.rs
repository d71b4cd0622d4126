//! 集成测试共用的仿真拓扑：一个已启动的节点，同时承担客户端与服务端。

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::UnboundedReceiver;
use zerolink_native::sim::{SimConfig, SimNetwork, SimNode, SimSocket};
use zerolink_node::{NodeHandle, StartOptions};
use zerolink_transport_tcp::{
    ConnectOptions, ListenOptions, ServerEvent, ServerOptions, SocketOptions, TcpServer, TcpStream,
};

pub const PORT: u16 = 7000;

pub fn remote() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 147, 17, 1)), PORT)
}

/// 让所有就绪任务跑完；暂停时钟下只有运行时空闲才会推进时间。
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub struct Harness {
    pub network: SimNetwork,
    pub sim: Arc<SimNode>,
    pub node: NodeHandle,
}

impl Harness {
    pub async fn start(config: SimConfig) -> Self {
        let network = SimNetwork::new();
        let sim = network.node(config);
        let node = NodeHandle::new(sim.clone());
        node.start(StartOptions::default()).await.expect("start");
        Self { network, sim, node }
    }

    pub async fn listen(
        &self,
        options: ServerOptions,
    ) -> (TcpServer, UnboundedReceiver<ServerEvent>) {
        let (server, mut events) = TcpServer::new(&self.node, options).expect("server");
        server.listen(ListenOptions::port(PORT)).expect("listen");
        match events.recv().await {
            Some(ServerEvent::Listening(addr)) => assert_eq!(addr.port(), PORT),
            other => panic!("expected Listening, got {other:?}"),
        }
        (server, events)
    }

    pub async fn connect(&self, socket: SocketOptions) -> TcpStream {
        TcpStream::connect(&self.node, ConnectOptions::new(remote()).with_socket(socket))
            .await
            .expect("connect")
    }

    /// 建立一条连接，返回 `(服务端, 事件, 客户端流, 服务端流)`。
    pub async fn pair(
        &self,
        server: ServerOptions,
        client: SocketOptions,
    ) -> (TcpServer, UnboundedReceiver<ServerEvent>, TcpStream, TcpStream) {
        let (server, mut events) = self.listen(server).await;
        let client = self.connect(client).await;
        let accepted = accept(&mut events).await;
        (server, events, client, accepted)
    }

    /// 按创建顺序排列的仿真套接字；单条连接时依次为客户端与服务端。
    pub fn raw(&self, index: usize) -> Arc<SimSocket> {
        self.network.sockets()[index].clone()
    }
}

pub async fn accept(events: &mut UnboundedReceiver<ServerEvent>) -> TcpStream {
    match events.recv().await {
        Some(ServerEvent::Connection(stream)) => stream,
        other => panic!("expected Connection, got {other:?}"),
    }
}

/// 读到流结束为止。
pub async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("read_to_end timed out")
        .expect("read_to_end");
    out
}
