//! 流适配器端到端场景：确认驱动的流控、部分写、建连重试、半关闭与故障传播。

mod support;

use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing_test::traced_test;
use zerolink_native::ErrorCode;
use zerolink_native::sim::{SimConfig, SimNetwork};
use zerolink_node::{LifecycleError, NodeError, NodeHandle};
use zerolink_transport_tcp::{
    ConnectOptions, ConnectRetryPolicy, ContractViolation, ServerOptions, SocketOptions,
    SocketPhase, TcpError, TcpStream,
};

use support::{Harness, accept, read_to_end, remote, settle};

#[tokio::test(start_paused = true)]
async fn partial_sends_resume_after_ack_and_complete_once() {
    let h = Harness::start(SimConfig {
        max_send_chunk: Some(3),
        ..SimConfig::default()
    })
    .await;
    let (_server, _events, mut client, mut accepted) = h
        .pair(ServerOptions::default(), SocketOptions::default())
        .await;

    client
        .write_chunk(Bytes::from_static(b"abcdefgh"))
        .await
        .expect("write");
    assert_eq!(h.raw(0).send_calls(), 3, "3 + 3 + 2 bytes");
    assert_eq!(client.stats().bytes_written, 8);

    let mut buf = [0u8; 8];
    accepted.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"abcdefgh");
}

#[tokio::test(start_paused = true)]
async fn ack_arriving_during_a_send_resumes_the_remainder_at_once() {
    let h = Harness::start(SimConfig {
        max_send_chunk: Some(3),
        ack_during_send: true,
        ..SimConfig::default()
    })
    .await;
    let (_server, _events, mut client, mut accepted) = h
        .pair(ServerOptions::default(), SocketOptions::default())
        .await;

    tokio::time::timeout(
        Duration::from_secs(5),
        client.write_chunk(Bytes::from_static(b"abcdefgh")),
    )
    .await
    .expect("remainder waited for another Sent")
    .expect("write");
    assert_eq!(h.raw(0).send_calls(), 3);
    assert_eq!(client.stats().bytes_acked, 8);

    let mut buf = [0u8; 8];
    accepted.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"abcdefgh");
}

#[tokio::test(start_paused = true)]
async fn acknowledgement_tracks_what_the_consumer_buffer_accepts() {
    let h = Harness::start(SimConfig::default()).await;
    let server_options = ServerOptions {
        socket: SocketOptions {
            read_high_water: 1024,
            ..SocketOptions::default()
        },
        ..ServerOptions::default()
    };
    let (_server, _events, mut client, mut accepted) =
        h.pair(server_options, SocketOptions::default()).await;

    for _ in 0..4 {
        client
            .write_chunk(Bytes::from(vec![7u8; 1000]))
            .await
            .expect("write");
    }
    settle().await;

    let raw = h.raw(1);
    assert_eq!(raw.bytes_received(), 4000);
    assert_eq!(raw.bytes_acked(), 1000, "second chunk would cross the high water mark");
    assert_eq!(accepted.stats().buffered, 4000);

    let mut buf = vec![0u8; 1000];
    accepted.read_exact(&mut buf).await.expect("read");
    settle().await;
    assert_eq!(raw.bytes_acked(), 2000);

    client.end().await.expect("end");
    assert_eq!(read_to_end(&mut accepted).await.len(), 3000);
    assert_eq!(raw.bytes_acked(), 4000);
}

#[tokio::test(start_paused = true)]
async fn oversized_chunk_is_accepted_into_an_empty_buffer() {
    let h = Harness::start(SimConfig::default()).await;
    let server_options = ServerOptions {
        socket: SocketOptions {
            read_high_water: 16,
            ..SocketOptions::default()
        },
        ..ServerOptions::default()
    };
    let (_server, _events, mut client, _accepted) =
        h.pair(server_options, SocketOptions::default()).await;

    client
        .write_chunk(Bytes::from(vec![1u8; 100]))
        .await
        .expect("write");
    settle().await;
    assert_eq!(h.raw(1).bytes_acked(), 100);
}

#[tokio::test(start_paused = true)]
async fn writes_before_connect_are_queued_until_the_connection_exists() {
    let h = Harness::start(SimConfig::default()).await;
    let (_server, mut events) = h.listen(ServerOptions::default()).await;
    h.sim.fail_connects(ErrorCode::RTE, 2);

    let started = Instant::now();
    let mut client = TcpStream::open(&h.node, ConnectOptions::new(remote())).expect("open");
    assert_eq!(client.phase(), SocketPhase::Unconnected);
    client
        .write_chunk(Bytes::from_static(b"hello "))
        .await
        .expect("first write");
    client
        .write_chunk(Bytes::from_static(b"world"))
        .await
        .expect("second write");
    assert!(started.elapsed() >= Duration::from_millis(500));
    client.end().await.expect("end");

    let mut accepted = accept(&mut events).await;
    assert_eq!(read_to_end(&mut accepted).await, b"hello world");
    assert_eq!(accepted.peer_addr(), client.local_addr());
    assert_eq!(client.peer_addr(), Some(remote()));
}

#[tokio::test(start_paused = true)]
async fn routing_failures_retry_on_the_same_socket() {
    let h = Harness::start(SimConfig::default()).await;
    let (_server, _events) = h.listen(ServerOptions::default()).await;
    h.sim.fail_connects(ErrorCode::RTE, 119);

    let started = Instant::now();
    let _client = h.connect(SocketOptions::default()).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(119 * 250), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(120 * 250), "{elapsed:?}");
    assert_eq!(h.raw(0).connect_calls(), 120);
}

#[tokio::test(start_paused = true)]
async fn end_while_retrying_closes_without_waiting_for_connect() {
    let h = Harness::start(SimConfig::default()).await;
    let (_server, _events) = h.listen(ServerOptions::default()).await;
    h.sim.fail_connects(ErrorCode::RTE, 40);

    let started = Instant::now();
    let mut client = TcpStream::open(&h.node, ConnectOptions::new(remote())).expect("open");
    settle().await;
    assert_eq!(client.phase(), SocketPhase::Unconnected);
    client.end().await.expect("end");
    assert!(started.elapsed() < Duration::from_millis(250), "{:?}", started.elapsed());

    settle().await;
    assert_eq!(client.phase(), SocketPhase::Closed);
    assert!(h.raw(0).is_write_shut());

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.raw(0).connect_calls(), 1, "retry timer was cancelled");
    assert_eq!(
        client.write_chunk(Bytes::from_static(b"late")).await,
        Err(TcpError::Contract(ContractViolation::WriteAfterEnd))
    );
}

#[tokio::test(start_paused = true)]
async fn retry_budget_exhaustion_reports_the_routing_failure() {
    let h = Harness::start(SimConfig::default()).await;
    h.sim.fail_connects(ErrorCode::RTE, 121);

    let started = Instant::now();
    let err = TcpStream::connect(&h.node, ConnectOptions::new(remote()))
        .await
        .expect_err("121 failures");
    assert_eq!(
        err,
        TcpError::Connect {
            code: ErrorCode::RTE,
            attempts: 121,
        }
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(120 * 250), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(121 * 250), "{elapsed:?}");
    assert_eq!(err.code(), "zerolink.transport.tcp.connect_failed");
}

#[tokio::test(start_paused = true)]
async fn non_routing_failures_are_not_retried() {
    let h = Harness::start(SimConfig::default()).await;
    h.sim.fail_connects(ErrorCode::ABRT, 1);
    let err = TcpStream::connect(&h.node, ConnectOptions::new(remote()))
        .await
        .expect_err("abort");
    assert_eq!(
        err,
        TcpError::Connect {
            code: ErrorCode::ABRT,
            attempts: 1,
        }
    );

    h.sim.fail_connects(ErrorCode::RTE, 1);
    let err = TcpStream::connect(
        &h.node,
        ConnectOptions::new(remote()).with_retry(ConnectRetryPolicy::never()),
    )
    .await
    .expect_err("retries disabled");
    assert_eq!(
        err,
        TcpError::Connect {
            code: ErrorCode::RTE,
            attempts: 1,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn half_close_keeps_the_other_direction_open() {
    let h = Harness::start(SimConfig::default()).await;
    let (_server, _events, mut client, mut accepted) = h
        .pair(ServerOptions::default(), SocketOptions::default())
        .await;

    client.end().await.expect("end");
    assert!(read_to_end(&mut accepted).await.is_empty());
    assert_eq!(client.phase(), SocketPhase::WriteHalfClosed);
    assert_eq!(accepted.phase(), SocketPhase::ReadHalfClosed);

    accepted
        .write_chunk(Bytes::from_static(b"late reply"))
        .await
        .expect("read-closed side can still write");
    accepted.end().await.expect("end");
    assert_eq!(read_to_end(&mut client).await, b"late reply");

    client.closed().await.expect("client closed");
    accepted.closed().await.expect("server closed");
    assert_eq!(client.phase(), SocketPhase::Closed);
    assert_eq!(accepted.phase(), SocketPhase::Closed);
}

#[tokio::test(start_paused = true)]
async fn disallowing_half_open_ends_the_write_side_after_eof() {
    let h = Harness::start(SimConfig::default()).await;
    let server_options = ServerOptions {
        socket: SocketOptions {
            allow_half_open: false,
            ..SocketOptions::default()
        },
        ..ServerOptions::default()
    };
    let (_server, _events, mut client, mut accepted) =
        h.pair(server_options, SocketOptions::default()).await;

    client.end().await.expect("end");
    assert!(read_to_end(&mut accepted).await.is_empty());
    assert!(read_to_end(&mut client).await.is_empty());
    accepted.closed().await.expect("server closed");
    client.closed().await.expect("client closed");
}

#[tokio::test(start_paused = true)]
async fn async_write_shutdown_ends_the_stream() {
    let h = Harness::start(SimConfig::default()).await;
    let (_server, _events, mut client, mut accepted) = h
        .pair(ServerOptions::default(), SocketOptions::default())
        .await;

    client.write_all(b"via AsyncWrite").await.expect("write_all");
    client.shutdown().await.expect("shutdown");
    assert_eq!(read_to_end(&mut accepted).await, b"via AsyncWrite");

    let err = client.write_all(b"more").await.expect_err("write after end");
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
}

#[tokio::test(start_paused = true)]
async fn end_is_idempotent_and_rejects_later_writes() {
    let h = Harness::start(SimConfig::default()).await;
    let (_server, _events, mut client, _accepted) = h
        .pair(ServerOptions::default(), SocketOptions::default())
        .await;

    client.end().await.expect("end");
    client.end().await.expect("second end");
    assert_eq!(
        client.write_chunk(Bytes::from_static(b"x")).await,
        Err(TcpError::Contract(ContractViolation::WriteAfterEnd))
    );
}

#[tokio::test(start_paused = true)]
async fn faults_take_precedence_over_buffered_data() {
    let h = Harness::start(SimConfig::default()).await;
    let (_server, _events, mut client, mut accepted) = h
        .pair(ServerOptions::default(), SocketOptions::default())
        .await;

    client
        .write_chunk(Bytes::from_static(b"unread"))
        .await
        .expect("write");
    settle().await;
    assert_eq!(accepted.stats().buffered, 6);

    h.raw(1).inject_error(ErrorCode::ABRT);
    settle().await;

    let mut buf = [0u8; 16];
    let err = accepted.read(&mut buf).await.expect_err("fault wins");
    assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    assert_eq!(
        accepted.closed().await,
        Err(TcpError::SocketFault {
            code: ErrorCode::ABRT,
        })
    );
    assert_eq!(accepted.phase(), SocketPhase::Errored);

    let reset = TcpError::SocketFault {
        code: ErrorCode::RST,
    };
    assert_eq!(client.closed().await, Err(reset.clone()));
    assert_eq!(
        client.write_chunk(Bytes::from_static(b"x")).await,
        Err(reset)
    );
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn unobserved_fault_is_logged_when_the_handle_drops() {
    let h = Harness::start(SimConfig::default()).await;
    let (_server, _events, client, accepted) = h
        .pair(ServerOptions::default(), SocketOptions::default())
        .await;

    h.raw(1).inject_error(ErrorCode::ABRT);
    settle().await;
    drop(accepted);
    assert!(logs_contain("socket fault was never observed"));

    assert!(client.closed().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_ends_the_write_side() {
    let h = Harness::start(SimConfig::default()).await;
    let (_server, _events, mut client, accepted) = h
        .pair(ServerOptions::default(), SocketOptions::default())
        .await;

    drop(accepted);
    assert!(read_to_end(&mut client).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn socket_options_reach_the_native_socket() {
    let h = Harness::start(SimConfig::default()).await;
    let (_server, _events, client, _accepted) = h
        .pair(
            ServerOptions::default(),
            SocketOptions {
                no_delay: true,
                ..SocketOptions::default()
            },
        )
        .await;
    let raw = h.raw(0);
    assert!(!raw.nagle());

    client.set_no_delay(false);
    client.set_keep_alive(true);
    settle().await;
    assert!(raw.nagle());
    assert!(raw.keep_alive());
}

#[tokio::test]
async fn connecting_requires_a_running_node() {
    let sim = SimNetwork::new().node(SimConfig::default());
    let node = NodeHandle::new(sim.clone());

    let err = TcpStream::open(&node, ConnectOptions::new(remote())).expect_err("not started");
    assert_eq!(
        err,
        TcpError::Node(NodeError::Lifecycle(LifecycleError::NotRunning))
    );
    assert_eq!(sim.call_count("create_socket"), 0);

    let err = TcpStream::open(&node, ConnectOptions::new("10.0.0.1:0".parse().expect("addr")))
        .expect_err("port 0");
    assert_eq!(
        err,
        TcpError::Contract(ContractViolation::InvalidOptions("remote.port"))
    );
}
