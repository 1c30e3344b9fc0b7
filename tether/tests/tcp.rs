//! TCP endpoint integration tests.

mod common;

use bytes::Bytes;
use common::{EchoBack, Recorder, Stall};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tether::{
    Client, ClientOptions, EndpointKind, Error, FramedCodec, Server, ServerOptions, Session,
};

#[tokio::test]
async fn test_tcp_echo_roundtrip() {
    let server = Server::new(EndpointKind::TcpServer, ServerOptions::new("127.0.0.1:0")).unwrap();
    server
        .run_event_loop(common::init_with(Arc::new(EchoBack)))
        .await
        .unwrap();
    let addr = server.listen_addr().unwrap();

    let (recorder, mut rx) = Recorder::new();
    let client = Client::new(EndpointKind::TcpClient, ClientOptions::new(addr.to_string())).unwrap();
    client
        .run_event_loop(common::init_with(recorder.clone()))
        .await
        .unwrap();

    let session = common::wait_session(|| client.sessions()).await;
    assert_eq!(recorder.opened.load(Ordering::SeqCst), 1);
    common::wait_session(|| server.sessions()).await;
    assert_eq!(server.session_count(), 1);

    session
        .write_pkg(Bytes::from_static(b"hello tcp"), Duration::from_secs(1))
        .await
        .unwrap();

    let (pkg, from) = common::recv_packet(&mut rx).await;
    assert_eq!(&pkg[..], b"hello tcp");
    // Stream transports carry no per-packet source address
    assert!(from.is_none());

    client.close().await;
    assert!(client.is_closed());
    common::wait_count(&recorder.closed, 1).await;

    // The server notices the disconnect and drops its side of the session
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server kept a dead session");

    server.close().await;
}

#[tokio::test]
async fn test_tcp_write_order_preserved() {
    let server = Server::new(EndpointKind::TcpServer, ServerOptions::new("127.0.0.1:0")).unwrap();
    server
        .run_event_loop(common::init_with(Arc::new(EchoBack)))
        .await
        .unwrap();
    let addr = server.listen_addr().unwrap();

    let (recorder, mut rx) = Recorder::new();
    let client = Client::new(EndpointKind::TcpClient, ClientOptions::new(addr.to_string())).unwrap();
    client
        .run_event_loop(common::init_with(recorder))
        .await
        .unwrap();

    let session = common::wait_session(|| client.sessions()).await;
    for i in 0..50u8 {
        session
            .write_pkg(Bytes::from(vec![i; 16]), Duration::from_secs(1))
            .await
            .unwrap();
    }

    // The echo server preserves the enqueue order end to end
    for i in 0..50u8 {
        let (pkg, _) = common::recv_packet(&mut rx).await;
        assert_eq!(&pkg[..], &[i; 16][..]);
    }

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_tcp_write_queue_backpressure() {
    let server = Server::new(EndpointKind::TcpServer, ServerOptions::new("127.0.0.1:0")).unwrap();
    // The stalling listener parks the server read loop on the first packet,
    // so the client's kernel buffer and write queue fill up
    server
        .run_event_loop(common::init_with(Arc::new(Stall)))
        .await
        .unwrap();
    let addr = server.listen_addr().unwrap();

    let (recorder, _rx) = Recorder::new();
    let listener = recorder.clone();
    let client = Client::new(EndpointKind::TcpClient, ClientOptions::new(addr.to_string())).unwrap();
    client
        .run_event_loop(Arc::new(move |session: &Session<Bytes>| {
            session.set_pkg_handler(Arc::new(FramedCodec));
            session.set_event_listener(listener.clone());
            session.set_wq_len(2);
            session.set_write_timeout(Duration::from_secs(30));
            session.set_read_timeout(Duration::from_millis(100));
            session.set_wait_time(Duration::from_millis(300));
            Ok(())
        }))
        .await
        .unwrap();

    let session = common::wait_session(|| client.sessions()).await;
    let payload = Bytes::from(vec![7u8; 256 * 1024]);

    let mut saw_full = false;
    for _ in 0..256 {
        match session.write_pkg(payload.clone(), Duration::ZERO).await {
            Ok(()) => tokio::task::yield_now().await,
            Err(Error::QueueFull { waited }) => {
                assert_eq!(waited, Duration::ZERO);
                saw_full = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(saw_full, "queue never reported full");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_tcp_cron_fires_periodically() {
    let server = Server::new(EndpointKind::TcpServer, ServerOptions::new("127.0.0.1:0")).unwrap();
    server
        .run_event_loop(common::init_with(Arc::new(EchoBack)))
        .await
        .unwrap();
    let addr = server.listen_addr().unwrap();

    let (recorder, _rx) = Recorder::new();
    let listener = recorder.clone();
    let client = Client::new(EndpointKind::TcpClient, ClientOptions::new(addr.to_string())).unwrap();
    client
        .run_event_loop(Arc::new(move |session: &Session<Bytes>| {
            session.set_pkg_handler(Arc::new(FramedCodec));
            session.set_event_listener(listener.clone());
            session.set_read_timeout(Duration::from_millis(50));
            session.set_cron_period(Duration::from_millis(50));
            Ok(())
        }))
        .await
        .unwrap();

    common::wait_session(|| client.sessions()).await;
    common::wait_count(&recorder.crons, 3).await;

    client.close().await;
    server.close().await;
}
