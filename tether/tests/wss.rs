//! WebSocket-over-TLS endpoint integration tests, with certificates
//! generated on the fly.

mod common;

use bytes::Bytes;
use common::{EchoBack, Recorder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether::{Client, ClientOptions, EndpointKind, Server, ServerOptions, TransportKind};

/// Self-signed localhost certificate written to disk for the endpoints to
/// load by path
fn write_test_cert(dir: &tempfile::TempDir, prefix: &str) -> (PathBuf, PathBuf) {
    let certified =
        rcgen::generate_simple_self_signed(vec![String::from("localhost")]).expect("generate cert");

    let cert_path = dir.path().join(format!("{prefix}-cert.pem"));
    let key_path = dir.path().join(format!("{prefix}-key.pem"));
    std::fs::write(&cert_path, certified.cert.pem()).expect("write cert");
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).expect("write key");
    (cert_path, key_path)
}

#[tokio::test]
async fn test_wss_echo_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (cert_path, key_path) = write_test_cert(&dir, "server");

    let server = Server::new(
        EndpointKind::WssServer,
        ServerOptions::new("127.0.0.1:0")
            .with_ws_path("/echo")
            .with_tls_files(&cert_path, &key_path),
    )
    .unwrap();
    server
        .run_event_loop(common::init_with(Arc::new(EchoBack)))
        .await
        .unwrap();
    let port = server.listen_addr().unwrap().port();

    let (recorder, mut rx) = Recorder::new();
    let client = Client::new(
        EndpointKind::WssClient,
        ClientOptions::new(format!("wss://localhost:{port}/echo"))
            .with_root_cert_file(&cert_path),
    )
    .unwrap();
    client
        .run_event_loop(common::init_with(recorder))
        .await
        .unwrap();

    let session = common::wait_session(|| client.sessions()).await;
    assert_eq!(session.kind(), TransportKind::Wss);

    session
        .write_pkg(Bytes::from_static(b"hello wss"), Duration::from_secs(1))
        .await
        .unwrap();

    let (pkg, _) = common::recv_packet(&mut rx).await;
    assert_eq!(&pkg[..], b"hello wss");

    // Closing the client does not close the server endpoint
    client.close().await;
    assert!(!server.is_closed());

    server.close().await;
}

#[tokio::test]
async fn test_wss_untrusted_root_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (cert_path, key_path) = write_test_cert(&dir, "server");
    // A second certificate the server does not use
    let (other_cert, _other_key) = write_test_cert(&dir, "other");

    let server = Server::new(
        EndpointKind::WssServer,
        ServerOptions::new("127.0.0.1:0").with_tls_files(&cert_path, &key_path),
    )
    .unwrap();
    server
        .run_event_loop(common::init_with(Arc::new(EchoBack)))
        .await
        .unwrap();
    let port = server.listen_addr().unwrap().port();

    let (recorder, _rx) = Recorder::new();
    let client = Client::new(
        EndpointKind::WssClient,
        ClientOptions::new(format!("wss://localhost:{port}/"))
            .with_root_cert_file(&other_cert)
            .with_reconnect_interval(Duration::from_millis(200)),
    )
    .unwrap();
    client
        .run_event_loop(common::init_with(recorder))
        .await
        .unwrap();

    // The handshake fails against the untrusted certificate; no session forms
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(client.session_count(), 0);

    client.close().await;
    server.close().await;
}
