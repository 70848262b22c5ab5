//! End-to-end tests against a live server, speaking raw HTTP/1.1 the way
//! an external client would.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};
use tokio::time::timeout;

use trellis_backend::MemBackend;
use trellis_localapi::Server;
use trellis_metrics::Registry;

const WAIT: Duration = Duration::from_secs(10);

async fn start_unix_server() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trellisd.sock");
    let backend = Arc::new(MemBackend::new());
    let server = Arc::new(Server::new(
        backend,
        Arc::new(Registry::new()),
        "e2e".to_string(),
    ));
    let sock = path.clone();
    tokio::spawn(async move {
        let _ = server.run_unix(&sock).await;
    });
    for _ in 0..200 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(path.exists(), "server socket never appeared");
    (dir, path)
}

async fn read_head(stream: &mut (impl AsyncReadExt + Unpin)) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
        assert!(buf.len() < 64 * 1024, "runaway response head");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn test_status_over_unix_socket() {
    timeout(WAIT, async {
        let (_dir, path) = start_unix_server().await;

        // Same-process client shares the daemon's uid, so peer creds
        // grant the full permit.
        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(
                b"GET /localapi/v0/status HTTP/1.1\r\n\
                  Host: local-trellisd.sock\r\n\
                  Connection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        // hyper writes header names lowercased.
        assert!(
            response.to_ascii_lowercase().contains("trellis-version:"),
            "{response}"
        );
        assert!(response.contains("backend_state"), "{response}");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_dial_pipes_bytes_both_ways() {
    timeout(WAIT, async {
        let (_dir, path) = start_unix_server().await;

        // A TCP echo peer standing in for the remote side of the mesh.
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut conn, _)) = echo.accept().await {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            }
        });

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let request = format!(
            "POST /localapi/v0/dial HTTP/1.1\r\n\
             Host: local-trellisd.sock\r\n\
             Connection: upgrade\r\n\
             Upgrade: trellis-dial\r\n\
             Dial-Host: 127.0.0.1\r\n\
             Dial-Port: {}\r\n\r\n",
            echo_addr.port()
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 101"), "{head}");
        assert!(
            head.to_ascii_lowercase().contains("upgrade: trellis-dial"),
            "{head}"
        );

        // Past the 101 the connection is an opaque pipe: no framing, no
        // HTTP.
        stream.write_all(b"hello over the pipe").await.unwrap();
        let mut echoed = [0u8; 19];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello over the pipe");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_dial_failure_stays_http() {
    timeout(WAIT, async {
        let (_dir, path) = start_unix_server().await;

        // Grab a port with nothing listening on it.
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let request = format!(
            "POST /localapi/v0/dial HTTP/1.1\r\n\
             Host: local-trellisd.sock\r\n\
             Connection: upgrade\r\n\
             Upgrade: trellis-dial\r\n\
             Dial-Host: 127.0.0.1\r\n\
             Dial-Port: {port}\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 502"), "{head}");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_tcp_transport_requires_token() {
    timeout(WAIT, async {
        let backend = Arc::new(MemBackend::new());
        let server = Arc::new(Server::new(
            backend,
            Arc::new(Registry::new()),
            "e2e".to_string(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = trellis_localapi::generate_token();
        let tok = token.clone();
        tokio::spawn(async move {
            let _ = server.run_tcp_listener(listener, tok).await;
        });

        // Without the token the connection has no identity at all.
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /localapi/v0/status HTTP/1.1\r\n\
                  Host: 127.0.0.1\r\n\
                  Connection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 403"), "{response}");

        // With it, reads work.
        use base64::Engine as _;
        let auth = base64::engine::general_purpose::STANDARD.encode(format!(":{token}"));
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /localapi/v0/status HTTP/1.1\r\n\
             Host: 127.0.0.1\r\n\
             Authorization: Basic {auth}\r\n\
             Connection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    })
    .await
    .unwrap();
}
