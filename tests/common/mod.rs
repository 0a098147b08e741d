//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use h1_engine::config::ServerConfig;
use h1_engine::http::{BodyReadable, HeaderWritable, ServerEvent, ServerEvents};
use h1_engine::{IncomingMessage, Server, ServerResponse, TcpTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Wait for the next event matching `pick`, failing after two seconds.
pub async fn next_event<T>(
    events: &mut ServerEvents,
    mut pick: impl FnMut(ServerEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("server event stream ended");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for server event")
}

/// Start a server on an ephemeral loopback port that answers every request
/// with `<METHOD> <url> <body>` as plain text.
pub async fn start_echo_server() -> (Server, SocketAddr) {
    let transport = Arc::new(TcpTransport::default());
    let (server, mut events) = Server::new(transport, ServerConfig::default());
    server.listen(0, "127.0.0.1", 64).unwrap();

    let addr = next_event(&mut events, |event| match event {
        ServerEvent::Listening(addr) => Some(addr),
        _ => None,
    })
    .await;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ServerEvent::Request(req, res) = event {
                tokio::spawn(echo(req, res));
            }
        }
    });
    (server, addr)
}

async fn echo(req: IncomingMessage, res: ServerResponse) {
    let body = req.read_to_end().await.unwrap_or_default();
    let text = format!(
        "{} {} {}",
        req.method().unwrap_or_default(),
        req.url().unwrap_or_default(),
        String::from_utf8_lossy(&body)
    );
    res.set_header("Content-Type", "text/plain").unwrap();
    res.set_header("X-Echo", "1").unwrap();
    res.end_with(text).unwrap();
}

/// A raw TCP backend that serves any number of requests per connection with
/// a fixed, length-delimited body. Returns its address and an accept counter.
pub async fn start_keep_alive_backend(body: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_keep_alive(socket, body));
        }
    });
    (addr, accepted)
}

async fn serve_keep_alive(mut socket: TcpStream, body: &'static str) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        while let Some(end) = find_head_end(&buf) {
            buf.drain(..end);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
                body.len(),
                body
            );
            if socket.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Send raw bytes and read until the peer closes.
pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut out))
        .await
        .expect("peer did not close")
        .unwrap();
    String::from_utf8_lossy(&out).into_owned()
}
