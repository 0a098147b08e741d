//! Client and agent over loopback TCP.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use h1_engine::config::{AgentConfig, TransportConfig};
use h1_engine::http::Method;
use h1_engine::net::Protocol;
use h1_engine::{Agent, AgentKey, Client, HttpError, TcpTransport};

mod common;

fn client(keep_alive: bool) -> Client {
    let transport = Arc::new(TcpTransport::new(TransportConfig::default()));
    let config = AgentConfig {
        keep_alive,
        keep_alive_msecs: 5_000,
        ..AgentConfig::default()
    };
    Client::new(Agent::new(transport, config))
}

#[tokio::test]
async fn keep_alive_reuses_one_connection() {
    let (addr, accepted) = common::start_keep_alive_backend("pong").await;
    let client = client(true);
    let url = format!("http://{}/ping", addr);

    for _ in 0..3 {
        let res = client.fetch(Method::Get, &url, &[], None).await.unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.text(), "pong");
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    let key = AgentKey::new(addr.ip().to_string(), addr.port(), Protocol::Http);
    assert_eq!(client.agent().free_count(&key), 1);
    assert_eq!(client.agent().active_count(&key), 0);
    client.agent().destroy();
    assert_eq!(client.agent().free_count(&key), 0);
}

#[tokio::test]
async fn without_keep_alive_each_request_connects() {
    let (addr, accepted) = common::start_keep_alive_backend("pong").await;
    let client = client(false);
    let url = format!("http://{}/ping", addr);

    client.fetch(Method::Get, &url, &[], None).await.unwrap();
    client.fetch(Method::Get, &url, &[], None).await.unwrap();

    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn client_talks_to_engine_server() {
    let (server, addr) = common::start_echo_server().await;
    let client = client(true);

    let res = client
        .fetch(
            Method::Put,
            &format!("http://{}/doc", addr),
            &[("X-Trace", "abc")],
            Some("body".into()),
        )
        .await
        .unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.headers.get_str("connection"), Some("close"));
    assert_eq!(res.text(), "PUT /doc body");

    server.close();
}

#[tokio::test]
async fn refused_connection_surfaces_as_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(false)
        .fetch(Method::Get, &format!("http://{}/", addr), &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Connection(_)));
}
