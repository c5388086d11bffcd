//! Directory protocol over real sockets
//!
//! Each test binds a directory on an ephemeral loopback port and talks to it
//! the way scripts do: dial, write one line, read until the server closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use pim_directory::{
    DirectoryClient, DirectoryClientError, DirectoryServer, DirectoryServerConfig,
};
use pim_proto::Token;
use pim_registry::Registry;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pim_directory=debug,pim_registry=debug")
        .with_test_writer()
        .try_init();
}

/// Start a directory with the given ttl, returning its address
async fn start_directory(ttl: Duration, sweep_interval: Duration) -> SocketAddr {
    init_tracing();

    let config = DirectoryServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        sweep_interval,
        request_timeout: Duration::from_secs(5),
    };
    let server = DirectoryServer::bind(config, Arc::new(Registry::new(ttl)))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    tokio::spawn(server.run());
    addr
}

/// Send one raw request and return everything the server wrote before closing
async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .expect("server did not close the connection")
        .unwrap();
    response
}

async fn add_service(addr: SocketAddr, address: &str, port: u16) -> String {
    let response = raw_request(addr, &format!("ADD_SERVICE {} {}\n", address, port)).await;
    let token = response
        .strip_prefix("200 ")
        .and_then(|rest| rest.strip_suffix('\n'))
        .unwrap_or_else(|| panic!("unexpected ADD_SERVICE response {:?}", response));
    token.to_string()
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[tokio::test]
async fn test_ping_answers_and_closes() {
    let addr = start_directory(Duration::from_secs(30), Duration::from_secs(10)).await;
    assert_eq!(raw_request(addr, "PING\n").await, "200 PONG\n");
}

#[tokio::test]
async fn test_add_service_then_get_info() {
    let addr = start_directory(Duration::from_secs(30), Duration::from_secs(10)).await;

    let token = add_service(addr, "host1", 9090).await;
    assert_eq!(token.len(), 36);
    assert!(token.parse::<Token>().is_ok());

    let response = raw_request(addr, &format!("GET_INFO {}\n", token)).await;
    let remaining: u64 = response
        .strip_prefix("200 Port: 9090 - TimeRemaining: ")
        .and_then(|rest| rest.strip_suffix(" - ServiceName: host1\n"))
        .unwrap_or_else(|| panic!("unexpected GET_INFO response {:?}", response))
        .parse()
        .unwrap();
    assert!((1..=30).contains(&remaining), "remaining = {}", remaining);
}

#[tokio::test]
async fn test_error_statuses() {
    let addr = start_directory(Duration::from_secs(30), Duration::from_secs(10)).await;

    assert_eq!(
        raw_request(addr, "GET_INFO not-a-real-token\n").await,
        "400 Invalid UUID\n"
    );
    assert_eq!(
        raw_request(addr, &format!("GET_INFO {}\n", Token::generate())).await,
        "404 UUID not found\n"
    );
    assert_eq!(raw_request(addr, "HELLO\n").await, "400 Invalid command\n");
    assert_eq!(
        raw_request(addr, "ADD_SERVICE host1\n").await,
        "400 Invalid port number\n"
    );
    assert_eq!(
        raw_request(addr, "ADD_SERVICE\n").await,
        "400 Missing service name\n"
    );
    assert_eq!(raw_request(addr, "GET_INFO\n").await, "400 Missing UUID\n");
}

#[tokio::test]
async fn test_concurrent_clients_get_distinct_tokens() {
    let addr = start_directory(Duration::from_secs(30), Duration::from_secs(10)).await;

    let mut handles = Vec::new();
    for i in 0..32u16 {
        handles.push(tokio::spawn(async move {
            add_service(addr, &format!("host{}", i), 9000 + i).await
        }));
    }

    let mut tokens = std::collections::HashSet::new();
    for handle in handles {
        assert!(tokens.insert(handle.await.unwrap()));
    }
    assert_eq!(tokens.len(), 32);
}

// ============================================================================
// EXPIRY
// ============================================================================

#[tokio::test]
async fn test_expired_token_never_comes_back() {
    let addr = start_directory(Duration::from_secs(1), Duration::from_millis(500)).await;

    let token = add_service(addr, "host1", 9090).await;
    tokio::time::sleep(Duration::from_millis(2_100)).await;

    let first = raw_request(addr, &format!("GET_INFO {}\n", token)).await;
    assert_eq!(first, "410 UUID has expired\n");

    for _ in 0..3 {
        let again = raw_request(addr, &format!("GET_INFO {}\n", token)).await;
        assert!(
            again == "410 UUID has expired\n" || again == "404 UUID not found\n",
            "expired token answered {:?}",
            again
        );
    }
}

// ============================================================================
// CLIENT HELPER
// ============================================================================

#[tokio::test]
async fn test_client_round_trip() {
    let addr = start_directory(Duration::from_secs(30), Duration::from_secs(10)).await;
    let client = DirectoryClient::new(addr.to_string());

    client.ping().await.unwrap();

    let token = client.add_service("10.0.0.7", 31337).await.unwrap();
    let info = client.get_info(&token).await.unwrap();
    assert_eq!(info.port, 31337);
    assert_eq!(info.service_name, "10.0.0.7");
    assert!(info.time_remaining <= 30);

    let err = client.get_info(&Token::generate()).await.unwrap_err();
    assert!(matches!(err, DirectoryClientError::NotFound));
    assert!(!err.is_unavailable());
}

#[tokio::test]
async fn test_client_reports_expiry() {
    let addr = start_directory(Duration::from_secs(1), Duration::from_secs(10)).await;
    let client = DirectoryClient::new(addr.to_string());

    let token = client.add_service("host1", 9090).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let err = client.get_info(&token).await.unwrap_err();
    assert!(matches!(err, DirectoryClientError::Expired));
}

#[tokio::test]
async fn test_wait_until_ready() {
    let addr = start_directory(Duration::from_secs(30), Duration::from_secs(10)).await;
    let client = DirectoryClient::new(addr.to_string());
    client
        .wait_until_ready(Duration::from_millis(50), Some(3))
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let client = DirectoryClient::new(dead.to_string());
    let err = client
        .wait_until_ready(Duration::from_millis(10), Some(2))
        .await
        .unwrap_err();
    assert!(err.is_unavailable());
}
