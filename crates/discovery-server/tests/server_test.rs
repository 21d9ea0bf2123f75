use discovery_server::{Config, DiscoveryServer};
use registry::ServiceRecord;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_serve_until_shutdown() {
    let mut config = Config::default();
    config.discovery.enable_dns = false;
    config.health.check_interval = Duration::from_millis(50);
    config.health.check_timeout = Duration::from_millis(20);
    config.health.enable_auto_removal = false;

    let server = DiscoveryServer::new(config).unwrap();
    let registry = server.registry().clone();
    let monitor = server.monitor().clone();
    registry
        .register(ServiceRecord::new("api", "127.0.0.1", 8081))
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

    let response = http_get(addr, "/healthz").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("ok"));

    let response = http_get(addr, "/services").await;
    assert!(response.contains("\"name\":\"api\""));
    assert!(monitor.is_running().await);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(!monitor.is_running().await);
    assert!(!registry.is_running().await);
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = Config::default();
    config.server.listen_addr = taken.local_addr().unwrap().to_string();

    let server = DiscoveryServer::new(config).unwrap();
    let err = server
        .run_until(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to bind"));
}

#[tokio::test]
async fn test_broadcast_runs_with_server() {
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = Config::default();
    config.discovery.enable_dns = false;
    config.broadcast.enabled = true;
    config.broadcast.config.group = peer.local_addr().unwrap();
    config.broadcast.config.bind = "127.0.0.1:0".parse().unwrap();

    let server = DiscoveryServer::new(config).unwrap();
    let broadcast = server.broadcast().unwrap().clone();
    assert!(server.client().broadcast().is_some());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

    let mut running = false;
    for _ in 0..50 {
        if broadcast.is_running().await {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(running);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!broadcast.is_running().await);
}
