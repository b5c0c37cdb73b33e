use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use homeport::ProxyBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Minimal HTTP backend that answers every request with a fixed body and
/// counts hits.
async fn spawn_backend(body: &'static str) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let hits = Arc::clone(&hits_counter);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                hits.fetch_add(1, Ordering::SeqCst);
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    (port, hits)
}

/// Raw HTTP/1.1 GET so the Host header is fully under test control.
async fn raw_get(port: u16, host: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nhost: {}\r\nconnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn routes_by_path_prefix_to_the_right_backend() {
    let (api_port, api_hits) = spawn_backend("api-backend").await;
    let (docs_port, docs_hits) = spawn_backend("docs-backend").await;

    let mut proxy = ProxyBuilder::new()
        .with_listen_port(0)
        .add_service("api", api_port)
        .unwrap()
        .add_service("docs", docs_port)
        .unwrap()
        .build();
    let addr = proxy.start().await.unwrap();

    let response = raw_get(addr.port(), "localhost", "/docs/index.html").await;
    assert!(response.contains("200 OK"), "response: {}", response);
    assert!(response.contains("docs-backend"));

    // Only the docs backend was hit.
    assert_eq!(docs_hits.load(Ordering::SeqCst), 1);
    assert_eq!(api_hits.load(Ordering::SeqCst), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn routes_by_subdomain_label() {
    let (api_port, api_hits) = spawn_backend("api-backend").await;

    let mut proxy = ProxyBuilder::new()
        .with_listen_port(0)
        .add_service("api", api_port)
        .unwrap()
        .build();
    let addr = proxy.start().await.unwrap();

    let response = raw_get(addr.port(), "api.example.com", "/v1/users").await;
    assert!(response.contains("200 OK"), "response: {}", response);
    assert!(response.contains("api-backend"));
    assert_eq!(api_hits.load(Ordering::SeqCst), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn unknown_route_returns_not_found_without_forwarding() {
    let (api_port, api_hits) = spawn_backend("api-backend").await;

    let mut proxy = ProxyBuilder::new()
        .with_listen_port(0)
        .add_service("api", api_port)
        .unwrap()
        .build();
    let addr = proxy.start().await.unwrap();

    let response = raw_get(addr.port(), "localhost", "/admin/login").await;
    assert!(response.contains("404"), "response: {}", response);
    assert!(response.contains("route not found"));
    assert_eq!(api_hits.load(Ordering::SeqCst), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn dead_backend_yields_service_unavailable() {
    // Reserve a port and close it so nothing is listening there.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let mut proxy = ProxyBuilder::new()
        .with_listen_port(0)
        .add_service("api", dead_port)
        .unwrap()
        .build();
    let addr = proxy.start().await.unwrap();

    let response = raw_get(addr.port(), "localhost", "/api/health").await;
    assert!(response.contains("503"), "response: {}", response);
    assert!(response.contains("service unavailable"));
    assert!(response.contains("api"));

    proxy.stop().await;
}

#[tokio::test]
async fn health_endpoint_answers_locally() {
    let mut proxy = ProxyBuilder::new()
        .with_listen_port(0)
        .add_service("api", 59999)
        .unwrap()
        .build();
    let addr = proxy.start().await.unwrap();

    let response = raw_get(addr.port(), "localhost", "/healthz").await;
    assert!(response.contains("200 OK"));
    assert!(response.contains("\"status\":\"ok\""));

    proxy.stop().await;
}

#[tokio::test]
async fn root_lists_registered_services() {
    let mut proxy = ProxyBuilder::new()
        .with_listen_port(0)
        .add_service("api", 59999)
        .unwrap()
        .build();
    let addr = proxy.start().await.unwrap();

    let response = raw_get(addr.port(), "localhost", "/").await;
    assert!(response.contains("200 OK"));
    assert!(response.contains("\"service\":\"api\""));

    proxy.stop().await;
}

#[tokio::test]
async fn stopped_proxy_refuses_connections() {
    let mut proxy = ProxyBuilder::new()
        .with_listen_port(0)
        .add_service("api", 59999)
        .unwrap()
        .build();
    let addr = proxy.start().await.unwrap();
    proxy.stop().await;

    assert!(TcpStream::connect(("127.0.0.1", addr.port())).await.is_err());
}

#[tokio::test]
async fn path_prefix_is_stripped_before_forwarding() {
    // Echo back the request line so the test can see the forwarded path.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request_line = String::from_utf8_lossy(&buf[..n])
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    request_line.len(),
                    request_line
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    let mut proxy = ProxyBuilder::new()
        .with_listen_port(0)
        .add_service("api", port)
        .unwrap()
        .build();
    let addr = proxy.start().await.unwrap();

    let response = raw_get(addr.port(), "localhost", "/api/v1/users?page=2").await;
    assert!(
        response.contains("GET /v1/users?page=2"),
        "response: {}",
        response
    );

    proxy.stop().await;
}
