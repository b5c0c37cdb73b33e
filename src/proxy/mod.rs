//! Multi-service reverse proxy.
//!
//! One local HTTP listener demultiplexes inbound requests to the correct
//! backend service, so many services can share a single tunnel endpoint.
//! Routes are fixed for the lifetime of a proxy instance: the route table is
//! built before `start()` and read-only once serving begins, which keeps
//! concurrent request handling lock-free.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};

/// Default port the proxy listens on when none is configured.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Grace period for in-flight requests when the proxy stops.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

type ProxyBody = BoxBody<Bytes, hyper::Error>;
type ForwardClient = Client<HttpConnector, Incoming>;

/// One routing entry: a service reachable by subdomain label or path prefix.
#[derive(Debug, Clone)]
pub struct Route {
    pub service: String,
    pub port: u16,
    /// Subdomain label, e.g. `api` or `demo-api` when a prefix is set
    pub subdomain: String,
    /// Path prefix, always `/{service}`
    pub path: String,
}

/// Ordered, read-only mapping from route key to backend.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Route>,
    tunnel_id: String,
}

/// How a request matched its route; path matches strip the prefix before
/// forwarding, subdomain matches forward the path unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteMatch {
    Subdomain,
    PathPrefix,
}

impl RouteTable {
    /// Resolve a request to a route: subdomain label first, then the first
    /// path segment.
    fn resolve(&self, host_label: Option<&str>, path: &str) -> Option<(&Route, RouteMatch)> {
        if let Some(label) = host_label {
            let resolved = self.routes.iter().find(|route| {
                label == route.subdomain
                    || label == format!("{}-{}", route.subdomain, self.tunnel_id)
            });
            if let Some(route) = resolved {
                return Some((route, RouteMatch::Subdomain));
            }
        }
        let first_segment = path.trim_start_matches('/').split('/').next()?;
        if first_segment.is_empty() {
            return None;
        }
        self.routes
            .iter()
            .find(|route| route.path.trim_start_matches('/') == first_segment)
            .map(|route| (route, RouteMatch::PathPrefix))
    }

    /// Look up a route by its key (service name, subdomain label, or path
    /// prefix). Unknown keys are an error rather than a guess.
    pub fn route_for(&self, key: &str) -> Result<&Route> {
        let key = key.trim_start_matches('/');
        self.routes
            .iter()
            .find(|route| {
                route.service == key
                    || route.subdomain == key
                    || route.path.trim_start_matches('/') == key
            })
            .ok_or_else(|| Error::RouteNotFound(key.to_string()))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

/// Builds the route table before the proxy starts. Entries cannot be added
/// after `build()`.
pub struct ProxyBuilder {
    prefix: Option<String>,
    listen_port: u16,
    drain_grace: Duration,
    services: Vec<(String, u16)>,
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self {
            prefix: None,
            listen_port: DEFAULT_PROXY_PORT,
            drain_grace: DEFAULT_DRAIN_GRACE,
            services: Vec::new(),
        }
    }

    /// Label prefix for subdomain keys (`{prefix}-{service}`).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Port for the local listener. Use 0 for an OS-assigned port.
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Register a service route. Duplicate names are rejected.
    pub fn add_service(mut self, name: impl Into<String>, port: u16) -> Result<Self> {
        let name = name.into();
        if self.services.iter().any(|(existing, _)| *existing == name) {
            return Err(Error::Proxy(format!(
                "route key '{}' is already registered",
                name
            )));
        }
        self.services.push((name, port));
        Ok(self)
    }

    pub fn build(self) -> MultiServiceProxy {
        let tunnel_id = generate_tunnel_id();
        let routes = self
            .services
            .into_iter()
            .map(|(name, port)| {
                let subdomain = match &self.prefix {
                    Some(prefix) => format!("{}-{}", prefix, name),
                    None => name.clone(),
                };
                Route {
                    path: format!("/{}", name),
                    service: name,
                    port,
                    subdomain,
                }
            })
            .collect();

        MultiServiceProxy {
            table: Arc::new(RouteTable { routes, tunnel_id }),
            listen_port: self.listen_port,
            drain_grace: self.drain_grace,
            running: None,
        }
    }
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct RunningProxy {
    local_addr: SocketAddr,
    accept_cancel: CancellationToken,
    hard_cancel: CancellationToken,
    tracker: TaskTracker,
    accept_handle: JoinHandle<()>,
}

/// The proxy itself: one listener, a fixed route table, streaming forwards.
pub struct MultiServiceProxy {
    table: Arc<RouteTable>,
    listen_port: u16,
    drain_grace: Duration,
    running: Option<RunningProxy>,
}

impl MultiServiceProxy {
    /// Bind the local listener and begin forwarding.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.running.is_some() {
            return Err(Error::Proxy("proxy already running".to_string()));
        }

        let listener = TcpListener::bind(("127.0.0.1", self.listen_port))
            .await
            .map_err(|e| Error::Proxy(format!("failed to bind proxy listener: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Proxy(e.to_string()))?;

        let accept_cancel = CancellationToken::new();
        let hard_cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let client: ForwardClient = Client::builder(TokioExecutor::new()).build_http();
        let table = Arc::clone(&self.table);

        tracing::info!(
            "Reverse proxy listening on http://{} with {} route(s)",
            local_addr,
            table.routes.len()
        );

        let accept_handle = {
            let accept_cancel = accept_cancel.clone();
            let hard_cancel = hard_cancel.clone();
            let tracker = tracker.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = accept_cancel.cancelled() => break,
                        accepted = listener.accept() => {
                            let (stream, _peer) = match accepted {
                                Ok(pair) => pair,
                                Err(e) => {
                                    tracing::warn!("Proxy accept error: {}", e);
                                    continue;
                                }
                            };
                            let table = Arc::clone(&table);
                            let client = client.clone();
                            let hard_cancel = hard_cancel.clone();
                            tracker.spawn(async move {
                                let service = service_fn(move |req| {
                                    handle_request(req, Arc::clone(&table), client.clone())
                                });
                                let connection = http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service);
                                tokio::select! {
                                    result = connection => {
                                        if let Err(e) = result {
                                            tracing::debug!("Proxy connection error: {}", e);
                                        }
                                    }
                                    _ = hard_cancel.cancelled() => {
                                        tracing::debug!("Proxy connection aborted during shutdown");
                                    }
                                }
                            });
                        }
                    }
                }
            })
        };

        self.running = Some(RunningProxy {
            local_addr,
            accept_cancel,
            hard_cancel,
            tracker,
            accept_handle,
        });
        Ok(local_addr)
    }

    /// Stop accepting and drain in-flight requests within the grace period;
    /// whatever remains afterwards is forcibly closed.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.accept_cancel.cancel();
        let _ = running.accept_handle.await;

        running.tracker.close();
        if tokio::time::timeout(self.drain_grace, running.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "Proxy drain grace ({:?}) expired, closing remaining connections",
                self.drain_grace
            );
            running.hard_cancel.cancel();
            running.tracker.wait().await;
        }
        tracing::info!("Reverse proxy stopped");
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn route_table(&self) -> &RouteTable {
        &self.table
    }

    /// Derive each service's public URL from the base tunnel URL.
    ///
    /// Pure string composition, no network calls. Hosts that support
    /// wildcard subdomains get subdomain-style URLs; everything else falls
    /// back to path-prefix routing.
    pub fn service_urls(&self, base_tunnel_url: &str) -> HashMap<String, String> {
        let mut urls = HashMap::new();
        let Ok(base) = url::Url::parse(base_tunnel_url) else {
            return urls;
        };
        let host = base.host_str().unwrap_or_default();
        let scheme = base.scheme();

        for route in &self.table.routes {
            let url = if host_supports_subdomains(host) {
                // Replace the first label: {sub}-{tunnelid}.{parent}
                match host.split_once('.') {
                    Some((_, parent)) => format!(
                        "{}://{}-{}.{}",
                        scheme, route.subdomain, self.table.tunnel_id, parent
                    ),
                    None => format!("{}{}", base_tunnel_url.trim_end_matches('/'), route.path),
                }
            } else {
                format!("{}{}", base_tunnel_url.trim_end_matches('/'), route.path)
            };
            urls.insert(route.service.clone(), url);
        }
        urls
    }
}

fn host_supports_subdomains(host: &str) -> bool {
    host.ends_with(".trycloudflare.com")
}

/// Random-enough identifier separating this proxy instance's subdomains from
/// earlier runs on the same base domain.
fn generate_tunnel_id() -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::process::id().hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
        .hash(&mut hasher);
    format!("{:08x}", (hasher.finish() & 0xffff_ffff) as u32)
}

async fn handle_request(
    req: Request<Incoming>,
    table: Arc<RouteTable>,
    client: ForwardClient,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    let path = req.uri().path().to_string();

    if path == "/healthz" {
        return Ok(json_response(
            StatusCode::OK,
            json!({ "status": "ok", "services": table.routes.len() }),
        ));
    }

    let host_label = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host))
        .and_then(|host| host.split('.').next())
        .map(str::to_string);

    let (route, matched_by) = match table.resolve(host_label.as_deref(), &path) {
        Some((route, matched_by)) => (route.clone(), matched_by),
        None => {
            if path == "/" {
                return Ok(service_index(&table));
            }
            let key = host_label.unwrap_or_else(|| path.clone());
            return Ok(json_response(
                StatusCode::NOT_FOUND,
                json!({
                    "error": "route not found",
                    "key": key,
                    "routes": table.routes.iter().map(|r| r.service.as_str()).collect::<Vec<_>>(),
                }),
            ));
        }
    };

    match forward(req, &route, matched_by, &client).await {
        Ok(response) => Ok(response),
        Err(e) => {
            tracing::warn!("Proxy error for '{}': {}", route.service, e);
            Ok(json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": "service unavailable",
                    "service": route.service,
                    "port": route.port,
                }),
            ))
        }
    }
}

/// Forward the request to the route's backend, streaming both bodies.
async fn forward(
    req: Request<Incoming>,
    route: &Route,
    matched_by: RouteMatch,
    client: &ForwardClient,
) -> std::result::Result<Response<ProxyBody>, hyper_util::client::legacy::Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    // Path-routed requests have the service prefix stripped before
    // forwarding; subdomain-routed requests pass through unchanged.
    let forwarded_path = if matched_by == RouteMatch::PathPrefix {
        match path_and_query.strip_prefix(route.path.as_str()) {
            Some(rest) if rest.is_empty() => "/".to_string(),
            Some(rest) if rest.starts_with('/') || rest.starts_with('?') => rest.to_string(),
            _ => path_and_query,
        }
    } else {
        path_and_query
    };

    let uri: Uri = format!("http://127.0.0.1:{}{}", route.port, forwarded_path)
        .parse()
        .expect("forward URI from validated parts");

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    // The backend sees itself as the host
    parts.headers.remove(HOST);
    let outbound = Request::from_parts(parts, body);

    let response = client.request(outbound).await?;
    Ok(response.map(|body| body.boxed()))
}

fn service_index(table: &RouteTable) -> Response<ProxyBody> {
    let services: Vec<serde_json::Value> = table
        .routes
        .iter()
        .map(|route| {
            json!({
                "service": route.service,
                "path": route.path,
                "port": route.port,
            })
        })
        .collect();
    json_response(StatusCode::OK, json!({ "services": services }))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<ProxyBody> {
    let body = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap_or_else(|_| {
            let mut response = Response::new(full_body("{}"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        })
}

fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable {
            routes: vec![
                Route {
                    service: "api".to_string(),
                    port: 8081,
                    subdomain: "api".to_string(),
                    path: "/api".to_string(),
                },
                Route {
                    service: "docs".to_string(),
                    port: 8082,
                    subdomain: "docs".to_string(),
                    path: "/docs".to_string(),
                },
            ],
            tunnel_id: "cafe1234".to_string(),
        }
    }

    #[test]
    fn resolves_by_path_prefix() {
        let table = table();
        let (route, matched_by) = table.resolve(None, "/docs/index.html").unwrap();
        assert_eq!(route.service, "docs");
        assert_eq!(route.port, 8082);
        assert_eq!(matched_by, RouteMatch::PathPrefix);
    }

    #[test]
    fn resolves_by_subdomain_label() {
        let table = table();
        let (route, matched_by) = table.resolve(Some("api"), "/anything").unwrap();
        assert_eq!(route.service, "api");
        assert_eq!(matched_by, RouteMatch::Subdomain);
    }

    #[test]
    fn resolves_by_subdomain_with_tunnel_id() {
        let table = table();
        let (route, _) = table.resolve(Some("docs-cafe1234"), "/").unwrap();
        assert_eq!(route.service, "docs");
    }

    #[test]
    fn unknown_key_resolves_to_none() {
        let table = table();
        assert!(table.resolve(Some("admin"), "/admin").is_none());
        assert!(table.resolve(None, "/").is_none());
    }

    #[test]
    fn route_for_unknown_key_is_an_error() {
        let table = table();
        assert_eq!(table.route_for("docs").unwrap().port, 8082);
        assert!(matches!(
            table.route_for("admin"),
            Err(Error::RouteNotFound(_))
        ));
    }

    #[test]
    fn duplicate_route_key_is_rejected() {
        let builder = ProxyBuilder::new().add_service("api", 8081).unwrap();
        assert!(builder.add_service("api", 9000).is_err());
    }

    #[test]
    fn subdomain_urls_for_wildcard_hosts() {
        let proxy = ProxyBuilder::new()
            .add_service("api", 8081)
            .unwrap()
            .build();
        let urls = proxy.service_urls("https://random-words.trycloudflare.com");
        let api = urls.get("api").unwrap();
        assert!(api.starts_with("https://api-"));
        assert!(api.ends_with(".trycloudflare.com"));
    }

    #[test]
    fn path_urls_for_other_hosts() {
        let proxy = ProxyBuilder::new()
            .add_service("api", 8081)
            .unwrap()
            .build();
        let urls = proxy.service_urls("https://example.ngrok-free.app");
        assert_eq!(
            urls.get("api").map(String::as_str),
            Some("https://example.ngrok-free.app/api")
        );
    }

    #[test]
    fn prefix_is_applied_to_subdomains() {
        let proxy = ProxyBuilder::new()
            .with_prefix("demo")
            .add_service("api", 8081)
            .unwrap()
            .build();
        assert_eq!(proxy.route_table().routes()[0].subdomain, "demo-api");
    }
}
