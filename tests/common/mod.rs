// Shared fixtures: an echoing upstream and an in-process gateway built from config.
#![allow(dead_code)]

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    http::{StatusCode, header},
    response::Response,
    routing::any,
};
use http_body_util::BodyExt;
use http::request::Parts;
use hyper_util::rt::TokioIo;
use junction::{
    adapters::{AuditFilter, DispatchChain, FilterChain, HttpHandler, SnapshotStore, TransportCache},
    config::models::GatewayConfig,
    core::{RequestInfoResolver, UserInfo},
    ports::auth::{AuthError, Authenticator},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::ServiceExt;

pub const CLIENT_ADDR: &str = "10.1.2.3:50000";

/// Start an upstream that answers with a JSON description of what it received.
///
/// `x-echo-status` picks the response status; `/tunnel` accepts an `Upgrade: echo`
/// handshake and echoes raw bytes afterwards.
pub async fn spawn_echo_upstream() -> SocketAddr {
    let app = Router::new().route("/tunnel", any(tunnel)).fallback(echo);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

async fn echo(req: Request) -> Response {
    let status = req
        .headers()
        .get("x-echo-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(200);

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in req.headers() {
        let value = value.to_str().unwrap_or_default();
        headers
            .entry(name.to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let body = req.into_body().collect().await.unwrap().to_bytes();

    let echoed = serde_json::json!({
        "method": method,
        "path": path,
        "query": query,
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-upstream", "echo")
        .body(Body::from(echoed.to_string()))
        .unwrap()
}

async fn tunnel(mut req: Request) -> Response {
    let upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let Ok(upgraded) = upgrade.await else {
            return;
        };
        let mut io = TokioIo::new(upgraded);
        let mut buf = [0u8; 256];
        loop {
            match io.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if io.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "echo")
        .body(Body::empty())
        .unwrap()
}

/// `Bearer alice` is a developer; any other bearer token is rejected.
pub struct StaticTokens;

#[async_trait]
impl Authenticator for StaticTokens {
    async fn authenticate(&self, parts: &Parts) -> Result<Option<UserInfo>, AuthError> {
        match parts.headers.get(header::AUTHORIZATION).map(|v| v.as_bytes()) {
            Some(b"Bearer alice") => Ok(Some(UserInfo {
                username: "alice".to_string(),
                uid: "1001".to_string(),
                groups: vec!["dev".to_string(), "system:authenticated".to_string()],
                extra: BTreeMap::new(),
            })),
            Some(_) => Err(AuthError::InvalidCredentials("unknown token".into())),
            None => Ok(None),
        }
    }
}

pub fn gateway(config: &GatewayConfig, audit: Option<AuditFilter>) -> Router {
    let transports = Arc::new(TransportCache::new());
    let snapshots = Arc::new(SnapshotStore::with_snapshot(config.routing.clone()));
    let resolver = RequestInfoResolver::new(&config.request_info);
    let dispatch = DispatchChain::from_config(config, snapshots.clone(), &resolver, transports).unwrap();
    let mut builder = FilterChain::builder(resolver, dispatch).authenticator(Arc::new(StaticTokens));
    if let Some(audit) = audit {
        builder = builder.audit(audit);
    }
    Arc::new(HttpHandler::new(Arc::new(builder.build()), snapshots)).router()
}

/// Serve the gateway on an ephemeral port, for tests that need a real connection.
pub async fn serve_gateway(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap()
    });
    addr
}

pub fn get(uri: &str) -> http::request::Builder {
    http::Request::builder().method("GET").uri(uri)
}

/// Send one request through the router as if it came from [`CLIENT_ADDR`].
pub async fn send(router: &Router, mut req: Request) -> Response {
    let client: SocketAddr = CLIENT_ADDR.parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(client));
    router.clone().oneshot(req).await.unwrap()
}

pub async fn json_body(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn text_body(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
