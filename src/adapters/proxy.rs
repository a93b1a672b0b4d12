//! Forwarding of a prepared request to an upstream, shared by every dispatcher.
//!
//! Handles hop-by-hop header hygiene, `X-Forwarded-*` headers and protocol upgrades. A
//! `101 Switching Protocols` answer is returned to the caller as-is while a background
//! task splices the two upgraded connections together.
use std::net::SocketAddr;

use axum::body::Body;
use hyper::{
    HeaderMap, Request, Response, StatusCode, Uri,
    header::{self, HeaderName, HeaderValue},
};
use hyper_util::rt::TokioIo;

use crate::{
    core::error::{GatewayError, GatewayResult},
    metrics::{self, UpstreamTimer},
    ports::http_client::HttpClient,
};

/// Side header carrying the caller's original `Authorization` across a member-cluster hop.
pub const SIDE_AUTHORIZATION: &str = "x-junction-authorization";

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Join an upstream base URL (which may carry a path prefix) with a path and query.
pub fn upstream_uri(base: &str, path_and_query: &str) -> GatewayResult<Uri> {
    let base = base.trim_end_matches('/');
    let joined = if path_and_query.starts_with('/') {
        format!("{base}{path_and_query}")
    } else {
        format!("{base}/{path_and_query}")
    };
    joined
        .parse()
        .map_err(|e| GatewayError::Internal(format!("invalid upstream uri {joined}: {e}")))
}

/// Replace the bearer credential presented upstream.
pub fn set_bearer_token(headers: &mut HeaderMap, token: &str) -> GatewayResult<()> {
    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| GatewayError::Internal("bearer token is not a valid header value".into()))?;
    headers.insert(header::AUTHORIZATION, value);
    Ok(())
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_addr: Option<SocketAddr>) {
    let Some(addr) = client_addr else {
        return;
    };
    let ip = addr.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Send `req` to `target` and return the upstream response.
///
/// `req` keeps its own headers; only transport-level headers are touched here. Connection
/// failures become `502`.
pub async fn forward(
    client: &dyn HttpClient,
    mut req: Request<Body>,
    target: Uri,
    client_addr: Option<SocketAddr>,
    dispatcher: &'static str,
) -> GatewayResult<Response<Body>> {
    let upgrade = if is_upgrade_request(req.headers()) {
        req.headers().get(header::UPGRADE).cloned()
    } else {
        None
    };
    let inbound_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

    let original_host = req.headers().get(header::HOST).cloned();
    let headers = req.headers_mut();
    remove_hop_by_hop(headers);
    if let Some(protocol) = upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol);
    }
    append_forwarded_for(headers, client_addr);
    if let Some(host) = original_host {
        if !headers.contains_key(&X_FORWARDED_HOST) {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }
    *req.uri_mut() = target;

    tracing::debug!(dispatcher, upstream = %req.uri(), "Forwarding request");
    let mut response = {
        let _timer = UpstreamTimer::new(dispatcher);
        client.send_request(req).await?
    };

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(inbound_upgrade) = inbound_upgrade {
            let outbound_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(async move {
                let (inbound, outbound) = match tokio::try_join!(inbound_upgrade, outbound_upgrade) {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(dispatcher, error = %e, "Upgrade handshake failed");
                        return;
                    }
                };
                let mut inbound = TokioIo::new(inbound);
                let mut outbound = TokioIo::new(outbound);
                metrics::tunnel_opened();
                match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
                    Ok((up, down)) => {
                        tracing::debug!(dispatcher, bytes_up = up, bytes_down = down, "Tunnel closed");
                    }
                    Err(e) => tracing::debug!(dispatcher, error = %e, "Tunnel closed with error"),
                }
                metrics::tunnel_closed();
            });
        }
        return Ok(response);
    }

    remove_hop_by_hop(response.headers_mut());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_uri_keeps_base_path() {
        let uri = upstream_uri("https://gw.example:8443/proxy/", "/api/v1/pods?limit=1").unwrap();
        assert_eq!(uri.to_string(), "https://gw.example:8443/proxy/api/v1/pods?limit=1");
        let uri = upstream_uri("http://backend", "healthz").unwrap();
        assert_eq!(uri.to_string(), "http://backend/healthz");
        assert!(upstream_uri("http://bad host", "/").is_err());
    }

    #[test]
    fn test_remove_hop_by_hop_includes_connection_listed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        remove_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade_request(&headers));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_upgrade_request(&headers));
    }

    #[test]
    fn test_forwarded_for_appends_client() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        append_forwarded_for(&mut headers, Some("192.168.1.7:5555".parse().unwrap()));
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.1, 192.168.1.7");
    }

    #[test]
    fn test_set_bearer_token() {
        let mut headers = HeaderMap::new();
        set_bearer_token(&mut headers, "abc").unwrap();
        assert_eq!(headers[header::AUTHORIZATION], "Bearer abc");
        assert!(set_bearer_token(&mut headers, "bad\ntoken").is_err());
    }
}
