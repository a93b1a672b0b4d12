//! Configuration data structures for Junction.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde-friendly and carry defaults so that minimal configs stay short. The configuration
//! is built once at startup and passed down by reference; only the `routing` section is
//! swapped at runtime when the file changes.
use std::time::Duration;

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::{
    core::{audit::AuditLevel, request_info::RequestInfoOptions, routing::TlsOptions},
    ports::route_store::RoutingSnapshot,
};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9090";
pub const DEFAULT_WEBHOOK_URL: &str =
    "https://junction-audit-webhook.junction-system.svc:6443/audit/webhook/event";
pub const DEFAULT_MEMBER_PROXY_PATH: &str =
    "/api/v1/namespaces/junction-system/services/:junction-gateway:/proxy";

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

/// Parse a humantime duration such as `"3s"` or `"250ms"`.
pub fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .wrap_err_with(|| format!("{field}: invalid duration '{value}'"))
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket address the gateway listens on, e.g. `0.0.0.0:9090`
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    pub logging: LoggingConfig,
    pub request_info: RequestInfoOptions,
    pub kubernetes: KubernetesConfig,
    pub multicluster: MultiClusterConfig,
    pub fallback: FallbackConfig,
    pub audit: AuditingOptions,
    /// Routing objects and clusters; hot-reloaded.
    pub routing: RoutingSnapshot,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            logging: LoggingConfig::default(),
            request_info: RequestInfoOptions::default(),
            kubernetes: KubernetesConfig::default(),
            multicluster: MultiClusterConfig::default(),
            fallback: FallbackConfig::default(),
            audit: AuditingOptions::default(),
            routing: RoutingSnapshot::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// The local orchestration API server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Base URL; the Kubernetes dispatcher is disabled when unset
    pub endpoint: Option<String>,
    pub bearer_token: Option<String>,
    /// Read at startup when `bearer_token` is unset
    pub bearer_token_file: Option<String>,
    /// PEM bundle trusted for the API server
    pub ca_file: Option<String>,
    pub insecure_skip_verify: bool,
}

impl KubernetesConfig {
    pub fn resolve_bearer_token(&self) -> Result<Option<String>> {
        if let Some(token) = self.bearer_token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Some(token.to_string()));
        }
        match self.bearer_token_file.as_deref() {
            Some(path) => {
                let token = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("Failed to read bearer token file {path}"))?;
                Ok(Some(token.trim().to_string()))
            }
            None => Ok(None),
        }
    }

    pub fn tls_options(&self) -> Result<TlsOptions> {
        let ca_bundle = match self.ca_file.as_deref() {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("Failed to read CA file {path}"))?,
            ),
            None => None,
        };
        Ok(TlsOptions {
            ca_bundle,
            insecure_skip_verify: self.insecure_skip_verify,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiClusterConfig {
    pub enabled: bool,
    /// Real name of the host cluster; requests for the literal cluster `host` resolve here
    pub host_cluster_name: Option<String>,
    /// Proxy subresource path on a member's API server that reaches the member gateway
    pub member_proxy_path: String,
}

impl Default for MultiClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host_cluster_name: None,
            member_proxy_path: DEFAULT_MEMBER_PROXY_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Upstream receiving every request no other dispatcher took
    pub upstream: Option<String>,
}

/// Options for the audit pipeline, fixed at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditingOptions {
    pub enabled: bool,
    pub level: AuditLevel,
    /// Also audit native orchestration API requests
    pub audit_kubernetes_requests: bool,
    /// Request/response bodies above this size are not captured
    pub max_body_bytes: usize,
    pub batch_size: usize,
    /// Collection window, measured from the first event of a batch
    pub batch_interval: String,
    pub event_queue_size: usize,
    /// How long a request waits for queue space before its event is dropped
    pub enqueue_timeout: String,
    pub webhook: WebhookOptions,
    pub log: AuditLogOptions,
    /// Defaults to `$HOSTNAME`
    pub host_name: Option<String>,
    /// Defaults to `$POD_IP`
    pub host_ip: Option<String>,
}

impl Default for AuditingOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            level: AuditLevel::Metadata,
            audit_kubernetes_requests: true,
            max_body_bytes: 1024 * 1024,
            batch_size: 100,
            batch_interval: "3s".to_string(),
            event_queue_size: 10_000,
            enqueue_timeout: "1s".to_string(),
            webhook: WebhookOptions::default(),
            log: AuditLogOptions::default(),
            host_name: None,
            host_ip: None,
        }
    }
}

impl AuditingOptions {
    pub fn batch_interval(&self) -> Result<Duration> {
        parse_duration("audit.batch_interval", &self.batch_interval)
    }

    pub fn enqueue_timeout(&self) -> Result<Duration> {
        parse_duration("audit.enqueue_timeout", &self.enqueue_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookOptions {
    pub enabled: bool,
    pub url: String,
    /// Maximum concurrent deliveries
    pub senders: usize,
    /// How long a batch waits for a free sender before it is dropped
    pub wait_timeout: String,
    /// Upper bound for one delivery, connect to response
    pub send_timeout: String,
    /// Audit sinks usually live in-cluster behind self-signed certificates
    pub insecure_skip_verify: bool,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            url: DEFAULT_WEBHOOK_URL.to_string(),
            senders: 100,
            wait_timeout: "1s".to_string(),
            send_timeout: "3s".to_string(),
            insecure_skip_verify: true,
        }
    }
}

impl WebhookOptions {
    pub fn wait_timeout(&self) -> Result<Duration> {
        parse_duration("audit.webhook.wait_timeout", &self.wait_timeout)
    }

    pub fn send_timeout(&self) -> Result<Duration> {
        parse_duration("audit.webhook.send_timeout", &self.send_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditLogOptions {
    pub enabled: bool,
    pub path: String,
    pub max_size_mb: u64,
    pub max_age_days: u64,
    pub max_backups: usize,
}

impl Default for AuditLogOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/var/log/junction/audit.log".to_string(),
            max_size_mb: 100,
            max_age_days: 7,
            max_backups: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert!(!config.audit.enabled);
        assert_eq!(config.audit.batch_size, 100);
        assert_eq!(config.audit.batch_interval().unwrap(), Duration::from_secs(3));
        assert_eq!(config.audit.event_queue_size, 10_000);
        assert_eq!(config.audit.webhook.senders, 100);
        assert_eq!(config.audit.webhook.url, DEFAULT_WEBHOOK_URL);
        assert!(config.audit.webhook.insecure_skip_verify);
        assert!(config.audit.audit_kubernetes_requests);
        assert_eq!(config.multicluster.member_proxy_path, DEFAULT_MEMBER_PROXY_PATH);
    }

    #[test]
    fn test_minimal_json_fills_defaults() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "audit": { "enabled": true, "level": "RequestResponse", "batch_interval": "250ms" }
        }))
        .unwrap();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.audit.level, AuditLevel::RequestResponse);
        assert_eq!(
            config.audit.batch_interval().unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(config.audit.webhook.send_timeout().unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_duration_is_reported_with_field() {
        let options = AuditingOptions {
            enqueue_timeout: "soon".to_string(),
            ..AuditingOptions::default()
        };
        let err = options.enqueue_timeout().unwrap_err();
        assert!(format!("{err:#}").contains("audit.enqueue_timeout"));
    }

    #[test]
    fn test_bearer_token_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"secret-token\n").unwrap();
        let kubernetes = KubernetesConfig {
            bearer_token_file: Some(file.path().to_string_lossy().into_owned()),
            ..KubernetesConfig::default()
        };
        assert_eq!(
            kubernetes.resolve_bearer_token().unwrap().as_deref(),
            Some("secret-token")
        );
        assert_eq!(KubernetesConfig::default().resolve_bearer_token().unwrap(), None);
    }
}
