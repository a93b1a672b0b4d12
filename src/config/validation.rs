#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr};

use eyre::Result;

use crate::{
    config::models::{AuditingOptions, GatewayConfig, parse_duration},
    core::{
        directive::RouteMatcher,
        routing::{Endpoint, JsBundleRoute},
    },
    ports::route_store::RoutingSnapshot,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.request_info.api_prefixes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "request_info.api_prefixes".to_string(),
            });
        }

        if let Some(endpoint) = &config.kubernetes.endpoint {
            if let Err(e) = Self::validate_url(endpoint, "kubernetes.endpoint") {
                errors.push(e);
            }
        }

        if let Some(upstream) = &config.fallback.upstream {
            if let Err(e) = Self::validate_url(upstream, "fallback.upstream") {
                errors.push(e);
            }
        }

        if config.multicluster.enabled && !config.multicluster.member_proxy_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "multicluster.member_proxy_path".to_string(),
                message: "Must start with '/'".to_string(),
            });
        }

        if config.audit.enabled {
            errors.extend(Self::validate_audit(&config.audit));
        }

        errors.extend(Self::validate_routing(&config.routing));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate only the hot-reloadable routing section.
    pub fn validate_routing_snapshot(snapshot: &RoutingSnapshot) -> ValidationResult<()> {
        let errors = Self::validate_routing(snapshot);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_audit(options: &AuditingOptions) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("audit.batch_interval", &options.batch_interval),
            ("audit.enqueue_timeout", &options.enqueue_timeout),
            ("audit.webhook.wait_timeout", &options.webhook.wait_timeout),
            ("audit.webhook.send_timeout", &options.webhook.send_timeout),
        ] {
            if let Err(e) = parse_duration(field, value) {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("{e:#}"),
                });
            }
        }

        for (field, value) in [
            ("audit.batch_size", options.batch_size),
            ("audit.event_queue_size", options.event_queue_size),
        ] {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        if options.webhook.enabled {
            if options.webhook.senders == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "audit.webhook.senders".to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
            if let Err(e) = Self::validate_url(&options.webhook.url, "audit.webhook.url") {
                errors.push(e);
            }
        }

        if options.log.enabled {
            if options.log.path.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "audit.log.path".to_string(),
                });
            }
            if options.log.max_size_mb == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "audit.log.max_size_mb".to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        if !options.webhook.enabled && !options.log.enabled {
            errors.push(ValidationError::InvalidField {
                field: "audit".to_string(),
                message: "Auditing is enabled but no backend (webhook or log) is enabled"
                    .to_string(),
            });
        }

        errors
    }

    fn validate_routing(snapshot: &RoutingSnapshot) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        errors.extend(Self::check_duplicate_names(
            "api_services",
            snapshot.api_services.iter().map(|r| r.name.as_str()),
        ));
        errors.extend(Self::check_duplicate_names(
            "reverse_proxies",
            snapshot.reverse_proxies.iter().map(|r| r.name.as_str()),
        ));
        errors.extend(Self::check_duplicate_names(
            "js_bundles",
            snapshot.js_bundles.iter().map(|r| r.name.as_str()),
        ));
        errors.extend(Self::check_duplicate_names(
            "clusters",
            snapshot.clusters.iter().map(|c| c.name.as_str()),
        ));

        for route in &snapshot.api_services {
            let context = format!("api_services '{}'", route.name);
            if route.group.is_empty() || route.version.is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: context.clone(),
                    message: "group and version are required".to_string(),
                });
            }
            if let Err(e) = Self::validate_endpoint(&route.endpoint, &format!("{context} endpoint")) {
                errors.push(e);
            }
        }

        for route in &snapshot.reverse_proxies {
            let context = format!("reverse_proxies '{}'", route.name);
            if route.matcher.path.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{context} matcher.path"),
                });
            }
            if let Err(e) = RouteMatcher::new(&route.matcher.method, &route.matcher.path) {
                errors.push(ValidationError::InvalidField {
                    field: format!("{context} matcher.method"),
                    message: e.to_string(),
                });
            }
            if let Err(e) = route.directives.compile() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{context} directives"),
                    message: e.to_string(),
                });
            }
            if let Err(e) = Self::validate_endpoint(&route.upstream, &format!("{context} upstream")) {
                errors.push(e);
            }
        }

        for route in &snapshot.js_bundles {
            errors.extend(Self::validate_js_bundle(route));
        }

        for cluster in &snapshot.clusters {
            let connection = &cluster.connection;
            for (field, value) in [
                ("kubernetes_api_endpoint", &connection.kubernetes_api_endpoint),
                ("gateway_endpoint", &connection.gateway_endpoint),
            ] {
                if let Some(url) = value {
                    if let Err(e) =
                        Self::validate_url(url, &format!("clusters '{}' {field}", cluster.name))
                    {
                        errors.push(e);
                    }
                }
            }
        }

        errors
    }

    fn validate_js_bundle(route: &JsBundleRoute) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let context = format!("js_bundles '{}'", route.name);
        if !route.link.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("{context} link"),
                message: "Links must start with '/'".to_string(),
            });
        }
        if route.source.populated_count() == 0 {
            errors.push(ValidationError::MissingField {
                field: format!("{context} source"),
            });
        }
        if let Some(remote) = &route.source.remote {
            if let Err(e) = Self::validate_endpoint(remote, &format!("{context} source.remote")) {
                errors.push(e);
            }
        }
        errors
    }

    fn validate_endpoint(endpoint: &Endpoint, context: &str) -> ValidationResult<()> {
        match endpoint.raw_url() {
            Some(url) => Self::validate_url(&url, context),
            None => Err(ValidationError::MissingField {
                field: format!("{context} (url or service)"),
            }),
        }
    }

    fn check_duplicate_names<'a>(
        kind: &str,
        names: impl Iterator<Item = &'a str>,
    ) -> Vec<ValidationError> {
        let mut seen = HashSet::new();
        let mut errors = Vec::new();
        for name in names {
            if name.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{kind} name"),
                });
            } else if !seen.insert(name) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("{kind} '{name}' is defined more than once"),
                });
            }
        }
        errors
    }

    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
