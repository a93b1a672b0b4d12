//! Junction - the API gateway in front of a Kubernetes-based multi-tenant control plane.
//!
//! Every inbound request is classified once ([`core::RequestInfoResolver`]) and then runs a
//! fixed filter chain: logging and metrics, authentication, authorization and auditing. A
//! fixed dispatcher chain follows, which forwards the request to one of:
//!
//! - the local Kubernetes API server,
//! - an extension API service matched by `(group, version)`,
//! - an extension reverse proxy matched by `(method, path pattern)`, with rewrite and header
//!   directives,
//! - a static JS bundle served from inline bytes, config, secret or a remote URL,
//! - a member cluster addressed as `/clusters/{name}/...`,
//! - a fixed fallback upstream.
//!
//! Audit events are queued without blocking the request path, batched by size and time,
//! and fanned out to a webhook and a rotating log file.
//!
//! # Architecture
//! Traits live in `ports`, implementations in `adapters` and the request model, directive
//! engine and audit model in `core`. The routing objects are an immutable
//! [`ports::route_store::RoutingSnapshot`] swapped atomically when the config file changes.
//!
//! # Error Handling
//! Module boundaries use `thiserror` enums; [`core::GatewayError`] renders Kubernetes-style
//! `Status` bodies. Startup and config plumbing use `eyre::Result` with `WrapErr` context.
//!
//! # Concurrency & Data Structures
//! Per-upstream HTTP clients are cached in an `scc::HashMap`; the routing snapshot sits in
//! an `arc_swap::ArcSwapOption`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{FilterChain, HttpClientAdapter, HttpHandler, SnapshotStore, TransportCache},
    config::models::GatewayConfig,
    core::{GatewayError, RequestInfo, RequestInfoResolver},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
