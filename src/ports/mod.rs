pub mod audit_backend;
pub mod auth;
pub mod config_provider;
pub mod dispatcher;
pub mod http_client;
pub mod route_store;
