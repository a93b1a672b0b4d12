//! Audit event model, level gating and batch encoding.
use std::net::IpAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer, ser::Error as _};
use uuid::Uuid;

use crate::core::{context::UserInfo, request_info::RequestInfo};

/// How much of a request/response pair is recorded. Ordered from least to most.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AuditLevel {
    None,
    #[default]
    Metadata,
    Request,
    RequestResponse,
}

impl AuditLevel {
    pub fn records_request_body(self) -> bool {
        self >= AuditLevel::Request
    }

    pub fn records_response_body(self) -> bool {
        self >= AuditLevel::RequestResponse
    }
}

impl std::fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditLevel::None => "None",
            AuditLevel::Metadata => "Metadata",
            AuditLevel::Request => "Request",
            AuditLevel::RequestResponse => "RequestResponse",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    ResponseStarted,
    ResponseComplete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditUser {
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

impl From<&UserInfo> for AuditUser {
    fn from(user: &UserInfo) -> Self {
        Self {
            username: user.username.clone(),
            uid: user.uid.clone(),
            groups: user.groups.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub resource: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "apiGroup", skip_serializing_if = "String::is_empty")]
    pub api_group: String,
    #[serde(rename = "apiVersion", skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subresource: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResponseStatus {
    pub code: u16,
}

/// Identity of the gateway instance that observed the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostIdentity {
    pub host_name: String,
    pub host_ip: String,
}

impl HostIdentity {
    /// Reads `HOSTNAME` and `POD_IP`, letting explicit values win.
    pub fn resolve(host_name: Option<&str>, host_ip: Option<&str>) -> Self {
        let pick = |explicit: Option<&str>, var: &str| {
            explicit
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .or_else(|| std::env::var(var).ok())
                .unwrap_or_default()
        };
        Self {
            host_name: pick(host_name, "HOSTNAME"),
            host_ip: pick(host_ip, "POD_IP"),
        }
    }
}

/// One request/response record. Mutated only until the response completes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    #[serde(rename = "auditID")]
    pub audit_id: Uuid,
    pub level: AuditLevel,
    pub stage: Stage,
    #[serde(rename = "requestURI")]
    pub request_uri: String,
    pub verb: String,
    pub user: AuditUser,
    #[serde(rename = "sourceIPs")]
    pub source_ips: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<ObjectReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<ResponseStatus>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_raw_json"
    )]
    pub request_object: Option<Bytes>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_raw_json"
    )]
    pub response_object: Option<Bytes>,
    pub request_received_timestamp: DateTime<Utc>,
    pub stage_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub workspace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host_name: String,
    #[serde(rename = "hostIP", skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
}

/// Captured bodies are embedded as JSON, not as strings; bytes that are not valid JSON
/// fail serialization of the whole event.
fn serialize_raw_json<S: Serializer>(bytes: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_slice(raw).map_err(S::Error::custom)?;
            value.serialize(serializer)
        }
        None => serializer.serialize_none(),
    }
}

/// Inputs for a new event taken from the inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta<'a> {
    pub request_uri: &'a str,
    pub user_agent: &'a str,
    pub forwarded_for: Option<&'a str>,
    pub client_ip: Option<IpAddr>,
    pub received_at: Option<DateTime<Utc>>,
}

impl AuditEvent {
    pub fn begin(
        level: AuditLevel,
        info: &RequestInfo,
        user: Option<&UserInfo>,
        meta: RequestMeta<'_>,
        host: &HostIdentity,
    ) -> Self {
        let now = Utc::now();
        let object_ref = info.is_resource_request.then(|| ObjectReference {
            resource: info.resource.clone(),
            namespace: info.namespace.clone(),
            name: info.name.clone(),
            api_group: info.api_group.clone(),
            api_version: info.api_version.clone(),
            subresource: info.subresource.clone(),
        });
        Self {
            audit_id: Uuid::new_v4(),
            level,
            stage: Stage::ResponseComplete,
            request_uri: meta.request_uri.to_string(),
            verb: info.verb.clone(),
            user: user.map(AuditUser::from).unwrap_or_default(),
            source_ips: source_ips(meta.forwarded_for, meta.client_ip),
            user_agent: meta.user_agent.to_string(),
            object_ref,
            response_status: None,
            request_object: None,
            response_object: None,
            request_received_timestamp: meta.received_at.unwrap_or(now),
            stage_timestamp: now,
            workspace: info.workspace.clone(),
            cluster: info.cluster.clone(),
            host_name: host.host_name.clone(),
            host_ip: host.host_ip.clone(),
        }
    }

    /// Uses the request body to sharpen the record: a `create` learns the new object's
    /// name, and a `users` update that flips `status.state` becomes `enable`/`disable`.
    pub fn enrich_from_request_body(&mut self, body: &[u8]) {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
            return;
        };
        if self.verb == "create" {
            if let (Some(object_ref), Some(name)) = (
                self.object_ref.as_mut(),
                value.pointer("/metadata/name").and_then(|n| n.as_str()),
            ) {
                if object_ref.name.is_empty() {
                    object_ref.name = name.to_string();
                }
            }
        }
        if self.verb == "update" && self.resource() == Some("users") {
            match value.pointer("/status/state").and_then(|s| s.as_str()) {
                Some("Active") => self.verb = "enable".to_string(),
                Some("Disabled") => self.verb = "disable".to_string(),
                _ => {}
            }
        }
    }

    pub fn complete(&mut self, status: u16, stage: Stage) {
        self.response_status = Some(ResponseStatus { code: status });
        self.stage = stage;
        self.stage_timestamp = Utc::now();
    }

    fn resource(&self) -> Option<&str> {
        self.object_ref.as_ref().map(|r| r.resource.as_str())
    }
}

/// Whether the request body must be read for this event, whatever the level.
pub fn needs_request_body(level: AuditLevel, info: &RequestInfo) -> bool {
    level.records_request_body()
        || info.verb == "create"
        || (info.verb == "update" && info.resource == "users")
}

fn source_ips(forwarded_for: Option<&str>, client_ip: Option<IpAddr>) -> Vec<String> {
    let mut ips: Vec<String> = forwarded_for
        .map(|header| {
            header
                .split(',')
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if let Some(ip) = client_ip.map(|ip| ip.to_string()) {
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    ips
}

/// A batch after per-event serialization. Events that could not be encoded are gone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    events: Vec<String>,
}

impl EncodedBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    /// Body for the webhook backend.
    pub fn to_json_array(&self) -> String {
        let mut out = String::with_capacity(self.events.iter().map(|e| e.len() + 1).sum::<usize>() + 2);
        out.push('[');
        out.push_str(&self.events.join(","));
        out.push(']');
        out
    }

    /// Lines for the log backend, each terminated by `\n`.
    pub fn to_ndjson(&self) -> String {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(event);
            out.push('\n');
        }
        out
    }
}

/// Serializes each event on its own. A failing event is retried once without its
/// response body, then dropped.
pub fn encode_batch(events: &[AuditEvent]) -> EncodedBatch {
    let events = events.iter().filter_map(encode_event).collect();
    EncodedBatch { events }
}

fn encode_event(event: &AuditEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(encoded) => Some(encoded),
        Err(err) => {
            tracing::warn!(
                audit_id = %event.audit_id,
                error = %err,
                "Audit event failed to serialize, retrying without response body"
            );
            let mut stripped = event.clone();
            stripped.response_object = None;
            match serde_json::to_string(&stripped) {
                Ok(encoded) => Some(encoded),
                Err(err) => {
                    tracing::error!(
                        audit_id = %event.audit_id,
                        error = %err,
                        "Dropping audit event that cannot be serialized"
                    );
                    crate::metrics::increment_audit_events_dropped("serialization");
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request_info::RequestInfoResolver;

    fn info(method: http::Method, uri: &str) -> RequestInfo {
        RequestInfoResolver::default()
            .resolve(&method, &uri.parse().unwrap())
            .unwrap()
    }

    fn event(level: AuditLevel, method: http::Method, uri: &str) -> AuditEvent {
        AuditEvent::begin(
            level,
            &info(method, uri),
            Some(&UserInfo::named("admin")),
            RequestMeta {
                request_uri: uri,
                user_agent: "kubectl/v1.30",
                forwarded_for: Some("10.0.0.1, 10.0.0.2"),
                client_ip: Some("10.0.0.2".parse().unwrap()),
                received_at: None,
            },
            &HostIdentity {
                host_name: "junction-0".into(),
                host_ip: "10.1.1.1".into(),
            },
        )
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(AuditLevel::None < AuditLevel::Metadata);
        assert!(AuditLevel::Metadata < AuditLevel::Request);
        assert!(AuditLevel::Request < AuditLevel::RequestResponse);
        assert!(!AuditLevel::Metadata.records_request_body());
        assert!(AuditLevel::Request.records_request_body());
        assert!(!AuditLevel::Request.records_response_body());
    }

    #[test]
    fn test_event_json_shape() {
        let mut e = event(AuditLevel::Metadata, http::Method::GET, "/api/v1/namespaces/ns/pods/web");
        e.complete(200, Stage::ResponseComplete);
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&e).unwrap()).unwrap();
        assert_eq!(json["level"], "Metadata");
        assert_eq!(json["stage"], "ResponseComplete");
        assert_eq!(json["verb"], "get");
        assert_eq!(json["user"]["username"], "admin");
        assert_eq!(json["sourceIPs"], serde_json::json!(["10.0.0.1", "10.0.0.2"]));
        assert_eq!(json["objectRef"]["resource"], "pods");
        assert_eq!(json["objectRef"]["namespace"], "ns");
        assert_eq!(json["responseStatus"]["code"], 200);
        assert_eq!(json["hostName"], "junction-0");
        assert_eq!(json["hostIP"], "10.1.1.1");
        assert!(json.get("auditID").is_some());
        assert!(json.get("requestObject").is_none());
    }

    #[test]
    fn test_create_recovers_name() {
        let mut e = event(AuditLevel::Metadata, http::Method::POST, "/api/v1/namespaces/ns/configmaps");
        e.enrich_from_request_body(br#"{"metadata":{"name":"settings"}}"#);
        assert_eq!(e.object_ref.unwrap().name, "settings");
    }

    #[test]
    fn test_user_state_change_verbs() {
        let mut e = event(AuditLevel::Metadata, http::Method::PUT, "/kapis/iam.kubesphere.io/v1beta1/users/alice");
        e.enrich_from_request_body(br#"{"status":{"state":"Disabled"}}"#);
        assert_eq!(e.verb, "disable");

        let mut e = event(AuditLevel::Metadata, http::Method::PUT, "/kapis/iam.kubesphere.io/v1beta1/users/alice");
        e.enrich_from_request_body(br#"{"status":{"state":"Active"}}"#);
        assert_eq!(e.verb, "enable");
    }

    #[test]
    fn test_needs_request_body() {
        let list = info(http::Method::GET, "/api/v1/pods");
        assert!(!needs_request_body(AuditLevel::Metadata, &list));
        assert!(needs_request_body(AuditLevel::Request, &list));
        let create = info(http::Method::POST, "/api/v1/namespaces/ns/pods");
        assert!(needs_request_body(AuditLevel::Metadata, &create));
        let user_update = info(http::Method::PUT, "/kapis/iam.kubesphere.io/v1beta1/users/alice");
        assert!(needs_request_body(AuditLevel::Metadata, &user_update));
    }

    #[test]
    fn test_encode_batch_falls_back_without_response_body() {
        let mut good = event(AuditLevel::RequestResponse, http::Method::GET, "/api/v1/pods");
        good.response_object = Some(Bytes::from_static(br#"{"kind":"PodList"}"#));
        let mut bad_response = good.clone();
        bad_response.response_object = Some(Bytes::from_static(b"not json"));
        let mut bad_request = good.clone();
        bad_request.request_object = Some(Bytes::from_static(b"\xff\xfe"));

        let batch = encode_batch(&[good, bad_response, bad_request]);
        assert_eq!(batch.len(), 2);

        let first: serde_json::Value = serde_json::from_str(&batch.events()[0]).unwrap();
        assert_eq!(first["responseObject"]["kind"], "PodList");
        let second: serde_json::Value = serde_json::from_str(&batch.events()[1]).unwrap();
        assert!(second.get("responseObject").is_none());
        assert_eq!(second["verb"], "list");
    }

    #[test]
    fn test_batch_renderings() {
        let batch = EncodedBatch {
            events: vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()],
        };
        assert_eq!(batch.to_json_array(), r#"[{"a":1},{"b":2}]"#);
        assert_eq!(batch.to_ndjson(), "{\"a\":1}\n{\"b\":2}\n");
    }
}
