//! Derives routing coordinates (cluster, API group, resource, verb) from a raw request path.
//!
//! Path shapes understood by the resolver:
//!
//! ```text
//! /{prefix}[/clusters/{cluster}]/{group}/{version}[/watch|/proxy]
//!     [/workspaces/{workspace}][/namespaces/{namespace}]/{resource}[/{name}[/{subresource}]]
//! ```
//!
//! Groupless prefixes (`api`, `kapi`) skip the `{group}` segment. Anything that does not start
//! with a configured API prefix is a non-resource request whose verb is the lower-cased method.
use std::collections::HashSet;

use http::{Method, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label used by list/watch selectors to scope a request to a workspace.
pub const WORKSPACE_LABEL: &str = "kubesphere.io/workspace";

const SPECIAL_VERBS: [&str; 2] = ["proxy", "watch"];
const NAMESPACE_SUBRESOURCES: [&str; 2] = ["status", "finalize"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestInfoError {
    #[error("unable to determine kind and namespace from url {0}")]
    MissingSegment(String),
}

/// Where a resource request lives in the tenancy hierarchy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceScope {
    #[default]
    Cluster,
    Workspace,
    Namespace,
}

impl std::fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceScope::Cluster => write!(f, "cluster"),
            ResourceScope::Workspace => write!(f, "workspace"),
            ResourceScope::Namespace => write!(f, "namespace"),
        }
    }
}

/// Routing coordinates for one request. Computed once and shared read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestInfo {
    pub is_resource_request: bool,
    pub is_kubernetes_request: bool,
    pub path: String,
    pub verb: String,
    pub api_prefix: String,
    pub api_group: String,
    pub api_version: String,
    pub workspace: String,
    pub namespace: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
    /// Empty means the local cluster.
    pub cluster: String,
    pub parts: Vec<String>,
    pub resource_scope: ResourceScope,
}

impl RequestInfo {
    pub fn is_local(&self) -> bool {
        self.cluster.is_empty()
    }
}

/// Prefix sets driving classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestInfoOptions {
    pub api_prefixes: Vec<String>,
    pub groupless_api_prefixes: Vec<String>,
    pub kubernetes_api_prefixes: Vec<String>,
}

impl Default for RequestInfoOptions {
    fn default() -> Self {
        Self {
            api_prefixes: vec![
                "api".to_string(),
                "apis".to_string(),
                "kapis".to_string(),
                "kapi".to_string(),
            ],
            groupless_api_prefixes: vec!["api".to_string(), "kapi".to_string()],
            kubernetes_api_prefixes: vec!["api".to_string(), "apis".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestInfoResolver {
    api_prefixes: HashSet<String>,
    groupless_api_prefixes: HashSet<String>,
    kubernetes_api_prefixes: HashSet<String>,
}

impl Default for RequestInfoResolver {
    fn default() -> Self {
        Self::new(&RequestInfoOptions::default())
    }
}

impl RequestInfoResolver {
    pub fn new(options: &RequestInfoOptions) -> Self {
        let normalize = |prefixes: &[String]| {
            prefixes
                .iter()
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .collect::<HashSet<_>>()
        };
        Self {
            api_prefixes: normalize(&options.api_prefixes),
            groupless_api_prefixes: normalize(&options.groupless_api_prefixes),
            kubernetes_api_prefixes: normalize(&options.kubernetes_api_prefixes),
        }
    }

    pub fn resolve(&self, method: &Method, uri: &Uri) -> Result<RequestInfo, RequestInfoError> {
        let path = uri.path();
        let query = uri.query().unwrap_or("");

        let mut info = RequestInfo {
            path: path.to_string(),
            verb: method.as_str().to_ascii_lowercase(),
            ..RequestInfo::default()
        };

        let segments = split_path(path);
        // Discovery paths such as `/api` or `/apis/apps` are still native requests.
        if let Some(first) = segments.first() {
            info.is_kubernetes_request = self.kubernetes_api_prefixes.contains(*first);
        }

        if segments.len() < 3 {
            return Ok(info);
        }
        let Some(prefix) = segments.first().copied() else {
            return Ok(info);
        };
        if !self.api_prefixes.contains(prefix) {
            return Ok(info);
        }
        info.api_prefix = prefix.to_string();
        let mut current = &segments[1..];

        if current.first() == Some(&"clusters") {
            if let Some(cluster) = current.get(1) {
                info.cluster = (*cluster).to_string();
            }
            current = current.get(2..).unwrap_or(&[]);
        }

        if !self.groupless_api_prefixes.contains(prefix) {
            // one part each for group, version and resource
            if current.len() < 3 {
                return Ok(info);
            }
            info.api_group = current[0].to_string();
            current = &current[1..];
        }

        let Some(version) = current.first() else {
            return Ok(info);
        };
        info.is_resource_request = true;
        info.api_version = (*version).to_string();
        current = &current[1..];

        match current.first() {
            Some(segment) if SPECIAL_VERBS.contains(segment) => {
                if current.len() < 2 {
                    return Err(RequestInfoError::MissingSegment(path.to_string()));
                }
                info.verb = (*segment).to_string();
                current = &current[1..];
            }
            _ => info.verb = crud_verb(method).to_string(),
        }

        if current.first() == Some(&"workspaces") {
            if let Some(workspace) = current.get(1) {
                info.workspace = (*workspace).to_string();
                // `/workspaces/{w}` alone addresses the workspace object itself
                if current.len() > 2 {
                    current = &current[2..];
                }
            }
        }

        if current.first() == Some(&"namespaces") {
            if let Some(namespace) = current.get(1) {
                info.namespace = (*namespace).to_string();
                // `/namespaces/{ns}/status` is a subresource of the namespace object
                let namespace_subresource = current
                    .get(2)
                    .is_some_and(|next| NAMESPACE_SUBRESOURCES.contains(next));
                if current.len() > 2 && !namespace_subresource {
                    current = &current[2..];
                }
            }
        }

        info.parts = current.iter().map(|s| (*s).to_string()).collect();
        // parts look like resource/resourceName/subresource/other/stuff/we/don't/interpret
        if let Some(resource) = current.first() {
            info.resource = (*resource).to_string();
        }
        if let Some(name) = current.get(1) {
            info.name = (*name).to_string();
        }
        if current.len() >= 3 && info.verb != "proxy" {
            info.subresource = current[2].to_string();
        }

        let params = QueryParams::parse(query);

        if info.name.is_empty() && info.verb == "get" {
            info.verb = if params.is_watch() { "watch" } else { "list" }.to_string();
            if let Some(name) = params
                .get("fieldSelector")
                .and_then(|selector| field_selector_name(&selector))
            {
                info.name = name;
            }
        }
        if info.name.is_empty() && info.verb == "delete" {
            info.verb = "deletecollection".to_string();
        }
        if info.verb == "watch" {
            if let Some(workspace) = params
                .get("labelSelector")
                .and_then(|selector| label_selector_value(&selector, WORKSPACE_LABEL))
            {
                info.workspace = workspace;
            }
        }

        info.is_kubernetes_request = self.kubernetes_api_prefixes.contains(prefix);
        info.resource_scope = if !info.namespace.is_empty() {
            ResourceScope::Namespace
        } else if !info.workspace.is_empty() {
            ResourceScope::Workspace
        } else {
            ResourceScope::Cluster
        };

        Ok(info)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn crud_verb(method: &Method) -> &'static str {
    match *method {
        Method::POST => "create",
        Method::GET | Method::HEAD => "get",
        Method::PUT => "update",
        Method::PATCH => "patch",
        Method::DELETE => "delete",
        _ => "",
    }
}

struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    fn parse(query: &str) -> Self {
        let pairs = url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self(pairs)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn is_watch(&self) -> bool {
        matches!(
            self.get("watch").map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("true") | Some("1")
        )
    }
}

/// Extracts `x` from a field selector of the form `metadata.name=x`.
fn field_selector_name(selector: &str) -> Option<String> {
    selector.split(',').find_map(|term| {
        let (field, value) = term.split_once("==").or_else(|| term.split_once('='))?;
        (field.trim() == "metadata.name" && !value.trim().is_empty())
            .then(|| value.trim().to_string())
    })
}

fn label_selector_value(selector: &str, label: &str) -> Option<String> {
    selector.split(',').find_map(|term| {
        let (key, value) = term.split_once("==").or_else(|| term.split_once('='))?;
        (key.trim() == label && !value.trim().is_empty()).then(|| value.trim().to_string())
    })
}
