use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::request_info::RequestInfo;

/// Identity established by the authentication hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl UserInfo {
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }
}

/// Request-scoped values threaded through every filter and dispatcher.
///
/// Set once by the stage that owns each value and read downstream.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub info: Arc<RequestInfo>,
    pub user: Option<Arc<UserInfo>>,
    pub client_addr: Option<SocketAddr>,
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(info: RequestInfo, client_addr: Option<SocketAddr>) -> Self {
        Self {
            info: Arc::new(info),
            user: None,
            client_addr,
            received_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(Arc::new(user));
        self
    }

    /// Replaces the routing coordinates after a reroute, keeping identity and timing.
    pub fn rerouted(&self, info: Arc<RequestInfo>) -> Self {
        Self {
            info,
            ..self.clone()
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.user.as_deref().map(|u| u.username.as_str())
    }
}
