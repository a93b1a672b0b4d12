//! `{placeholder}` substitution for rewrite templates and header values.
use std::collections::HashMap;

use http::{HeaderMap, Method, Uri, header};
use thiserror::Error;

/// Upper bound on placeholders in one template; guards against pathological input.
pub const MAX_PLACEHOLDERS: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplaceError {
    #[error("unresolved placeholder {{{0}}}")]
    Unresolved(String),
    #[error("template has more than 64 placeholders")]
    TooManyPlaceholders,
}

/// Request fields visible to templates. Captured once, before any rewrite runs.
#[derive(Debug, Clone, Default)]
struct RequestFields {
    method: String,
    host: String,
    path: String,
    query: String,
    headers: HeaderMap,
}

#[derive(Debug, Clone, Default)]
pub struct Replacer {
    bindings: HashMap<String, String>,
    request: Option<RequestFields>,
    strict: bool,
}

impl Replacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_request(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let host = match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
            _ => host,
        };
        Self {
            request: Some(RequestFields {
                method: method.as_str().to_string(),
                host,
                path: uri.path().to_string(),
                query: uri.query().unwrap_or("").to_string(),
                headers: headers.clone(),
            }),
            ..Self::default()
        }
    }

    /// Adds a caller binding; bindings shadow every built-in placeholder.
    pub fn bind(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.bindings.insert(key.into(), value.into());
        self
    }

    /// In strict mode an unresolved placeholder is an error instead of `""`.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn replace_all(&self, template: &str) -> Result<String, ReplaceError> {
        self.replace_with(template, |_, value| value)
    }

    /// Like [`Replacer::replace_all`], but passes every resolved value through `transform`
    /// (called with the placeholder name) before it is written.
    pub fn replace_with<F>(&self, template: &str, transform: F) -> Result<String, ReplaceError>
    where
        F: Fn(&str, String) -> String,
    {
        let mut out = String::with_capacity(template.len());
        let mut placeholders = 0usize;
        let mut rest = template;

        while let Some(at) = rest.find(['{', '}', '\\']) {
            out.push_str(&rest[..at]);
            let tail = &rest[at..];
            if let Some(escaped) = tail.strip_prefix('\\') {
                match escaped.chars().next() {
                    Some(brace @ ('{' | '}')) => {
                        out.push(brace);
                        rest = &escaped[1..];
                    }
                    _ => {
                        out.push('\\');
                        rest = escaped;
                    }
                }
                continue;
            }
            if tail.starts_with('}') {
                out.push('}');
                rest = &tail[1..];
                continue;
            }

            // tail starts with '{'
            let Some(close) = tail.find('}') else {
                out.push_str(tail);
                rest = "";
                break;
            };
            let key = &tail[1..close];
            if key.is_empty() || key.contains('{') {
                out.push('{');
                rest = &tail[1..];
                continue;
            }

            placeholders += 1;
            if placeholders > MAX_PLACEHOLDERS {
                return Err(ReplaceError::TooManyPlaceholders);
            }
            match self.lookup(key) {
                Some(value) => out.push_str(&transform(key, value)),
                None if self.strict => return Err(ReplaceError::Unresolved(key.to_string())),
                None => {}
            }
            rest = &tail[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn lookup(&self, key: &str) -> Option<String> {
        if let Some(bound) = self.bindings.get(key) {
            return Some(bound.clone());
        }
        if let Some(name) = key.strip_prefix("env.") {
            return std::env::var(name).ok();
        }
        let request = self.request.as_ref()?;
        match key {
            "http.request.method" => Some(request.method.clone()),
            "http.request.host" => Some(request.host.clone()),
            "http.request.uri" => Some(if request.query.is_empty() {
                request.path.clone()
            } else {
                format!("{}?{}", request.path, request.query)
            }),
            "http.request.uri.path" => Some(request.path.clone()),
            "http.request.uri.query" => Some(request.query.clone()),
            _ => {
                if let Some(index) = key.strip_prefix("http.request.uri.path.") {
                    let index: usize = index.parse().ok()?;
                    return request
                        .path
                        .trim_start_matches('/')
                        .split('/')
                        .nth(index)
                        .map(str::to_string);
                }
                if let Some(param) = key.strip_prefix("http.request.uri.query.") {
                    return url::form_urlencoded::parse(request.query.as_bytes())
                        .find(|(k, _)| k == param)
                        .map(|(_, v)| v.into_owned());
                }
                if let Some(name) = key.strip_prefix("http.request.header.") {
                    let values: Vec<&str> = request
                        .headers
                        .get_all(name)
                        .iter()
                        .filter_map(|v| v.to_str().ok())
                        .collect();
                    return (!values.is_empty()).then(|| values.join(","));
                }
                None
            }
        }
    }
}
