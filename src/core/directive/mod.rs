//! Match, rewrite and header rules attached to reverse-proxy routes.
pub mod header;
pub mod matcher;
pub mod path;
pub mod replacer;
pub mod rewrite;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use header::{HeaderOp, HeaderOps};
pub use matcher::{PathMatcher, RouteMatcher};
pub use replacer::{ReplaceError, Replacer};
pub use rewrite::{RegexReplace, Rewrite, RewriteTarget, SubstringReplace};

#[derive(Debug, Error)]
pub enum DirectiveError {
    #[error("invalid path_regexp {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid header directive {0:?}")]
    InvalidHeaderLine(String),
    #[error("invalid method {0:?}")]
    InvalidMethod(String),
    #[error(transparent)]
    Placeholder(#[from] ReplaceError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstringDirective {
    pub find: String,
    #[serde(default)]
    pub replace: String,
    /// Zero replaces every occurrence.
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexDirective {
    pub find: String,
    #[serde(default)]
    pub replace: String,
}

/// Declarative per-route rules, as stored on the routing object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Directives {
    pub method: Option<String>,
    pub uri: Option<String>,
    pub strip_path_prefix: Option<String>,
    pub strip_path_suffix: Option<String>,
    pub replace: Vec<SubstringDirective>,
    pub path_regexp: Vec<RegexDirective>,
    pub header_up: Vec<String>,
    pub header_down: Vec<String>,
    /// Assert the caller's identity to the upstream with `X-Remote-*` headers.
    pub auth_proxy: bool,
    /// Fail the request instead of substituting `""` for unknown placeholders.
    pub strict_placeholders: bool,
}

/// [`Directives`] with regexes and header lines parsed, ready to run against a request.
#[derive(Debug, Clone, Default)]
pub struct CompiledDirectives {
    pub rewrite: Rewrite,
    pub header_up: HeaderOps,
    pub header_down: HeaderOps,
    pub auth_proxy: bool,
    pub strict_placeholders: bool,
}

impl Directives {
    pub fn compile(&self) -> Result<CompiledDirectives, DirectiveError> {
        let regexes = self
            .path_regexp
            .iter()
            .map(|rule| {
                Regex::new(&rule.find)
                    .map(|find| RegexReplace {
                        find,
                        replace: rule.replace.clone(),
                    })
                    .map_err(|source| DirectiveError::InvalidRegex {
                        pattern: rule.find.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledDirectives {
            rewrite: Rewrite {
                method: self.method.clone(),
                uri: self.uri.clone(),
                strip_path_prefix: self.strip_path_prefix.clone(),
                strip_path_suffix: self.strip_path_suffix.clone(),
                substrings: self
                    .replace
                    .iter()
                    .map(|rule| SubstringReplace {
                        find: rule.find.clone(),
                        replace: rule.replace.clone(),
                        limit: rule.limit,
                    })
                    .collect(),
                regexes,
            },
            header_up: HeaderOps::parse(&self.header_up)?,
            header_down: HeaderOps::parse(&self.header_down)?,
            auth_proxy: self.auth_proxy,
            strict_placeholders: self.strict_placeholders,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_rejects_bad_regex() {
        let directives = Directives {
            path_regexp: vec![RegexDirective {
                find: "(unclosed".to_string(),
                replace: String::new(),
            }],
            ..Directives::default()
        };
        let err = directives.compile().unwrap_err();
        assert!(matches!(err, DirectiveError::InvalidRegex { .. }));
        assert!(err.to_string().contains("(unclosed"));
    }

    #[test]
    fn test_compile_rejects_bad_header_line() {
        let directives = Directives {
            header_down: vec!["NoValue".to_string()],
            ..Directives::default()
        };
        assert!(matches!(
            directives.compile(),
            Err(DirectiveError::InvalidHeaderLine(_))
        ));
    }

    #[test]
    fn test_directives_deserialize_from_yaml_like_json() {
        let directives: Directives = serde_json::from_value(serde_json::json!({
            "strip_path_prefix": "/api",
            "header_up": ["+X-Via junction"],
            "replace": [{ "find": "a", "replace": "b" }],
            "auth_proxy": true
        }))
        .unwrap();
        let compiled = directives.compile().unwrap();
        assert_eq!(compiled.rewrite.strip_path_prefix.as_deref(), Some("/api"));
        assert_eq!(compiled.rewrite.substrings[0].limit, 0);
        assert!(!compiled.header_up.is_empty());
        assert!(compiled.auth_proxy);
    }
}
