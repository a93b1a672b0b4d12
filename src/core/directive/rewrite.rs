//! Ordered request rewriting: method, URI, prefix/suffix strip, substring and regex replacement.
use http::{Method, Uri};
use regex::Regex;

use super::{
    DirectiveError,
    path::{clean_path, trim_path_prefix, trim_path_suffix},
    replacer::Replacer,
};

/// The mutable view of a request a rewrite operates on. `path` is kept in escaped form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteTarget {
    pub method: Method,
    pub path: String,
    pub query: String,
    /// Never sent upstream, but templates may still set it.
    pub fragment: String,
}

impl RewriteTarget {
    pub fn new(method: Method, uri: &Uri) -> Self {
        Self {
            method,
            path: uri.path().to_string(),
            query: uri.query().unwrap_or("").to_string(),
            fragment: String::new(),
        }
    }

    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubstringReplace {
    pub find: String,
    pub replace: String,
    /// Zero replaces every occurrence.
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct RegexReplace {
    pub find: Regex,
    pub replace: String,
}

#[derive(Debug, Clone, Default)]
pub struct Rewrite {
    pub method: Option<String>,
    pub uri: Option<String>,
    pub strip_path_prefix: Option<String>,
    pub strip_path_suffix: Option<String>,
    pub substrings: Vec<SubstringReplace>,
    pub regexes: Vec<RegexReplace>,
}

impl Rewrite {
    /// Applies every configured step in order. Returns whether the method or URI changed.
    pub fn apply(&self, target: &mut RewriteTarget, repl: &Replacer) -> Result<bool, DirectiveError> {
        let before = target.clone();

        if let Some(method) = self.method.as_deref().filter(|m| !m.is_empty()) {
            let method = repl.replace_all(method)?.to_ascii_uppercase();
            if !method.is_empty() {
                target.method = Method::from_bytes(method.as_bytes())
                    .map_err(|_| DirectiveError::InvalidMethod(method.clone()))?;
            }
        }

        if let Some(uri) = self.uri.as_deref().filter(|u| !u.is_empty()) {
            rewrite_uri(uri, target, repl)?;
        }

        if let Some(prefix) = self.strip_path_prefix.as_deref().filter(|p| !p.is_empty()) {
            let mut prefix = repl.replace_all(prefix)?;
            if !prefix.starts_with('/') {
                prefix.insert(0, '/');
            }
            let cleaned = clean_path(&target.path, !prefix.contains("//"));
            target.path = with_leading_slash(trim_path_prefix(&cleaned, &prefix));
        }

        if let Some(suffix) = self.strip_path_suffix.as_deref().filter(|s| !s.is_empty()) {
            let suffix = repl.replace_all(suffix)?;
            let cleaned = clean_path(&target.path, !suffix.contains("//"));
            target.path = with_leading_slash(trim_path_suffix(&cleaned, &suffix));
        }

        for rule in &self.substrings {
            if rule.find.is_empty() {
                continue;
            }
            let find = repl.replace_all(&rule.find)?;
            let replace = repl.replace_all(&rule.replace)?;
            let cleaned = clean_path(&target.path, !rule.find.contains("//"));
            target.path = replace_limited(&cleaned, &find, &replace, rule.limit);
            target.query = replace_limited(&target.query, &find, &replace, rule.limit);
        }

        for rule in &self.regexes {
            let replace = repl.replace_all(&rule.replace)?;
            target.path = rule
                .find
                .replace_all(&target.path, replace.as_str())
                .into_owned();
        }

        Ok(*target != before)
    }
}

fn with_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn replace_limited(haystack: &str, find: &str, replace: &str, limit: usize) -> String {
    if find.is_empty() {
        return haystack.to_string();
    }
    if limit == 0 {
        haystack.replace(find, replace)
    } else {
        haystack.replacen(find, replace, limit)
    }
}

/// Splits the template into path, query and fragment; each component present in the
/// template replaces the matching component of the target, the others are kept.
fn rewrite_uri(template: &str, target: &mut RewriteTarget, repl: &Replacer) -> Result<(), DirectiveError> {
    let (before_fragment, fragment) = match template.split_once('#') {
        Some((head, frag)) => (head, Some(frag)),
        None => (template, None),
    };
    let (path, query) = match before_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (before_fragment, None),
    };

    let mut new_path = None;
    let mut query = query.map(str::to_string);
    if !path.is_empty() {
        let path = path.replace("{http.request.uri.path}", &target.path);
        let rendered = repl.replace_all(&path)?;
        // a placeholder may have smuggled a query string into the path
        let rendered = match rendered.split_once('?') {
            Some((path, injected)) => {
                if query.as_deref().is_none_or(str::is_empty) {
                    query = Some(injected.to_string());
                }
                path.to_string()
            }
            None => rendered,
        };
        new_path = Some(with_leading_slash(&rendered));
    }

    let new_query = match query.as_deref() {
        Some(q) if !q.is_empty() => Some(build_query(q, repl)?),
        Some(_) => Some(String::new()),
        None => None,
    };
    let new_fragment = match fragment {
        Some(f) if !f.is_empty() => Some(repl.replace_all(f)?),
        Some(_) => Some(String::new()),
        None => None,
    };

    if let Some(path) = new_path {
        target.path = path;
    }
    if let Some(query) = new_query {
        target.query = query;
    }
    if let Some(fragment) = new_fragment {
        target.fragment = fragment;
    }
    Ok(())
}

/// Renders a query template component by component so that substituted values are
/// query-escaped while the template's own `=` and `&` delimiters survive.
fn build_query(template: &str, repl: &Replacer) -> Result<String, DirectiveError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    // the first component is always a key
    let mut expecting_key = true;

    while !rest.is_empty() {
        let end = rest.find(['=', '&']).unwrap_or(rest.len());
        let component = &rest[..end];
        let delimiter = rest[end..].chars().next();

        let is_key = expecting_key;
        let rendered = repl.replace_with(component, |name, value| {
            if name == "http.request.uri.query" && is_key {
                value
            } else {
                urlencoding::encode(&value).into_owned()
            }
        })?;

        if is_key {
            if !out.is_empty() && !rendered.is_empty() {
                out.push('&');
            }
        } else {
            out.push('=');
        }
        out.push_str(&rendered);

        expecting_key = delimiter != Some('=');
        rest = match delimiter {
            Some(_) => &rest[end + 1..],
            None => "",
        };
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;

    use super::*;

    fn target(uri: &str) -> (RewriteTarget, Replacer) {
        let uri: Uri = uri.parse().unwrap();
        let repl = Replacer::for_request(&Method::GET, &uri, &HeaderMap::new());
        (RewriteTarget::new(Method::GET, &uri), repl)
    }

    fn strip_prefix(prefix: &str) -> Rewrite {
        Rewrite {
            strip_path_prefix: Some(prefix.to_string()),
            ..Rewrite::default()
        }
    }

    #[test]
    fn test_strip_prefix_keeps_query() {
        let (mut t, repl) = target("/api/v1/things?x=1");
        let changed = strip_prefix("/api").apply(&mut t, &repl).unwrap();
        assert!(changed);
        assert_eq!(t.path_and_query(), "/v1/things?x=1");
    }

    #[test]
    fn test_strip_prefix_is_stable() {
        let rewrite = strip_prefix("api");
        for uri in ["/api/v1/things", "/API/x", "/other/api", "/api"] {
            let (mut once, repl) = target(uri);
            rewrite.apply(&mut once, &repl).unwrap();
            let mut twice = once.clone();
            let changed = rewrite.apply(&mut twice, &repl).unwrap();
            assert_eq!(once, twice, "{uri}");
            assert!(!changed, "{uri}");
        }
    }

    #[test]
    fn test_strip_prefix_does_not_decode_slash() {
        let (mut t, repl) = target("/api%2Fv1/things");
        strip_prefix("/api/").apply(&mut t, &repl).unwrap();
        assert_eq!(t.path, "/api%2Fv1/things");
    }

    #[test]
    fn test_strip_suffix() {
        let (mut t, repl) = target("/docs/page.html");
        let rewrite = Rewrite {
            strip_path_suffix: Some(".HTML".to_string()),
            ..Rewrite::default()
        };
        rewrite.apply(&mut t, &repl).unwrap();
        assert_eq!(t.path, "/docs/page");
    }

    #[test]
    fn test_method_override() {
        let (mut t, repl) = target("/things");
        let rewrite = Rewrite {
            method: Some("post".to_string()),
            ..Rewrite::default()
        };
        assert!(rewrite.apply(&mut t, &repl).unwrap());
        assert_eq!(t.method, Method::POST);
    }

    #[test]
    fn test_uri_rewrite_components() {
        let (mut t, repl) = target("/old/path?keep=1");
        let rewrite = Rewrite {
            uri: Some("/new{http.request.uri.path}".to_string()),
            ..Rewrite::default()
        };
        rewrite.apply(&mut t, &repl).unwrap();
        assert_eq!(t.path_and_query(), "/new/old/path?keep=1");

        let (mut t, repl) = target("/old/path?keep=1");
        let rewrite = Rewrite {
            uri: Some("?name={http.request.uri.path.0}&{http.request.uri.query}".to_string()),
            ..Rewrite::default()
        };
        rewrite.apply(&mut t, &repl).unwrap();
        assert_eq!(t.path_and_query(), "/old/path?name=old&keep=1");
    }

    #[test]
    fn test_uri_rewrite_escapes_query_values() {
        let (mut t, _) = target("/search");
        let repl = Replacer::new().bind("q", "a&b c");
        let rewrite = Rewrite {
            uri: Some("/find?q={q}".to_string()),
            ..Rewrite::default()
        };
        rewrite.apply(&mut t, &repl).unwrap();
        assert_eq!(t.path_and_query(), "/find?q=a%26b%20c");
    }

    #[test]
    fn test_substring_and_regex_replacement() {
        let (mut t, repl) = target("/v1/v1/items?v1=true");
        let rewrite = Rewrite {
            substrings: vec![SubstringReplace {
                find: "v1".to_string(),
                replace: "v2".to_string(),
                limit: 1,
            }],
            regexes: vec![RegexReplace {
                find: Regex::new("/items$").unwrap(),
                replace: "/entries".to_string(),
            }],
            ..Rewrite::default()
        };
        rewrite.apply(&mut t, &repl).unwrap();
        assert_eq!(t.path_and_query(), "/v2/v1/entries?v2=true");
    }

    #[test]
    fn test_regex_capture_groups() {
        let (mut t, repl) = target("/users/42/profile");
        let rewrite = Rewrite {
            regexes: vec![RegexReplace {
                find: Regex::new(r"^/users/(\d+)/(.*)$").unwrap(),
                replace: "/profiles/$2/$1".to_string(),
            }],
            ..Rewrite::default()
        };
        rewrite.apply(&mut t, &repl).unwrap();
        assert_eq!(t.path, "/profiles/profile/42");
    }

    #[test]
    fn test_strict_placeholders_fail() {
        let (mut t, repl) = target("/x");
        let repl = repl.strict(true);
        let rewrite = Rewrite {
            uri: Some("/{missing}".to_string()),
            ..Rewrite::default()
        };
        assert!(matches!(
            rewrite.apply(&mut t, &repl),
            Err(DirectiveError::Placeholder(_))
        ));
    }
}
