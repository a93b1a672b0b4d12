//! Request matchers for reverse-proxy routes.
use http::Method;

use super::{
    DirectiveError,
    path::{clean_path, decode_path, glob_match, hex_value},
};

/// Case-insensitive path matcher over a list of glob-like patterns.
///
/// Patterns containing `%` are matched against the escaped form of the path, so that
/// `%2F` in a pattern only ever matches an encoded slash and never a path separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatcher {
    patterns: Vec<String>,
}

impl PathMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .collect(),
        }
    }

    /// Matches the escaped request path (as found on the wire) against every pattern.
    pub fn matches(&self, escaped_path: &str) -> bool {
        let escaped = escaped_path.to_lowercase();
        let decoded = decode_path(escaped_path).to_lowercase();
        self.patterns
            .iter()
            .any(|pattern| match_pattern(pattern, &decoded, &escaped))
    }

    /// Number of literal characters in the most specific pattern.
    pub fn specificity(&self) -> usize {
        self.patterns
            .iter()
            .map(|p| {
                p.chars()
                    .filter(|c| !matches!(c, '*' | '?' | '[' | ']'))
                    .count()
            })
            .max()
            .unwrap_or(0)
    }
}

fn match_pattern(pattern: &str, decoded: &str, escaped: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    // doubled slashes in the pattern are meaningful, so keep them in the path too
    let merge_slashes = !pattern.contains("//");

    if pattern.contains('%') {
        return match_escaped(&clean_path(escaped, merge_slashes), pattern);
    }

    let path = clean_path(decoded, merge_slashes);
    let stars = pattern.matches('*').count();

    if stars == 2 && pattern.len() >= 2 && pattern.starts_with('*') && pattern.ends_with('*') {
        return path.contains(&pattern[1..pattern.len() - 1]);
    }
    if stars == 1 {
        if let Some(suffix) = pattern.strip_prefix('*') {
            return path.ends_with(suffix);
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            return path.starts_with(prefix);
        }
    }

    glob_match(pattern.as_bytes(), path.as_bytes())
}

/// Walks the pattern and the escaped path in lock-step, building the string the glob is
/// finally compared with: escapes named by the pattern stay escaped, `%*` spans stay raw,
/// everything else is decoded.
fn match_escaped(escaped_path: &str, pattern: &str) -> bool {
    let path = escaped_path.as_bytes();
    let pat = pattern.as_bytes();
    let mut normalized: Vec<u8> = Vec::with_capacity(path.len());
    let (mut ip, mut jp) = (0usize, 0usize);

    while ip < pat.len() && jp < path.len() {
        let raw_wildcard = pat[ip] == b'%' && pat.get(ip + 1) == Some(&b'*');
        match pat[ip] {
            b'%' if !raw_wildcard && ip + 2 < pat.len() => {
                if path[jp] != b'%' || jp + 2 >= path.len() {
                    return false;
                }
                normalized.extend_from_slice(&path[jp..jp + 3]);
                jp += 3;
                ip += 3;
            }
            b'%' | b'*' if raw_wildcard || pat[ip] == b'*' => {
                if raw_wildcard {
                    ip += 1;
                }
                let remaining = &path[jp..];
                let until = match pat.get(ip + 1) {
                    Some(next) => match remaining.iter().position(|b| b == next) {
                        Some(at) => at,
                        None => return false,
                    },
                    None => remaining.len(),
                };
                let span = &remaining[..until];
                if raw_wildcard {
                    normalized.extend_from_slice(span);
                } else {
                    normalized.extend_from_slice(&urlencoding::decode_binary(span));
                }
                jp += until;
                ip += 1;
            }
            _ => {
                match decode_escape(path, jp) {
                    Some(byte) => {
                        normalized.push(byte);
                        jp += 3;
                    }
                    None => {
                        normalized.push(path[jp]);
                        jp += 1;
                    }
                }
                ip += 1;
            }
        }
    }
    if jp < path.len() {
        normalized.extend_from_slice(&urlencoding::decode_binary(&path[jp..]));
    }

    let glob = pattern.replace("%*", "*");
    glob_match(glob.as_bytes(), &normalized)
}

fn decode_escape(path: &[u8], at: usize) -> Option<u8> {
    if path.get(at) != Some(&b'%') {
        return None;
    }
    let hi = hex_value(*path.get(at + 1)?)?;
    let lo = hex_value(*path.get(at + 2)?)?;
    Some(hi << 4 | lo)
}

/// Method plus path filter of a reverse-proxy route. A method of `*` accepts any method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatcher {
    method: Option<Method>,
    path: PathMatcher,
}

impl RouteMatcher {
    pub fn new(method: &str, path: &str) -> Result<Self, DirectiveError> {
        let method = match method.trim() {
            "" | "*" => None,
            m => Some(
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| DirectiveError::InvalidMethod(m.to_string()))?,
            ),
        };
        Ok(Self {
            method,
            path: PathMatcher::new([path]),
        })
    }

    pub fn matches(&self, method: &Method, escaped_path: &str) -> bool {
        if let Some(expected) = &self.method {
            if expected != method {
                return false;
            }
        }
        self.path.matches(escaped_path)
    }

    /// Ordering key for overlapping routes: longer literal patterns first, then routes
    /// bound to a concrete method.
    pub fn specificity(&self) -> (usize, bool) {
        (self.path.specificity(), self.method.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        PathMatcher::new([pattern]).matches(path)
    }

    #[test]
    fn test_wildcard_matches_everything() {
        for path in ["/", "/foo", "/a/b/c", "//x", "/%2F"] {
            assert!(matches("*", path), "{path}");
        }
    }

    #[test]
    fn test_prefix_pattern() {
        assert!(matches("/foo/*", "/foo/bar"));
        assert!(!matches("/foo/*", "/fooo"));
        assert!(matches("/FOO/*", "/foo/Bar"));
        // dot segments are resolved before matching
        assert!(!matches("/foo/*", "/foo/../etc/passwd"));
    }

    #[test]
    fn test_suffix_and_substring_patterns() {
        assert!(matches("*.js", "/static/app.JS"));
        assert!(!matches("*.js", "/static/app.css"));
        assert!(matches("*/edit/*", "/docs/edit/page"));
        assert!(!matches("*/edit/*", "/docs/view/page"));
    }

    #[test]
    fn test_exact_and_glob_patterns() {
        assert!(matches("/healthz", "/HEALTHZ"));
        assert!(!matches("/healthz", "/healthz/more"));
        assert!(matches("/api/*/items", "/api/v1/items"));
        assert!(!matches("/api/*/items", "/api/v1/x/items"));
    }

    #[test]
    fn test_double_slash_handling() {
        assert!(matches("/a/b", "/a//b"));
        assert!(matches("/a//b", "/a//b"));
        assert!(!matches("/a//b", "/a/b"));
    }

    #[test]
    fn test_escaped_patterns_match_in_escaped_space() {
        assert!(matches("/foo/%2F*", "/foo/%2Fbar"));
        assert!(matches("/foo/%2f*", "/foo/%2Fbar"));
        assert!(!matches("/foo/%2F*", "/foo//bar"));
        assert!(!matches("/foo/%2F*", "/foo/bar"));
        // plain characters in an escaped pattern still compare decoded
        assert!(matches("/f%6Fo/%2F*", "/f%6fo/%2Fx"));
        assert!(!matches("/api/%2F", "/api/%2F/extra"));
    }

    #[test]
    fn test_raw_wildcard_keeps_encoded_slashes() {
        assert!(matches("/bucket/%*/meta", "/bucket/a%2Fb/meta"));
        assert!(!matches("/bucket/*/meta", "/bucket/a%2Fb/meta"));
    }

    #[test]
    fn test_route_matcher_method_filter() {
        let any = RouteMatcher::new("*", "/api/*").unwrap();
        assert!(any.matches(&Method::DELETE, "/api/v1"));

        let get = RouteMatcher::new("get", "/api/*").unwrap();
        assert!(get.matches(&Method::GET, "/api/v1"));
        assert!(!get.matches(&Method::POST, "/api/v1"));

        assert!(RouteMatcher::new("GE T", "/").is_err());
    }

    #[test]
    fn test_specificity_prefers_longer_literals() {
        let broad = RouteMatcher::new("*", "/api/*").unwrap();
        let narrow = RouteMatcher::new("*", "/api/v1/*").unwrap();
        assert!(narrow.specificity() > broad.specificity());
        let bound = RouteMatcher::new("GET", "/api/*").unwrap();
        assert!(bound.specificity() > broad.specificity());
    }
}
