//! Path normalization helpers shared by the matcher and the rewriter.

/// Placeholder that cannot appear in a request path; used to keep empty segments
/// alive while `..` and `.` are resolved.
const EMPTY_SEGMENT_MARK: char = '\u{FFFF}';

/// Lexically cleans `p` like a POSIX path: `.` and `..` are resolved and repeated
/// slashes merged. A trailing slash on the input is preserved.
///
/// With `merge_slashes` off, doubled slashes survive cleaning so patterns that contain
/// `//` can match them literally.
pub fn clean_path(p: &str, merge_slashes: bool) -> String {
    if merge_slashes {
        return clean_keep_trailing(p);
    }

    let mut marked = String::with_capacity(p.len() + 4);
    let mut previous = None;
    for ch in p.chars() {
        if ch == '/' && previous == Some('/') {
            marked.push(EMPTY_SEGMENT_MARK);
        }
        marked.push(ch);
        previous = Some(ch);
    }
    clean_keep_trailing(&marked).replace(EMPTY_SEGMENT_MARK, "")
}

fn clean_keep_trailing(p: &str) -> String {
    let mut cleaned = lexical_clean(p);
    if cleaned != "/" && p.ends_with('/') {
        cleaned.push('/');
    }
    cleaned
}

fn lexical_clean(p: &str) -> String {
    if p.is_empty() {
        return ".".to_string();
    }
    let rooted = p.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for segment in p.split('/') {
        match segment {
            "" | "." => {}
            ".." => match stack.last() {
                Some(last) if *last != ".." => {
                    stack.pop();
                }
                _ if !rooted => stack.push(".."),
                _ => {}
            },
            other => stack.push(other),
        }
    }
    let joined = stack.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Glob matching with shell-style semantics: `*` matches any run of non-`/` bytes,
/// `?` a single non-`/` byte, `[...]` a byte class (`^` negates, `a-z` ranges) and
/// `\` escapes the following byte. Without wildcards this is an exact comparison.
pub fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    let (mut p, mut n) = (0usize, 0usize);
    // pattern index after the last star, and the name index it currently covers up to
    let mut resume: Option<(usize, usize)> = None;

    while p < pattern.len() || n < name.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    resume = Some((p + 1, n));
                    p += 1;
                    continue;
                }
                b'?' => {
                    if n < name.len() && name[n] != b'/' {
                        p += 1;
                        n += 1;
                        continue;
                    }
                }
                b'[' => {
                    if n < name.len() {
                        match match_class(&pattern[p..], name[n]) {
                            Some((true, width)) => {
                                p += width;
                                n += 1;
                                continue;
                            }
                            Some((false, _)) => {}
                            None => return false,
                        }
                    }
                }
                b'\\' => {
                    if p + 1 < pattern.len() && n < name.len() && pattern[p + 1] == name[n] {
                        p += 2;
                        n += 1;
                        continue;
                    }
                }
                literal => {
                    if n < name.len() && literal == name[n] {
                        p += 1;
                        n += 1;
                        continue;
                    }
                }
            }
        }
        match resume {
            Some((star_p, star_n)) if star_n < name.len() && name[star_n] != b'/' => {
                resume = Some((star_p, star_n + 1));
                p = star_p;
                n = star_n + 1;
            }
            _ => return false,
        }
    }
    true
}

/// Returns whether `ch` is in the class starting at `class[0] == b'['`, and the byte
/// width of the class. `None` for a malformed class.
fn match_class(class: &[u8], ch: u8) -> Option<(bool, usize)> {
    let mut i = 1;
    let negated = class.get(i) == Some(&b'^');
    if negated {
        i += 1;
    }
    let first = i;
    let mut matched = false;
    loop {
        let current = *class.get(i)?;
        if current == b']' && i > first {
            return Some((matched != negated, i + 1));
        }
        let (lo, lo_width) = class_byte(class, i)?;
        i += lo_width;
        let mut hi = lo;
        if class.get(i) == Some(&b'-') && class.get(i + 1).is_some_and(|b| *b != b']') {
            let (upper, hi_width) = class_byte(class, i + 1)?;
            hi = upper;
            i += 1 + hi_width;
        }
        if lo <= ch && ch <= hi {
            matched = true;
        }
    }
}

fn class_byte(class: &[u8], i: usize) -> Option<(u8, usize)> {
    match class.get(i)? {
        b'\\' => class.get(i + 1).map(|b| (*b, 2)),
        b => Some((*b, 1)),
    }
}

/// One unit of an escaped path: either a plain byte or a `%XX` escape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathUnit {
    Byte(u8),
    Escape(u8),
}

impl PathUnit {
    fn width(self) -> usize {
        match self {
            PathUnit::Byte(_) => 1,
            PathUnit::Escape(_) => 3,
        }
    }
}

pub(crate) fn tokenize_escaped(s: &str) -> Vec<PathUnit> {
    let bytes = s.as_bytes();
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                units.push(PathUnit::Escape(hi << 4 | lo));
                i += 3;
                continue;
            }
        }
        units.push(PathUnit::Byte(bytes[i]));
        i += 1;
    }
    units
}

pub(crate) fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Compares one unit of the pattern (prefix or suffix) with one unit of the path.
///
/// An escape in the pattern must be matched by the same escape in the path. A plain
/// byte in the pattern matches the same byte, case-insensitively, in either form, except
/// that an encoded slash never stands in for a literal `/`.
fn unit_matches(pattern: PathUnit, path: PathUnit) -> bool {
    match (pattern, path) {
        (PathUnit::Escape(a), PathUnit::Escape(b)) => a.eq_ignore_ascii_case(&b),
        (PathUnit::Escape(_), PathUnit::Byte(_)) => false,
        (PathUnit::Byte(a), PathUnit::Byte(b)) => a.eq_ignore_ascii_case(&b),
        (PathUnit::Byte(a), PathUnit::Escape(b)) => b != b'/' && a.eq_ignore_ascii_case(&b),
    }
}

/// Removes `prefix` from the start of `escaped_path` when present, comparing in decoded
/// space where the prefix is plain and in escaped space where the prefix is escaped.
/// Returns the path unchanged otherwise.
pub fn trim_path_prefix<'a>(escaped_path: &'a str, prefix: &str) -> &'a str {
    let path_units = tokenize_escaped(escaped_path);
    let prefix_units = tokenize_escaped(prefix);
    if prefix_units.len() > path_units.len() {
        return escaped_path;
    }
    let mut consumed = 0;
    for (pattern, unit) in prefix_units.iter().zip(&path_units) {
        if !unit_matches(*pattern, *unit) {
            return escaped_path;
        }
        consumed += unit.width();
    }
    &escaped_path[consumed..]
}

/// Suffix counterpart of [`trim_path_prefix`].
pub fn trim_path_suffix<'a>(escaped_path: &'a str, suffix: &str) -> &'a str {
    let path_units = tokenize_escaped(escaped_path);
    let suffix_units = tokenize_escaped(suffix);
    if suffix_units.len() > path_units.len() {
        return escaped_path;
    }
    let mut consumed = 0;
    for (pattern, unit) in suffix_units.iter().rev().zip(path_units.iter().rev()) {
        if !unit_matches(*pattern, *unit) {
            return escaped_path;
        }
        consumed += unit.width();
    }
    &escaped_path[..escaped_path.len() - consumed]
}

/// Percent-decodes a path, replacing invalid UTF-8 with U+FFFD.
pub fn decode_path(escaped_path: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(escaped_path.as_bytes())).into_owned()
}
