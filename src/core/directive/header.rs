//! The header directive mini-language.
//!
//! ```text
//! +X-Added value      append a value
//! -X-Removed          remove a header
//! -X-Internal-*       remove every header with the prefix
//! X-Replaced value    set, replacing existing values
//! ```
//!
//! Values may contain `{placeholders}`.
use http::{HeaderMap, HeaderName, HeaderValue};

use super::{DirectiveError, replacer::Replacer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOp {
    Add(HeaderName, String),
    Set(HeaderName, String),
    Remove(HeaderName),
    RemovePrefix(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderOps {
    ops: Vec<HeaderOp>,
}

impl HeaderOps {
    pub fn parse<I, S>(lines: I) -> Result<Self, DirectiveError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ops = lines
            .into_iter()
            .filter(|line| !line.as_ref().trim().is_empty())
            .map(|line| parse_line(line.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ops })
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[HeaderOp] {
        &self.ops
    }

    pub fn apply(&self, headers: &mut HeaderMap, repl: &Replacer) -> Result<(), DirectiveError> {
        for op in &self.ops {
            match op {
                HeaderOp::Add(name, template) => {
                    headers.append(name.clone(), render(template, repl)?);
                }
                HeaderOp::Set(name, template) => {
                    headers.insert(name.clone(), render(template, repl)?);
                }
                HeaderOp::Remove(name) => {
                    headers.remove(name);
                }
                HeaderOp::RemovePrefix(prefix) => {
                    let doomed: Vec<HeaderName> = headers
                        .keys()
                        .filter(|name| name.as_str().starts_with(prefix.as_str()))
                        .cloned()
                        .collect();
                    for name in doomed {
                        headers.remove(&name);
                    }
                }
            }
        }
        Ok(())
    }
}

fn render(template: &str, repl: &Replacer) -> Result<HeaderValue, DirectiveError> {
    let value = repl.replace_all(template)?;
    HeaderValue::from_str(&value).map_err(|_| DirectiveError::InvalidHeaderLine(value))
}

fn parse_line(line: &str) -> Result<HeaderOp, DirectiveError> {
    let line = line.trim();
    let invalid = || DirectiveError::InvalidHeaderLine(line.to_string());
    let header_name =
        |name: &str| HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid());

    if let Some(rest) = line.strip_prefix('-') {
        let name = rest.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(invalid());
        }
        return match name.strip_suffix('*') {
            Some(prefix) => {
                // validate the prefix as a header name fragment
                if !prefix.is_empty() {
                    header_name(prefix)?;
                }
                Ok(HeaderOp::RemovePrefix(prefix.to_ascii_lowercase()))
            }
            None => Ok(HeaderOp::Remove(header_name(name)?)),
        };
    }

    let (add, rest) = match line.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let (name, value) = rest
        .trim_start()
        .split_once(char::is_whitespace)
        .ok_or_else(invalid)?;
    let name = header_name(name)?;
    let value = value.trim().to_string();
    Ok(if add {
        HeaderOp::Add(name, value)
    } else {
        HeaderOp::Set(name, value)
    })
}
