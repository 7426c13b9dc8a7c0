//! Minimal JSONPath evaluation for rule parameter resolution.
//!
//! Covers the dialect rules actually use: `$`, `.name`, `[0]`, `['name']`,
//! `["name"]` and `[*]`. Wildcard segments project over every member and
//! collect the survivors into an array; the rule engine applies its own
//! normalization on top.

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path must start with '$'")]
    MissingRoot,
    #[error("invalid path syntax at '{0}'")]
    Syntax(String),
    #[error("no value at path")]
    NotFound,
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// Resolve a `$`-anchored path against a decoded JSON value.
pub fn resolve(root: &Value, path: &str) -> Result<Value, PathError> {
    let segments = parse(path)?;

    let mut nodes = vec![root];
    let mut projected = false;

    for segment in &segments {
        let mut next = Vec::with_capacity(nodes.len());
        for node in nodes {
            match segment {
                Segment::Key(key) => {
                    if let Some(child) = node.get(key) {
                        next.push(child);
                    } else if !projected {
                        return Err(PathError::NotFound);
                    }
                }
                Segment::Index(i) => {
                    if let Some(child) = node.get(i) {
                        next.push(child);
                    } else if !projected {
                        return Err(PathError::NotFound);
                    }
                }
                Segment::Wildcard => match node {
                    Value::Array(items) => next.extend(items.iter()),
                    Value::Object(map) => next.extend(map.values()),
                    _ => {
                        if !projected {
                            return Err(PathError::NotFound);
                        }
                    }
                },
            }
        }
        if matches!(segment, Segment::Wildcard) {
            projected = true;
        }
        nodes = next;
    }

    if projected {
        return Ok(Value::Array(nodes.into_iter().cloned().collect()));
    }
    match nodes.first() {
        Some(value) => Ok((*value).clone()),
        None => Err(PathError::NotFound),
    }
}

fn parse(path: &str) -> Result<Vec<Segment>, PathError> {
    let rest = path.strip_prefix('$').ok_or(PathError::MissingRoot)?;
    let bytes = rest.as_bytes();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                i += 1;
                if i < bytes.len() && bytes[i] == b'*' {
                    segments.push(Segment::Wildcard);
                    i += 1;
                    continue;
                }
                let start = i;
                while i < bytes.len() && bytes[i] != b'.' && bytes[i] != b'[' {
                    i += 1;
                }
                if start == i {
                    return Err(PathError::Syntax(rest[start.saturating_sub(1)..].to_string()));
                }
                segments.push(Segment::Key(rest[start..i].to_string()));
            }
            b'[' => {
                let close = rest[i..]
                    .find(']')
                    .map(|off| i + off)
                    .ok_or_else(|| PathError::Syntax(rest[i..].to_string()))?;
                let inner = rest[i + 1..close].trim();
                if inner == "*" {
                    segments.push(Segment::Wildcard);
                } else if let Some(quoted) = strip_quotes(inner) {
                    segments.push(Segment::Key(quoted.to_string()));
                } else {
                    let index: usize = inner
                        .parse()
                        .map_err(|_| PathError::Syntax(inner.to_string()))?;
                    segments.push(Segment::Index(index));
                }
                i = close + 1;
            }
            _ => return Err(PathError::Syntax(rest[i..].to_string())),
        }
    }
    Ok(segments)
}

fn strip_quotes(s: &str) -> Option<&str> {
    let s = s.strip_prefix('\'').and_then(|s| s.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))?;
    Some(s)
}
