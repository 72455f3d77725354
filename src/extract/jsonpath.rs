//! Minimal JSON path support for body cost sources.
//!
//! Accepts `$`-rooted dotted and bracketed paths such as
//! `$.usage.total_tokens`, `$.choices[0].tokens` or `$['usage']['total']`.

use serde_json::Value;

use crate::error::{RatekeeperError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// A compiled JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Compile a path, failing with a configuration error on bad syntax.
    pub fn parse(path: &str) -> Result<Self> {
        let invalid = |reason: &str| RatekeeperError::Config(format!("jsonPath {:?}: {}", path, reason));

        let trimmed = path.trim();
        let (mut rest, rooted) = match trimmed.strip_prefix('$') {
            Some(rest) => (rest, true),
            None => (trimmed, false),
        };
        let mut segments = Vec::new();

        // A bare field name without `$.` is accepted as the first segment.
        if !rooted && !rest.is_empty() && !rest.starts_with('.') && !rest.starts_with('[') {
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            segments.push(Segment::Field(rest[..end].to_string()));
            rest = &rest[end..];
        }

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(['.', '[']).unwrap_or(after.len());
                if end == 0 {
                    return Err(invalid("empty field name"));
                }
                segments.push(Segment::Field(after[..end].to_string()));
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let close = after.find(']').ok_or_else(|| invalid("unclosed bracket"))?;
                let inner = after[..close].trim();
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
                let segment = match quoted {
                    Some(name) => Segment::Field(name.to_string()),
                    None => Segment::Index(
                        inner.parse().map_err(|_| invalid("bracket must hold an index or quoted name"))?,
                    ),
                };
                segments.push(segment);
                rest = &after[close + 1..];
            } else {
                return Err(invalid("expected '.' or '['"));
            }
        }

        if segments.is_empty() {
            return Err(invalid("path selects nothing"));
        }
        Ok(Self { segments })
    }

    /// Resolve the path against a document.
    pub fn select<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(document, |current, segment| match segment {
                Segment::Field(name) => current.get(name.as_str()),
                Segment::Index(index) => current.get(*index),
            })
    }
}
