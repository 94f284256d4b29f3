//! Multi-segment wildcard path patterns
//!
//! - `*` matches exactly one path segment
//! - `**` matches zero or more segments, anywhere in the pattern
//! - a segment mixing `*` with other text (`v*`, `*.json`) is a glob within that segment
//!
//! Empty segments are ignored on both sides, so trailing and doubled slashes never
//! change the outcome. Request paths go through [`normalize_path`] first: `.` and
//! `..` segments (also percent-encoded) are resolved before any rule sees them.

use crate::error::{AuthzError, Result};
use regex::Regex;
use std::fmt;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Single,
    Glob(Regex),
    Multi,
}

impl Segment {
    fn matches(&self, value: &str) -> bool {
        match self {
            Segment::Literal(literal) => literal == value,
            Segment::Single => true,
            Segment::Glob(regex) => regex.is_match(value),
            Segment::Multi => true,
        }
    }
}

/// Compiled path pattern
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Compile a pattern, rejecting anything that is not an absolute path
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if !trimmed.starts_with('/') {
            return Err(invalid(raw, "pattern must start with '/'"));
        }

        let mut segments: Vec<Segment> = Vec::new();
        for part in split_segments(trimmed) {
            let segment = match part {
                "**" => {
                    // consecutive `**` collapse into one
                    if matches!(segments.last(), Some(Segment::Multi)) {
                        continue;
                    }
                    Segment::Multi
                }
                "*" => Segment::Single,
                glob if glob.contains("**") => {
                    return Err(invalid(raw, "'**' must occupy a whole segment"));
                }
                glob if glob.contains('*') => Segment::Glob(compile_glob(raw, glob)?),
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    /// Match a request path (without query string)
    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = split_segments(path).collect();
        match_segments(&self.segments, &parts)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Segments matched character for character
    pub fn literal_segments(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    /// `**` segments
    pub fn multi_wildcards(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Multi))
            .count()
    }

    /// `*` and in-segment glob segments
    pub fn single_wildcards(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Single | Segment::Glob(_)))
            .count()
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Resolve dot segments the way RFC 3986 does, clamping `..` at the root
///
/// `%2e` counts as a dot. Returns `None` for segments carrying an encoded
/// separator (`%2f`, `%5c`) or a backslash, which a backend could split
/// differently from the matcher.
pub fn normalize_path(path: &str) -> Option<String> {
    let mut resolved: Vec<&str> = Vec::new();

    for segment in split_segments(path) {
        let lowered = segment.to_ascii_lowercase();
        if segment.contains('\\') || lowered.contains("%2f") || lowered.contains("%5c") {
            return None;
        }

        match lowered.replace("%2e", ".").as_str() {
            "." => {}
            ".." => {
                resolved.pop();
            }
            _ => resolved.push(segment),
        }
    }

    Some(format!("/{}", resolved.join("/")))
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

fn match_segments(pattern: &[Segment], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((Segment::Multi, rest)) => {
            if rest.is_empty() {
                return true;
            }
            (0..=path.len()).any(|skip| match_segments(rest, &path[skip..]))
        }
        Some((segment, rest)) => match path.split_first() {
            Some((head, tail)) => segment.matches(head) && match_segments(rest, tail),
            None => false,
        },
    }
}

fn compile_glob(raw: &str, glob: &str) -> Result<Regex> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^/]*");

    Regex::new(&format!("^{}$", body)).map_err(|e| invalid(raw, &e.to_string()))
}

fn invalid(pattern: &str, reason: &str) -> AuthzError {
    AuthzError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}
