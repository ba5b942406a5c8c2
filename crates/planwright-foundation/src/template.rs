//! Reference grammar for step arguments
//!
//! Three kinds of tokens may appear inside argument strings:
//!
//! - template references `{{<step>.result<path>}}`, where `<step>` is a
//!   literal step id or a positional alias (`step-2`) and `<path>` is a chain
//!   of `.field` and `[index]` segments;
//! - `CONTEXT.<root>.<path>` lookups into the execution context;
//! - sentinels such as `NOT_FOUND` or `NEEDS-INPUT:email` meaning the plan
//!   author could not determine a value.

use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

static TEMPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+)\.result((?:\.[A-Za-z0-9_\-]+|\[\d+\])*)\s*\}\}")
        .expect("template pattern is valid")
});

static CONTEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"CONTEXT\.([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)").expect("context pattern is valid")
});

static NEEDS_INPUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)NEEDS[-_]INPUT(?::\s*([A-Za-z0-9_.\-]+))?").expect("needs-input pattern is valid")
});

static SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9_\-]+)|\[(\d+)\]").expect("path segment pattern is valid")
});

/// Exact (trimmed, case-insensitive) markers meaning "no value".
const UNKNOWN_MARKERS: &[&str] = &[
    "NOT_FOUND",
    "NOT-FOUND",
    "INVALID",
    "INVALID_VALUE",
    "UNKNOWN",
    "<NOT_FOUND>",
    "<UNKNOWN>",
    "<NULL>",
    "NULL",
];

// ============================================================================
// Paths
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse `.items[0].id`, `items[0].id` or `[0]` into segments.
pub fn parse_path(path: &str) -> Vec<PathSegment> {
    SEGMENT_RE
        .captures_iter(path)
        .filter_map(|caps| {
            if let Some(key) = caps.get(1) {
                Some(PathSegment::Key(key.as_str().to_string()))
            } else {
                caps.get(2)
                    .and_then(|idx| idx.as_str().parse().ok())
                    .map(PathSegment::Index)
            }
        })
        .collect()
}

/// Render segments back into `items[0].id` form.
pub fn format_path(segments: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            PathSegment::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            PathSegment::Index(idx) => {
                out.push('[');
                out.push_str(&idx.to_string());
                out.push(']');
            }
        }
    }
    out
}

// ============================================================================
// Template references
// ============================================================================

/// One `{{<step>.result<path>}}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    /// The token exactly as written.
    pub raw: String,
    pub step: String,
    pub path: Vec<PathSegment>,
    pub span: Range<usize>,
}

impl TemplateRef {
    /// `{{X.result}}` with no sub-path.
    pub fn is_whole_result(&self) -> bool {
        self.path.is_empty()
    }

    pub fn path_text(&self) -> String {
        format_path(&self.path)
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

pub fn find_references(text: &str) -> Vec<TemplateRef> {
    TEMPLATE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let step = caps.get(1)?.as_str().to_string();
            let path = caps.get(2).map(|m| parse_path(m.as_str())).unwrap_or_default();
            Some(TemplateRef {
                raw: whole.as_str().to_string(),
                step,
                path,
                span: whole.range(),
            })
        })
        .collect()
}

/// Every template reference found in any string inside `value`.
pub fn references_in(value: &Value) -> Vec<TemplateRef> {
    let mut refs = Vec::new();
    visit_strings(value, &mut |s| refs.extend(find_references(s)));
    refs
}

/// Every template reference found in an argument map.
pub fn references_in_arguments(arguments: &Map<String, Value>) -> Vec<TemplateRef> {
    arguments.values().flat_map(references_in).collect()
}

pub fn contains_template(text: &str) -> bool {
    TEMPLATE_RE.is_match(text)
}

fn visit_strings(value: &Value, f: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|v| visit_strings(v, f)),
        Value::Object(map) => map.values().for_each(|v| visit_strings(v, f)),
        _ => {}
    }
}

// ============================================================================
// CONTEXT tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRef {
    pub raw: String,
    pub root: String,
    pub path: Vec<String>,
    pub span: Range<usize>,
}

pub fn find_context_refs(text: &str) -> Vec<ContextRef> {
    CONTEXT_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let mut parts = caps.get(1)?.as_str().split('.').map(str::to_string);
            let root = parts.next()?;
            Some(ContextRef {
                raw: whole.as_str().to_string(),
                root,
                path: parts.collect(),
                span: whole.range(),
            })
        })
        .collect()
}

// ============================================================================
// Sentinels
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sentinel {
    /// A "could not determine" marker; the argument name is what is missing.
    Unknown,
    /// `NEEDS-INPUT[:name]`.
    NeedsInput { name: Option<String>, span: Range<usize> },
}

pub fn detect_sentinel(text: &str) -> Option<Sentinel> {
    let trimmed = text.trim();
    if UNKNOWN_MARKERS.iter().any(|m| m.eq_ignore_ascii_case(trimmed)) {
        return Some(Sentinel::Unknown);
    }
    NEEDS_INPUT_RE.captures(text).and_then(|caps| {
        let whole = caps.get(0)?;
        Some(Sentinel::NeedsInput {
            name: caps.get(1).map(|m| m.as_str().to_string()),
            span: whole.range(),
        })
    })
}

// ============================================================================
// Substitution
// ============================================================================

/// Render a resolved value for splicing into a larger string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace `spans` in `text`; a string made of exactly one token becomes the
/// token's typed value.
pub fn splice(text: &str, mut replacements: Vec<(Range<usize>, Value)>) -> Value {
    if replacements.is_empty() {
        return Value::String(text.to_string());
    }
    if replacements.len() == 1 {
        let (span, value) = &replacements[0];
        if text[span.clone()].trim() == text.trim() {
            return value.clone();
        }
    }

    replacements.sort_by_key(|(span, _)| span.start);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (span, value) in replacements {
        if span.start < cursor {
            continue;
        }
        out.push_str(&text[cursor..span.start]);
        out.push_str(&stringify(&value));
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    Value::String(out)
}

/// Replace every occurrence of `token` anywhere inside `value`.
pub fn substitute_token(value: &Value, token: &str, replacement: &Value) -> Value {
    match value {
        Value::String(s) if s.contains(token) => {
            let spans = s
                .match_indices(token)
                .map(|(start, m)| (start..start + m.len(), replacement.clone()))
                .collect();
            splice(s, spans)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_token(v, token, replacement))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_token(v, token, replacement)))
                .collect(),
        ),
        other => other.clone(),
    }
}
