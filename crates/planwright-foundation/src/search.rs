//! Layered search over step results
//!
//! Step results are arbitrary JSON trees, often wrapping the interesting data
//! in envelopes or embedding it as a JSON string. [`LayeredSearch`] tries a
//! fixed sequence of strategies, from exact to heuristic, and reports which
//! one produced the value.

use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::ops::ControlFlow;

use crate::template::PathSegment;

/// Which strategy located a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    WholeResult,
    DirectPath,
    SmartField,
    PatternDiscovery,
    ArrayFallback,
    IdFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub value: Value,
    pub strategy: SearchStrategy,
}

const ID_LIKE_FIELDS: &[&str] = &["id", "_id", "uuid", "key", "identifier"];

// ============================================================================
// Tree helpers
// ============================================================================

/// Breadth-first walk; the visitor receives the key under which each node
/// was found (`None` for the root and array elements).
pub fn visit<'a, B>(
    root: &'a Value,
    mut visitor: impl FnMut(Option<&'a str>, &'a Value) -> ControlFlow<B>,
) -> Option<B> {
    let mut queue: VecDeque<(Option<&'a str>, &'a Value)> = VecDeque::from([(None, root)]);
    while let Some((key, node)) = queue.pop_front() {
        if let ControlFlow::Break(found) = visitor(key, node) {
            return Some(found);
        }
        match node {
            Value::Object(map) => queue.extend(map.iter().map(|(k, v)| (Some(k.as_str()), v))),
            Value::Array(items) => queue.extend(items.iter().map(|v| (None, v))),
            _ => {}
        }
    }
    None
}

/// Recursively parse string values that hold JSON documents.
///
/// Accepts strict JSON and a relaxed form using single quotes and Python
/// literals (`True`, `False`, `None`).
pub fn parse_embedded(value: &Value) -> Value {
    match value {
        Value::String(s) => match parse_structured_str(s) {
            Some(parsed) => parse_embedded(&parsed),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(parse_embedded).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), parse_embedded(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn parse_structured_str(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let looks_structured = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if !looks_structured {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    serde_json::from_str(&relax_python_literals(trimmed)).ok()
}

/// Rewrite single-quoted strings and bare `True`/`False`/`None` into JSON.
/// String contents are copied untouched.
fn relax_python_literals(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut word = String::new();
    let mut quote: Option<char> = None;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            match c {
                '\\' => match chars.next() {
                    Some('\'') => out.push('\''),
                    Some(next) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => out.push('\\'),
                },
                '"' if q == '\'' => out.push_str("\\\""),
                c if c == q => {
                    out.push('"');
                    quote = None;
                }
                c => out.push(c),
            }
            continue;
        }
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            continue;
        }
        flush_word(&mut out, &mut word);
        if c == '\'' || c == '"' {
            quote = Some(c);
            out.push('"');
        } else {
            out.push(c);
        }
    }
    flush_word(&mut out, &mut word);
    out
}

fn flush_word(out: &mut String, word: &mut String) {
    out.push_str(match word.as_str() {
        "True" => "true",
        "False" => "false",
        "None" => "null",
        other => other,
    });
    word.clear();
}

/// Follow `path` exactly.
pub fn get_path<'a>(value: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(value, |node, segment| match (segment, node) {
        (PathSegment::Key(key), Value::Object(map)) => map.get(key),
        (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx),
        _ => None,
    })
}

fn defined(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// First field named `name` anywhere in the tree.
pub fn find_field<'a>(root: &'a Value, name: &str) -> Option<&'a Value> {
    visit(root, |_, node| match node {
        Value::Object(map) => match defined(map.get(name)) {
            Some(found) => ControlFlow::Break(found),
            None => ControlFlow::Continue(()),
        },
        _ => ControlFlow::Continue(()),
    })
}

fn id_like(map: &Map<String, Value>) -> Option<&Value> {
    ID_LIKE_FIELDS
        .iter()
        .find_map(|f| defined(map.get(*f)))
        .or_else(|| {
            map.iter()
                .find(|(k, v)| (k.ends_with("_id") || k.ends_with("Id")) && !v.is_null())
                .map(|(_, v)| v)
        })
}

fn last_key(path: &[PathSegment]) -> Option<(usize, &str)> {
    path.iter().enumerate().rev().find_map(|(i, s)| match s {
        PathSegment::Key(k) => Some((i, k.as_str())),
        PathSegment::Index(_) => None,
    })
}

fn first_index(path: &[PathSegment]) -> usize {
    path.iter()
        .find_map(|s| match s {
            PathSegment::Index(idx) => Some(*idx),
            PathSegment::Key(_) => None,
        })
        .unwrap_or(0)
}

// ============================================================================
// Strategies
// ============================================================================

fn smart_field(root: &Value, path: &[PathSegment]) -> Option<Value> {
    let (pos, name) = last_key(path)?;
    let found = find_field(root, name)?;
    let suffix = &path[pos + 1..];
    defined(get_path(found, suffix)).cloned()
}

fn pattern_discovery(root: &Value, path: &[PathSegment]) -> Option<Value> {
    let (pos, field) = last_key(path)?;
    let preferred: Vec<&str> = path[..pos]
        .iter()
        .filter_map(|s| match s {
            PathSegment::Key(k) => Some(k.as_str()),
            PathSegment::Index(_) => None,
        })
        .collect();

    let mut candidates: Vec<(Option<&str>, &Vec<Value>)> = Vec::new();
    visit::<()>(root, |key, node| {
        if let Value::Array(items) = node {
            if items
                .iter()
                .any(|item| item.as_object().is_some_and(|m| m.contains_key(field)))
            {
                candidates.push((key, items));
            }
        }
        ControlFlow::Continue(())
    });

    let (_, items) = candidates
        .iter()
        .find(|(key, _)| key.is_some_and(|k| preferred.contains(&k)))
        .or_else(|| candidates.first())?;

    let idx = first_index(path);
    defined(items.get(idx).and_then(|item| item.get(field))).cloned()
}

fn array_fallback(root: &Value, path: &[PathSegment]) -> Option<Value> {
    let items = visit(root, |_, node| match node {
        Value::Array(items) if !items.is_empty() => ControlFlow::Break(items),
        _ => ControlFlow::Continue(()),
    })?;
    let element = items.get(first_index(path))?;
    match element {
        Value::Object(map) => {
            let wanted = last_key(path).and_then(|(_, name)| defined(map.get(name)));
            wanted.or_else(|| id_like(map)).cloned()
        }
        Value::Null => None,
        scalar => Some(scalar.clone()),
    }
}

fn id_fallback(root: &Value) -> Option<Value> {
    find_field(root, "id").cloned()
}

/// Runs the structural strategies in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayeredSearch;

impl LayeredSearch {
    pub fn new() -> Self {
        Self
    }

    /// Locate `path` inside `result`. An empty path yields the whole
    /// (embedded-JSON-parsed) result.
    pub fn find(&self, result: &Value, path: &[PathSegment]) -> Option<SearchHit> {
        let parsed = parse_embedded(result);
        if path.is_empty() {
            return Some(SearchHit {
                value: parsed,
                strategy: SearchStrategy::WholeResult,
            });
        }

        let hit = |strategy, value: Option<Value>| value.map(|value| SearchHit { value, strategy });
        hit(
            SearchStrategy::DirectPath,
            defined(get_path(&parsed, path)).cloned(),
        )
        .or_else(|| hit(SearchStrategy::SmartField, smart_field(&parsed, path)))
        .or_else(|| {
            hit(
                SearchStrategy::PatternDiscovery,
                pattern_discovery(&parsed, path),
            )
        })
        .or_else(|| hit(SearchStrategy::ArrayFallback, array_fallback(&parsed, path)))
        .or_else(|| hit(SearchStrategy::IdFallback, id_fallback(&parsed)))
    }
}

/// `null`, `""`, `[]` and `{}` count as "no result".
pub fn is_empty_result(value: &Value) -> bool {
    match parse_embedded(value) {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parse_path;
    use serde_json::json;

    fn find(result: Value, path: &str) -> Option<SearchHit> {
        LayeredSearch::new().find(&result, &parse_path(path))
    }

    #[test]
    fn direct_path_on_array() {
        let hit = find(json!([{"id": "abc"}]), "[0].id").unwrap();
        assert_eq!(hit.value, json!("abc"));
        assert_eq!(hit.strategy, SearchStrategy::DirectPath);
    }

    #[test]
    fn embedded_json_is_parsed_first() {
        let result = json!({"output": "{\"items\": [{\"id\": 7}]}"});
        let hit = find(result, "output.items[0].id").unwrap();
        assert_eq!(hit.value, json!(7));
        assert_eq!(hit.strategy, SearchStrategy::DirectPath);
    }

    #[test]
    fn relaxed_quotes_are_accepted() {
        let result = json!("{'name': 'x', 'ok': True}");
        assert_eq!(find(result, "name").unwrap().value, json!("x"));
    }

    #[test]
    fn relaxed_parse_leaves_string_contents_alone() {
        let result = json!("{'company': 'None Ltd', 'motto': 'True grit', 'quote': 'say \"hi\"', 'active': False, 'owner': None}");
        assert_eq!(find(result.clone(), "company").unwrap().value, json!("None Ltd"));
        assert_eq!(find(result.clone(), "motto").unwrap().value, json!("True grit"));
        assert_eq!(find(result.clone(), "quote").unwrap().value, json!("say \"hi\""));
        assert_eq!(find(result, "active").unwrap().value, json!(false));
        assert_eq!(
            parse_embedded(&json!("[True, 'Falsehood', None]")),
            json!([true, "Falsehood", null])
        );
    }

    #[test]
    fn smart_field_finds_nested_name_with_index() {
        let result = json!({"data": {"payload": {"urls": ["a", "b"]}}});
        let hit = find(result, "urls[1]").unwrap();
        assert_eq!(hit.value, json!("b"));
        assert_eq!(hit.strategy, SearchStrategy::SmartField);
    }

    #[test]
    fn pattern_discovery_prefers_named_container() {
        let result = json!({
            "others": [{"title": "wrong"}],
            "repos": [{"title": "first"}, {"title": "second"}]
        });
        let hit = pattern_discovery(&result, &parse_path("repos.list[1].title")).unwrap();
        assert_eq!(hit, json!("second"));
    }

    #[test]
    fn array_fallback_uses_id_like_field() {
        let result = json!({"hits": [{"doc_id": "d1", "score": 1}]});
        let hit = find(result, "results[0].ref").unwrap();
        assert_eq!(hit.value, json!("d1"));
        assert_eq!(hit.strategy, SearchStrategy::ArrayFallback);
    }

    #[test]
    fn id_fallback_finds_any_id() {
        let result = json!({"meta": {"owner": {"id": 42}}});
        let hit = find(result, "missing.thing").unwrap();
        assert_eq!(hit.value, json!(42));
        assert_eq!(hit.strategy, SearchStrategy::IdFallback);
    }

    #[test]
    fn nothing_found_in_flat_scalars() {
        assert!(find(json!({"count": 3}), "missing").is_none());
    }

    #[test]
    fn whole_result_path_returns_parsed_value() {
        let hit = find(json!("[1,2,3]"), "").unwrap();
        assert_eq!(hit.value, json!([1, 2, 3]));
        assert_eq!(hit.strategy, SearchStrategy::WholeResult);
    }

    #[test]
    fn empty_results() {
        assert!(is_empty_result(&json!(null)));
        assert!(is_empty_result(&json!("")));
        assert!(is_empty_result(&json!([])));
        assert!(is_empty_result(&json!("[]")));
        assert!(is_empty_result(&json!({})));
        assert!(!is_empty_result(&json!(0)));
        assert!(!is_empty_result(&json!([null])));
    }
}
