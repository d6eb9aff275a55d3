//! Variable scopes for task execution.
//!
//! Every (host, loop item) unit of work evaluates conditions and renders
//! arguments against its own [`VariableScope`]. A scope is a stack of
//! immutable, reference-counted layers: global vars at the bottom, then
//! host vars, registered results, and finally the loop binding. Adding a
//! layer never touches the layers underneath, so concurrent workers can
//! share the lower layers without locking.

mod scope;

pub use scope::{ScopeLevel, VariableScope};

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

/// A flat mapping of variable names to values.
pub type VarMap = IndexMap<String, JsonValue>;

/// One step of a variable path such as `config.database.hosts[0]`.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    /// Mapping key (`.name` or `['name']`)
    Key(String),
    /// Sequence index (`[0]`, `.0`); negative values count from the end
    Index(i64),
}

/// Walk `segments` starting at `root`.
///
/// Returns `None` as soon as a step does not exist, which callers treat as
/// "undefined".
pub fn resolve_segments<'a>(root: &'a JsonValue, segments: &[PathSegment]) -> Option<&'a JsonValue> {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Key(key), JsonValue::Object(map)) => map.get(key)?,
            (PathSegment::Key(key), JsonValue::Array(items)) => {
                let idx: i64 = key.parse().ok()?;
                index_array(items, idx)?
            }
            (PathSegment::Index(idx), JsonValue::Array(items)) => index_array(items, *idx)?,
            (PathSegment::Index(idx), JsonValue::Object(map)) => map.get(&idx.to_string())?,
            _ => return None,
        };
    }
    Some(current)
}

fn index_array(items: &[JsonValue], idx: i64) -> Option<&JsonValue> {
    let len = i64::try_from(items.len()).ok()?;
    let idx = if idx < 0 { len + idx } else { idx };
    if idx < 0 {
        return None;
    }
    items.get(usize::try_from(idx).ok()?)
}

/// Parse a plain variable path (`a.b[0]['c']`) into its root name and segments.
///
/// Returns `None` for anything that is not a pure path, e.g. an expression
/// with operators or filters.
pub fn parse_path(path: &str) -> Option<(String, Vec<PathSegment>)> {
    let path = path.trim();
    let mut chars = path.char_indices().peekable();
    let mut root = String::new();

    while let Some(&(_, c)) = chars.peek() {
        if c.is_alphanumeric() || c == '_' {
            root.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if root.is_empty() || root.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return None;
    }

    let mut segments = Vec::new();
    while let Some((_, c)) = chars.next() {
        match c {
            '.' => {
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return None;
                }
                match name.parse::<i64>() {
                    Ok(idx) => segments.push(PathSegment::Index(idx)),
                    Err(_) => segments.push(PathSegment::Key(name)),
                }
            }
            '[' => {
                let mut inner = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return None;
                }
                let inner = inner.trim();
                if let Some(key) = strip_quotes(inner) {
                    segments.push(PathSegment::Key(key.to_string()));
                } else {
                    segments.push(PathSegment::Index(inner.parse().ok()?));
                }
            }
            _ => return None,
        }
    }

    Some((root, segments))
}

fn strip_quotes(s: &str) -> Option<&str> {
    if s.len() >= 2
        && ((s.starts_with('\'') && s.ends_with('\'')) || (s.starts_with('"') && s.ends_with('"')))
    {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

/// Truthiness as Jinja2 sees it.
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}
