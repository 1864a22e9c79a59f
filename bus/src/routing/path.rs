//! Dot-path resolution into the envelope
//!
//! Predicates and transforms address message content with dot-separated
//! paths. The first segment selects an envelope field (`topic`, `id`, `ts`,
//! `retain`, `data`, `headers`, `reply_to`, `correlation_id`); the rest
//! walks into `data` (objects by key, arrays by numeric index) or `headers`
//! (by key). Resolution is forgiving: any miss yields `None`, never an
//! error.

use serde_json::Value;
use vayla_core::Message;

/// Resolve `path` against a message, cloning the value found
pub(crate) fn resolve(message: &Message, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    let rest: Vec<&str> = segments.collect();

    match head {
        "topic" => leaf(Value::String(message.topic.clone()), &rest),
        "id" => leaf(message.id.clone().map(Value::String)?, &rest),
        "ts" => leaf(message.ts.map(Value::from)?, &rest),
        "retain" => leaf(Value::Bool(message.retain), &rest),
        "replyTo" | "reply_to" => leaf(message.reply_to.clone().map(Value::String)?, &rest),
        "correlationId" | "correlation_id" => {
            leaf(message.correlation_id.clone().map(Value::String)?, &rest)
        }
        "data" => walk(&message.data, &rest).cloned(),
        "headers" => match rest.as_slice() {
            [] => Some(
                message
                    .headers()
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect::<serde_json::Map<_, _>>()
                    .into(),
            ),
            [key] => message.header(key).map(|v| Value::String(v.to_string())),
            _ => None,
        },
        _ => None,
    }
}

fn leaf(value: Value, rest: &[&str]) -> Option<Value> {
    if rest.is_empty() { Some(value) } else { None }
}

/// Walk a JSON value by object keys and array indices
pub(crate) fn walk<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for seg in segments {
        current = match current {
            Value::Object(map) => map.get(*seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set `path` inside a JSON object tree, creating intermediate objects
///
/// Used by `pick`/`map` transforms to rebuild payloads. Array segments are
/// not created (a numeric segment into a non-array misses silently).
pub(crate) fn set(root: &mut Value, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };
    let mut current = root;
    for seg in parents {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else { return };
        current = map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(last.to_string(), value);
    }
}
