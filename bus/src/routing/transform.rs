//! Transform pipeline
//!
//! A matched route may reshape the message before its actions run. Three of
//! the four transforms are interpreted (`identity`, `pick`, `map`); `map`
//! and `custom` additionally reach into the registered-function table -
//! string id to function - populated via `register_transform`. A missing id
//! is a loud `TRANSFORM_NOT_FOUND`, never a silent skip.

use super::path;
use super::spec::TransformSpec;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use vayla_core::{HandlerError, Message};

/// Registered transform function
///
/// For `map`, receives the value at the configured path and returns its
/// replacement. For `custom`, receives the whole envelope as a JSON value
/// and must return a complete envelope.
pub type TransformFn = Arc<dyn Fn(&Value) -> Result<Value, HandlerError> + Send + Sync>;

#[derive(Default)]
pub(crate) struct TransformRegistry {
    table: RwLock<HashMap<String, TransformFn>>,
}

/// Why a transform did not produce a message
pub(crate) enum TransformFailure {
    NotFound(String),
    Failed(String),
}

impl TransformRegistry {
    pub fn register(&self, id: impl Into<String>, f: TransformFn) {
        self.table.write().insert(id.into(), f);
    }

    fn get(&self, id: &str) -> Option<TransformFn> {
        self.table.read().get(id).map(Arc::clone)
    }

    /// Apply `spec` to `message`, producing the message the actions see
    pub fn apply(
        &self,
        spec: &TransformSpec,
        message: &Message,
    ) -> Result<Message, TransformFailure> {
        match spec {
            TransformSpec::Identity => Ok(message.clone()),

            TransformSpec::Pick { paths } => {
                let mut picked = Message::new(message.topic.clone(), Value::Null);
                picked.id = message.id.clone();
                picked.ts = message.ts;
                picked.retain = message.retain;
                picked.reply_to = message.reply_to.clone();
                picked.correlation_id = message.correlation_id.clone();

                for p in paths {
                    let Some(value) = path::resolve(message, p) else {
                        continue;
                    };
                    let segments: Vec<&str> = p.split('.').collect();
                    match segments.as_slice() {
                        ["data", rest @ ..] if !rest.is_empty() => {
                            if !picked.data.is_object() {
                                picked.data = Value::Object(serde_json::Map::new());
                            }
                            path::set(&mut picked.data, rest, value);
                        }
                        ["data"] => picked.data = value,
                        ["headers", key] => {
                            if let Value::String(s) = value {
                                picked.headers_mut().insert((*key).to_string(), s);
                            }
                        }
                        // envelope identity fields are always carried
                        _ => {}
                    }
                }
                Ok(picked)
            }

            TransformSpec::Map { path: p, fn_id } => {
                let f = self
                    .get(fn_id)
                    .ok_or_else(|| TransformFailure::NotFound(fn_id.clone()))?;
                let Some(value) = path::resolve(message, p) else {
                    return Err(TransformFailure::Failed(format!(
                        "map path '{p}' not present in message"
                    )));
                };
                let mapped = f(&value).map_err(|e| TransformFailure::Failed(e.to_string()))?;

                let mut out = message.clone();
                let segments: Vec<&str> = p.split('.').collect();
                match segments.as_slice() {
                    ["data", rest @ ..] if !rest.is_empty() => {
                        path::set(&mut out.data, rest, mapped)
                    }
                    ["data"] => out.data = mapped,
                    ["headers", key] => {
                        if let Value::String(s) = mapped {
                            out.headers_mut().insert((*key).to_string(), s);
                        } else {
                            return Err(TransformFailure::Failed(format!(
                                "map over header '{key}' must return a string"
                            )));
                        }
                    }
                    _ => {
                        return Err(TransformFailure::Failed(format!(
                            "map path '{p}' is not writable"
                        )))
                    }
                }
                Ok(out)
            }

            TransformSpec::Custom { fn_id } => {
                let f = self
                    .get(fn_id)
                    .ok_or_else(|| TransformFailure::NotFound(fn_id.clone()))?;
                let envelope = serde_json::to_value(message)
                    .map_err(|e| TransformFailure::Failed(e.to_string()))?;
                let replaced = f(&envelope).map_err(|e| TransformFailure::Failed(e.to_string()))?;
                serde_json::from_value::<Message>(replaced).map_err(|e| {
                    TransformFailure::Failed(format!("custom transform returned invalid envelope: {e}"))
                })
            }
        }
    }
}
