//! Action helpers
//!
//! The pure halves of action execution: building an EMIT envelope from its
//! template, rendering LOG templates, and dispatching onto `tracing`
//! levels. The side-effecting orchestration (publishing, handler spawning)
//! lives in the engine, which owns the bus reference.

use super::path;
use super::spec::LogLevel;
use serde_json::Value;
use vayla_core::Message;

/// Build the message an EMIT action publishes
///
/// The template deserializes as an envelope (it was validated to carry a
/// topic at registration). `inherit` then merges the named envelope fields
/// in from the source message - object fields shallow-merge with template
/// values winning, anything else is copied only where the template is
/// silent.
pub(crate) fn build_emit(
    template: &Value,
    inherit: &[String],
    source: &Message,
) -> Result<Message, String> {
    let mut message: Message = serde_json::from_value(template.clone())
        .map_err(|e| format!("EMIT template is not a valid envelope: {e}"))?;

    for field in inherit {
        match field.as_str() {
            "data" => match (&mut message.data, &source.data) {
                (Value::Object(dst), Value::Object(src)) => {
                    for (k, v) in src {
                        dst.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
                (dst @ Value::Null, src) => *dst = src.clone(),
                _ => {}
            },
            "headers" => {
                if !source.headers().is_empty() {
                    let dst = message.headers_mut();
                    for (k, v) in source.headers() {
                        dst.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }
            "correlation_id" => {
                if message.correlation_id.is_none() {
                    message.correlation_id = source.correlation_id.clone();
                }
            }
            "reply_to" => {
                if message.reply_to.is_none() {
                    message.reply_to = source.reply_to.clone();
                }
            }
            unknown => return Err(format!("EMIT cannot inherit unknown field '{unknown}'")),
        }
    }

    // emitted messages are new: never reuse the source identity
    message.id = None;
    message.ts = None;
    Ok(message)
}

/// Render `{{dot.path}}` placeholders from the message
///
/// Strings substitute raw; other values substitute as JSON; missing paths
/// render as an empty string.
pub(crate) fn render_template(template: &str, message: &Message) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            // unclosed placeholder: emit literally
            out.push_str(&rest[open..]);
            return out;
        };
        let key = after[..close].trim();
        match path::resolve(message, key) {
            Some(Value::String(s)) => out.push_str(&s),
            Some(value) => out.push_str(&value.to_string()),
            None => {}
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

/// Log a rendered LOG action at its configured severity
pub(crate) fn emit_log(level: LogLevel, route: &str, rendered: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(target: "vayla::route", route, "{rendered}"),
        LogLevel::Debug => tracing::debug!(target: "vayla::route", route, "{rendered}"),
        LogLevel::Info => tracing::info!(target: "vayla::route", route, "{rendered}"),
        LogLevel::Warn => tracing::warn!(target: "vayla::route", route, "{rendered}"),
        LogLevel::Error => tracing::error!(target: "vayla::route", route, "{rendered}"),
    }
}
