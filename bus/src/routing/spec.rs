//! Route specifications
//!
//! The JSON-shaped rule language, modeled as serde tagged unions: one enum
//! variant per predicate operator and per action type. Structure is checked
//! once at registration ([`RouteSpec::validate`]); evaluation-time failures
//! are limited to things only a concrete message can reveal.
//!
//! ```json
//! {
//!   "name": "high-temp-alert",
//!   "match": {
//!     "topic": "sensor.temp",
//!     "where": { "op": "gt", "path": "data.value", "value": 30 }
//!   },
//!   "actions": [
//!     { "type": "EMIT", "message": { "topic": "alert.highTemp" }, "inherit": ["data"] }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vayla_core::{topic, BusError};

fn default_true() -> bool {
    true
}

/// One pattern, or a list of alternatives (any-of)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    /// A single value
    One(String),
    /// Any of several values
    Many(Vec<String>),
}

impl OneOrMany {
    /// Iterate the alternative values
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        let slice = match self {
            OneOrMany::One(s) => std::slice::from_ref(s),
            OneOrMany::Many(v) => v.as_slice(),
        };
        slice.iter().map(String::as_str)
    }
}

/// Predicate tree evaluated against a message
///
/// Leaf operators take a dot-separated `path` into the envelope (`topic`,
/// `data.value`, `headers.source`, ...) and a comparison `value`. Missing
/// paths make a leaf false - except `neq`, which is true on a missing path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Predicate {
    /// Equality (numbers compare numerically across int/float)
    Eq {
        /// Dot path into the envelope
        path: String,
        /// Expected value
        value: Value,
    },
    /// Negated equality; true when the path is missing
    Neq {
        /// Dot path into the envelope
        path: String,
        /// Compared value
        value: Value,
    },
    /// Numeric greater-than
    Gt {
        /// Dot path into the envelope
        path: String,
        /// Numeric bound
        value: Value,
    },
    /// Numeric greater-or-equal
    Gte {
        /// Dot path into the envelope
        path: String,
        /// Numeric bound
        value: Value,
    },
    /// Numeric less-than
    Lt {
        /// Dot path into the envelope
        path: String,
        /// Numeric bound
        value: Value,
    },
    /// Numeric less-or-equal
    Lte {
        /// Dot path into the envelope
        path: String,
        /// Numeric bound
        value: Value,
    },
    /// Membership in an array of alternatives
    In {
        /// Dot path into the envelope
        path: String,
        /// Array of accepted values
        value: Value,
    },
    /// Regular-expression match over a string value
    Regex {
        /// Dot path into the envelope
        path: String,
        /// Regex pattern (validated at route registration)
        value: String,
    },
    /// All children must hold (empty = true)
    And {
        /// Child predicates
        children: Vec<Predicate>,
    },
    /// At least one child must hold (empty = false)
    Or {
        /// Child predicates
        children: Vec<Predicate>,
    },
    /// Child must not hold
    Not {
        /// Negated predicate
        child: Box<Predicate>,
    },
}

/// Match section of a route; absent fields are always-true
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSpec {
    /// Topic equality or wildcard pattern(s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<OneOrMany>,
    /// Alias for `topic` kept for rule authors thinking in event types
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<OneOrMany>,
    /// Equality against the `source` header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// At least one of these tags present in the `tags` header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags_any: Option<Vec<String>>,
    /// All of these tags present in the `tags` header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags_all: Option<Vec<String>>,
    /// Predicate tree over envelope paths
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Predicate>,
}

/// Transform applied to a matched message before its actions run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransformSpec {
    /// Pass the message through unchanged
    Identity,
    /// Keep only the listed dot-paths of the payload/headers
    ///
    /// Envelope identity (topic, id, ts, retain, reply fields) is preserved;
    /// `data` and `headers` are rebuilt from the picked paths alone.
    Pick {
        /// Paths to keep, e.g. `["data.value", "headers.source"]`
        paths: Vec<String>,
    },
    /// Apply a registered function to the value at one path
    Map {
        /// Path whose value is replaced
        path: String,
        /// Registered transform id
        #[serde(rename = "fn")]
        fn_id: String,
    },
    /// Apply a registered function to the whole envelope
    Custom {
        /// Registered transform id
        #[serde(rename = "fn")]
        fn_id: String,
    },
}

/// Log severity for LOG actions, mapped onto `tracing` levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `tracing::trace!`
    Trace,
    /// `tracing::debug!`
    Debug,
    /// `tracing::info!` (default)
    #[default]
    Info,
    /// `tracing::warn!`
    Warn,
    /// `tracing::error!`
    Error,
}

/// One side-effecting action of a matched route
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ActionSpec {
    /// Publish a new message built from a literal template
    Emit {
        /// Envelope template; must carry at least a valid `topic`
        message: Value,
        /// Envelope fields merged in from the source message
        /// (e.g. `["data", "headers"]`); template values win on conflict
        #[serde(default)]
        inherit: Vec<String>,
    },
    /// Re-publish the (possibly transformed) message under another topic
    Forward {
        /// New topic
        topic: String,
        /// Optional override written to the `type` header
        #[serde(default, rename = "messageType", skip_serializing_if = "Option::is_none")]
        type_override: Option<String>,
    },
    /// Render a template and log it at the given severity
    Log {
        /// Template with `{{dot.path}}` placeholders
        template: String,
        /// Severity (default `info`)
        #[serde(default)]
        level: LogLevel,
    },
    /// Invoke a registered handler with the message
    Call {
        /// Registered handler id
        handler: String,
    },
}

/// A route definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Human-readable route name (required, non-empty)
    pub name: String,
    /// Whether the route participates in evaluation
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Evaluation order; lower runs first, ties break by insertion
    #[serde(default)]
    pub order: i64,
    /// Match section (required; `{}` matches everything)
    #[serde(rename = "match")]
    pub match_spec: MatchSpec,
    /// Optional transform applied before the actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformSpec>,
    /// Actions executed in array order (required, non-empty)
    pub actions: Vec<ActionSpec>,
}

impl RouteSpec {
    /// Start a route definition with a match-everything spec
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            order: 0,
            match_spec: MatchSpec::default(),
            transform: None,
            actions: Vec::new(),
        }
    }

    /// Set the evaluation order
    pub fn order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    /// Create the route disabled
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Set the match section
    pub fn match_spec(mut self, spec: MatchSpec) -> Self {
        self.match_spec = spec;
        self
    }

    /// Set the transform
    pub fn transform(mut self, transform: TransformSpec) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Append an action
    pub fn action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    /// Check the structural rules the engine enforces at registration
    pub fn validate(&self) -> Result<(), BusError> {
        if self.name.trim().is_empty() {
            return Err(BusError::RouteInvalid("route name must not be empty".into()));
        }
        if self.actions.is_empty() {
            return Err(BusError::RouteInvalid(format!(
                "route '{}' has no actions",
                self.name
            )));
        }
        if let Some(pred) = &self.match_spec.where_clause {
            validate_predicate(pred).map_err(|cause| {
                BusError::RouteInvalid(format!("route '{}': {cause}", self.name))
            })?;
        }
        if let Some(transform) = &self.transform {
            validate_transform(transform).map_err(|cause| {
                BusError::RouteInvalid(format!("route '{}': {cause}", self.name))
            })?;
        }
        for action in &self.actions {
            validate_action(action).map_err(|cause| {
                BusError::RouteInvalid(format!("route '{}': {cause}", self.name))
            })?;
        }
        Ok(())
    }
}

fn validate_predicate(pred: &Predicate) -> Result<(), String> {
    match pred {
        Predicate::Regex { value, .. } => {
            regex::Regex::new(value).map_err(|e| format!("invalid regex '{value}': {e}"))?;
            Ok(())
        }
        Predicate::In { value, .. } => {
            if value.is_array() {
                Ok(())
            } else {
                Err("'in' requires an array value".into())
            }
        }
        Predicate::Gt { value, .. }
        | Predicate::Gte { value, .. }
        | Predicate::Lt { value, .. }
        | Predicate::Lte { value, .. } => {
            if value.is_number() {
                Ok(())
            } else {
                Err("ordering comparison requires a numeric value".into())
            }
        }
        Predicate::And { children } | Predicate::Or { children } => {
            children.iter().try_for_each(validate_predicate)
        }
        Predicate::Not { child } => validate_predicate(child),
        Predicate::Eq { .. } | Predicate::Neq { .. } => Ok(()),
    }
}

fn validate_transform(transform: &TransformSpec) -> Result<(), String> {
    match transform {
        TransformSpec::Identity => Ok(()),
        TransformSpec::Pick { paths } => {
            if paths.is_empty() {
                Err("'pick' requires at least one path".into())
            } else {
                Ok(())
            }
        }
        TransformSpec::Map { path, fn_id } => {
            if path.is_empty() || fn_id.is_empty() {
                Err("'map' requires a path and a fn id".into())
            } else {
                Ok(())
            }
        }
        TransformSpec::Custom { fn_id } => {
            if fn_id.is_empty() {
                Err("'custom' requires a fn id".into())
            } else {
                Ok(())
            }
        }
    }
}

fn validate_action(action: &ActionSpec) -> Result<(), String> {
    match action {
        ActionSpec::Emit { message, .. } => {
            let topic_ok = message
                .get("topic")
                .and_then(Value::as_str)
                .is_some_and(topic::is_valid_topic);
            if topic_ok {
                Ok(())
            } else {
                Err("EMIT template needs a valid 'topic'".into())
            }
        }
        ActionSpec::Forward { topic: t, .. } => {
            if topic::is_valid_topic(t) {
                Ok(())
            } else {
                Err(format!("FORWARD topic '{t}' is invalid"))
            }
        }
        ActionSpec::Log { template, .. } => {
            if template.is_empty() {
                Err("LOG requires a template".into())
            } else {
                Ok(())
            }
        }
        ActionSpec::Call { handler } => {
            if handler.is_empty() {
                Err("CALL requires a handler id".into())
            } else {
                Ok(())
            }
        }
    }
}

/// Partial update applied by `update`; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePatch {
    /// New name
    pub name: Option<String>,
    /// New enabled flag
    pub enabled: Option<bool>,
    /// New evaluation order
    pub order: Option<i64>,
    /// New match section
    #[serde(rename = "match")]
    pub match_spec: Option<MatchSpec>,
    /// New transform (replace only; use `identity` to neutralize)
    pub transform: Option<TransformSpec>,
    /// New action list
    pub actions: Option<Vec<ActionSpec>>,
}

impl RoutePatch {
    pub(crate) fn apply(self, spec: &mut RouteSpec) {
        if let Some(name) = self.name {
            spec.name = name;
        }
        if let Some(enabled) = self.enabled {
            spec.enabled = enabled;
        }
        if let Some(order) = self.order {
            spec.order = order;
        }
        if let Some(match_spec) = self.match_spec {
            spec.match_spec = match_spec;
        }
        if let Some(transform) = self.transform {
            spec.transform = Some(transform);
        }
        if let Some(actions) = self.actions {
            spec.actions = actions;
        }
    }
}

/// Stored route snapshot returned by the CRUD surface
#[derive(Debug, Clone)]
pub struct Route {
    /// Generated route id
    pub id: String,
    /// The definition as currently stored
    pub spec: RouteSpec,
    /// Times this route was evaluated against a message
    pub evaluated: u64,
    /// Times the match section held
    pub matched: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn route_spec_deserializes_from_json() {
        let spec: RouteSpec = serde_json::from_value(json!({
            "name": "high-temp",
            "match": {
                "topic": "sensor.temp",
                "where": { "op": "gt", "path": "data.value", "value": 30 }
            },
            "actions": [
                { "type": "EMIT", "message": { "topic": "alert.highTemp" } }
            ]
        }))
        .unwrap();

        assert_eq!(spec.name, "high-temp");
        assert!(spec.enabled);
        assert_eq!(spec.order, 0);
        assert!(matches!(
            spec.match_spec.where_clause,
            Some(Predicate::Gt { .. })
        ));
        assert_eq!(spec.actions.len(), 1);
        spec.validate().unwrap();
    }

    #[test]
    fn missing_match_section_is_a_deser_error() {
        let result: Result<RouteSpec, _> = serde_json::from_value(json!({
            "name": "r",
            "actions": [{ "type": "LOG", "template": "x" }]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn one_or_many_accepts_both_shapes() {
        let m: MatchSpec =
            serde_json::from_value(json!({ "topic": ["a.b", "c.d"], "type": "e.f" })).unwrap();
        let topics: Vec<&str> = m.topic.as_ref().unwrap().iter().collect();
        assert_eq!(topics, vec!["a.b", "c.d"]);
        let types: Vec<&str> = m.message_type.as_ref().unwrap().iter().collect();
        assert_eq!(types, vec!["e.f"]);
    }

    #[test]
    fn predicate_combinators_deserialize() {
        let p: Predicate = serde_json::from_value(json!({
            "op": "and",
            "children": [
                { "op": "eq", "path": "topic", "value": "a.b" },
                { "op": "not", "child": { "op": "in", "path": "data.kind", "value": ["x", "y"] } }
            ]
        }))
        .unwrap();
        assert!(matches!(p, Predicate::And { ref children } if children.len() == 2));
    }

    #[test]
    fn action_tags_are_uppercase() {
        let a: ActionSpec =
            serde_json::from_value(json!({ "type": "FORWARD", "topic": "audit.log" })).unwrap();
        assert!(matches!(a, ActionSpec::Forward { .. }));

        let text = serde_json::to_string(&a).unwrap();
        assert!(text.contains(r#""type":"FORWARD""#));
    }

    #[test]
    fn validation_rejects_structural_problems() {
        let no_name = RouteSpec::new("  ").action(ActionSpec::Log {
            template: "t".into(),
            level: LogLevel::Info,
        });
        assert_eq!(no_name.validate().unwrap_err().code(), "ROUTE_INVALID");

        let no_actions = RouteSpec::new("r");
        assert_eq!(no_actions.validate().unwrap_err().code(), "ROUTE_INVALID");

        let bad_regex = RouteSpec::new("r")
            .match_spec(MatchSpec {
                where_clause: Some(Predicate::Regex {
                    path: "topic".into(),
                    value: "(unclosed".into(),
                }),
                ..Default::default()
            })
            .action(ActionSpec::Log {
                template: "t".into(),
                level: LogLevel::Info,
            });
        assert_eq!(bad_regex.validate().unwrap_err().code(), "ROUTE_INVALID");

        let bad_emit = RouteSpec::new("r").action(ActionSpec::Emit {
            message: json!({ "data": 1 }),
            inherit: vec![],
        });
        assert_eq!(bad_emit.validate().unwrap_err().code(), "ROUTE_INVALID");

        let bad_in = RouteSpec::new("r")
            .match_spec(MatchSpec {
                where_clause: Some(Predicate::In {
                    path: "data.k".into(),
                    value: json!("not-an-array"),
                }),
                ..Default::default()
            })
            .action(ActionSpec::Log {
                template: "t".into(),
                level: LogLevel::Info,
            });
        assert_eq!(bad_in.validate().unwrap_err().code(), "ROUTE_INVALID");
    }

    #[test]
    fn patch_applies_only_present_fields() {
        let mut spec = RouteSpec::new("old").order(5).action(ActionSpec::Log {
            template: "t".into(),
            level: LogLevel::Info,
        });
        RoutePatch {
            name: Some("new".into()),
            order: Some(10),
            ..Default::default()
        }
        .apply(&mut spec);

        assert_eq!(spec.name, "new");
        assert_eq!(spec.order, 10);
        assert!(spec.enabled);
        assert_eq!(spec.actions.len(), 1);
    }

    #[test]
    fn log_level_defaults_to_info() {
        let a: ActionSpec =
            serde_json::from_value(json!({ "type": "LOG", "template": "hi" })).unwrap();
        assert!(matches!(
            a,
            ActionSpec::Log { level: LogLevel::Info, .. }
        ));
    }
}
