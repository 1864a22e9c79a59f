//! Topic validation and dotted wildcard matching
//!
//! Topics are dot-segmented names (`user.login`, `sensor.kitchen.temp`).
//! Subscription patterns may replace whole segments with `*`, each matching
//! exactly one non-empty segment, so `a.*.c` matches `a.b.c` but not
//! `a.b.b.c`.
//!
//! The single-character pattern `"*"` is special: it matches every topic
//! regardless of segment count. This asymmetry with per-segment wildcards
//! is deliberate and load-bearing - subscribers rely on `"*"` as a firehose
//! tap, and the bus can refuse it independently via configuration.
//!
//! All functions here are pure: no state, no errors. A malformed pattern
//! simply never matches.

/// Test whether `topic` matches a subscription `pattern`
///
/// # Example
///
/// ```
/// use vayla_core::topic::matches;
///
/// assert!(matches("user.login", "user.login"));
/// assert!(matches("user.login", "user.*"));
/// assert!(matches("user.login", "*"));
/// assert!(!matches("user.login.failed", "user.*"));
/// ```
pub fn matches(topic: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern == topic {
        return true;
    }
    if !pattern.contains('*') {
        return false;
    }

    let mut topic_segs = topic.split('.');
    let mut pattern_segs = pattern.split('.');
    loop {
        match (topic_segs.next(), pattern_segs.next()) {
            (Some(t), Some("*")) => {
                // one wildcard consumes exactly one non-empty segment
                if t.is_empty() {
                    return false;
                }
            }
            (Some(t), Some(p)) => {
                if t != p {
                    return false;
                }
            }
            (None, None) => return true,
            // segment counts differ
            _ => return false,
        }
    }
}

/// Test whether `topic` is a valid publishable topic
///
/// Valid topics are non-empty, contain only `[A-Za-z0-9_.]`, and have no
/// empty segments (no leading/trailing/double dots).
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
        && topic.split('.').all(|seg| !seg.is_empty())
}

/// Test whether `pattern` is a valid subscription pattern
///
/// A valid pattern is the global wildcard `"*"`, a valid topic, or a
/// topic-shaped string whose segments are names or single `*`.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    !pattern.is_empty()
        && pattern.split('.').all(|seg| {
            seg == "*"
                || (!seg.is_empty()
                    && seg
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'_'))
        })
}
