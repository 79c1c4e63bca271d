use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static NON_WORD_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_]+").expect("static pattern"));
static SEPARATOR_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_{2,}").expect("static pattern"));

/// Lowercases `name` and collapses every run of non-word characters into a
/// single `_`.
pub fn build_id(name: &str) -> String {
    let lower = name.to_lowercase();
    let replaced = NON_WORD_RUN.replace_all(&lower, "_");
    SEPARATOR_RUN.replace_all(&replaced, "_").into_owned()
}

/// Display name plus the dotted id path of a check in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckIdentity {
    pub name: String,
    pub id: String,
}

impl CheckIdentity {
    /// Builds the identity of `name` nested under `parent_id` (if any).
    pub fn new(name: &str, parent_id: Option<&str>) -> Self {
        let slug = build_id(name);
        let id = match parent_id {
            Some(parent) if !parent.is_empty() => format!("{}.{}", parent, slug),
            _ => slug,
        };
        Self { name: name.to_string(), id }
    }

    /// Nesting depth: 0 for top-level checks.
    pub fn depth(&self) -> usize {
        self.id.matches('.').count()
    }
}

impl fmt::Display for CheckIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// A single observation handed to the sinks. `reason` is empty when `ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    #[serde(flatten)]
    pub identity: CheckIdentity,
    pub timestamp: DateTime<Utc>,
    pub ok: bool,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_id_matches_known_slugs() {
        assert_eq!(build_id("example.com"), "example_com");
        assert_eq!(
            build_id("Some WeIrD 12345//- stuff.whatever"),
            "some_weird_12345_stuff_whatever"
        );
    }

    #[test]
    fn build_id_collapses_existing_underscores() {
        assert_eq!(build_id("a__b"), "a_b");
        assert_eq!(build_id("a_-_b"), "a_b");
    }

    #[test]
    fn build_id_is_deterministic() {
        assert_eq!(build_id("Mail Relay #2"), build_id("Mail Relay #2"));
    }

    #[test]
    fn nested_identity_is_prefixed_by_parent() {
        let parent = CheckIdentity::new("Web", None);
        let child = CheckIdentity::new("Front End", Some(&parent.id));
        assert_eq!(parent.id, "web");
        assert_eq!(child.id, "web.front_end");
        assert_eq!(child.name, "Front End");
        assert_eq!(parent.depth(), 0);
        assert_eq!(child.depth(), 1);
    }

    #[test]
    fn event_serializes_flat() {
        let event = StateEvent {
            identity: CheckIdentity::new("mail", None),
            timestamp: Utc::now(),
            ok: false,
            reason: "refused".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["id"], "mail");
        assert_eq!(value["name"], "mail");
        assert_eq!(value["ok"], false);
        assert_eq!(value["reason"], "refused");
    }
}
