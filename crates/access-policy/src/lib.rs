//! Hierarchical action/resource grants used to authorize calls into the function control plane.
//!
//! Actions are colon-delimited (`function:get`) and a `*` segment in a grant matches any
//! remainder. Resources are slash-delimited paths compared as segment prefixes after
//! normalization to a single trailing slash, so a grant on `/account/A/` covers everything
//! below it while a grant on a deeper path never covers its parent.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const ACTION_SEPARATOR: char = ':';
pub const RESOURCE_SEPARATOR: char = '/';
pub const WILDCARD: &str = "*";

/// A single `(action, resource)` grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub action: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessEntryError {
    #[error("access entry is missing an action")]
    MissingAction,
    #[error("access entry is missing a resource")]
    MissingResource,
}

impl AccessEntry {
    #[must_use]
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
        }
    }

    pub fn validate(&self) -> Result<(), AccessEntryError> {
        if self.action.trim().is_empty() {
            return Err(AccessEntryError::MissingAction);
        }
        if self.resource.trim().is_empty() {
            return Err(AccessEntryError::MissingResource);
        }
        Ok(())
    }

    /// Whether this grant covers `action` on `resource`.
    #[must_use]
    pub fn authorizes(&self, action: &str, resource: &str) -> bool {
        ActionPattern::parse(&self.action).matches(action)
            && ResourcePath::parse(&self.resource).is_prefix_of(&ResourcePath::parse(resource))
    }
}

/// The `allow` list carried by an agent or an inline permission claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrants {
    #[serde(default)]
    pub allow: Vec<AccessEntry>,
}

impl AccessGrants {
    #[must_use]
    pub fn new(allow: Vec<AccessEntry>) -> Self {
        Self { allow }
    }

    /// Returns the first entry, in declaration order, that authorizes the request.
    #[must_use]
    pub fn first_authorizing(&self, action: &str, resource: &str) -> Option<&AccessEntry> {
        let requested = ResourcePath::parse(resource);
        self.allow.iter().find(|entry| {
            ActionPattern::parse(&entry.action).matches(action)
                && ResourcePath::parse(&entry.resource).is_prefix_of(&requested)
        })
    }

    #[must_use]
    pub fn is_authorized(&self, action: &str, resource: &str) -> bool {
        self.first_authorizing(action, resource).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ActionSegment {
    Any,
    Literal(String),
}

/// A parsed grant action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPattern {
    raw: String,
    segments: Vec<ActionSegment>,
}

impl ActionPattern {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let segments = raw
            .split(ACTION_SEPARATOR)
            .map(|segment| {
                if segment == WILDCARD {
                    ActionSegment::Any
                } else {
                    ActionSegment::Literal(segment.to_string())
                }
            })
            .collect();
        Self {
            raw: raw.to_string(),
            segments,
        }
    }

    /// Compares left to right: a `*` grant segment accepts the rest, a differing or empty
    /// literal rejects, and running out of grant segments before a `*` rejects.
    #[must_use]
    pub fn matches(&self, requested: &str) -> bool {
        if self.raw == requested {
            return true;
        }
        for (index, requested_segment) in requested.split(ACTION_SEPARATOR).enumerate() {
            match self.segments.get(index) {
                Some(ActionSegment::Any) => return true,
                Some(ActionSegment::Literal(granted))
                    if !granted.is_empty() && granted == requested_segment => {}
                _ => return false,
            }
        }
        false
    }
}

/// A resource path split into segments after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let normalized = normalize_resource(raw);
        let body = normalized
            .strip_suffix(RESOURCE_SEPARATOR)
            .unwrap_or(normalized.as_str());
        Self {
            segments: body.split(RESOURCE_SEPARATOR).map(str::to_string).collect(),
        }
    }

    #[must_use]
    pub fn is_prefix_of(&self, other: &ResourcePath) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(granted, requested)| granted == requested)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.segments.join("/"), RESOURCE_SEPARATOR)
    }
}

/// Trims surrounding whitespace and collapses any trailing slashes into exactly one.
#[must_use]
pub fn normalize_resource(resource: &str) -> String {
    let trimmed = resource.trim().trim_end_matches(RESOURCE_SEPARATOR);
    format!("{trimmed}{RESOURCE_SEPARATOR}")
}

#[cfg(test)]
mod tests {
    use super::{AccessEntry, AccessEntryError, AccessGrants, ActionPattern, normalize_resource};

    fn grants(entries: &[(&str, &str)]) -> AccessGrants {
        AccessGrants::new(
            entries
                .iter()
                .map(|(action, resource)| AccessEntry::new(*action, *resource))
                .collect(),
        )
    }

    #[test]
    fn wildcard_action_on_account_covers_nested_resources() {
        let grants = grants(&[("function:*", "/account/acc1/")]);
        assert!(grants.is_authorized("function:get", "/account/acc1/subscription/sub1/"));
        assert!(grants.is_authorized("function:put", "/account/acc1/"));
        assert!(!grants.is_authorized("storage:get", "/account/acc1/"));
    }

    #[test]
    fn deeper_grant_never_covers_parent_resource() {
        let grants = grants(&[("function:get", "/account/acc1/subscription/sub1/")]);
        assert!(!grants.is_authorized("function:get", "/account/acc1/"));
        assert!(grants.is_authorized(
            "function:get",
            "/account/acc1/subscription/sub1/boundary/b1/"
        ));
    }

    #[test]
    fn root_grant_checks_action_exactly() {
        let grants = grants(&[("function:get", "/")]);
        assert!(!grants.is_authorized("function:put", "/"));
        assert!(grants.is_authorized("function:get", "/account/a1/"));
    }

    #[test]
    fn sibling_resource_with_shared_prefix_is_denied() {
        let grants = grants(&[("*", "/account/acc1/")]);
        assert!(!grants.is_authorized("function:get", "/account/acc10/"));
        assert!(grants.is_authorized("function:get", "/account/acc1"));
    }

    #[test]
    fn action_segments_compare_left_to_right() {
        assert!(ActionPattern::parse("*").matches("function:get"));
        assert!(ActionPattern::parse("function:get").matches("function:get"));
        assert!(!ActionPattern::parse("function").matches("function:get"));
        assert!(!ActionPattern::parse("function:get:logs").matches("function:get"));
        assert!(ActionPattern::parse("function:*:x").matches("function:get"));
        assert!(!ActionPattern::parse("function:").matches("function:get"));
        assert!(!ActionPattern::parse("function:put").matches("function:get"));
    }

    #[test]
    fn resources_normalize_to_single_trailing_slash() {
        assert_eq!(normalize_resource("/account/a1"), "/account/a1/");
        assert_eq!(normalize_resource("/account/a1///"), "/account/a1/");
        assert_eq!(normalize_resource(" / "), "/");
        assert_eq!(normalize_resource(""), "/");
    }

    #[test]
    fn first_matching_entry_wins() {
        let grants = grants(&[
            ("function:get", "/account/a1/"),
            ("function:*", "/"),
        ]);
        let entry = grants.first_authorizing("function:get", "/account/a1/subscription/s1/");
        assert_eq!(entry, Some(&AccessEntry::new("function:get", "/account/a1/")));
        let entry = grants.first_authorizing("function:put", "/account/a1/");
        assert_eq!(entry, Some(&AccessEntry::new("function:*", "/")));
    }

    #[test]
    fn empty_grants_authorize_nothing() {
        assert!(!AccessGrants::default().is_authorized("function:get", "/"));
    }

    #[test]
    fn malformed_entries_are_reported() {
        assert_eq!(
            AccessEntry::new("", "/").validate(),
            Err(AccessEntryError::MissingAction)
        );
        assert_eq!(
            AccessEntry::new("function:get", " ").validate(),
            Err(AccessEntryError::MissingResource)
        );
        assert!(AccessEntry::new("function:get", "/").validate().is_ok());
    }

    #[test]
    fn grants_deserialize_from_allow_list() {
        let grants: AccessGrants = serde_json::from_str(
            r#"{"allow":[{"action":"function:*","resource":"/account/a1/"}]}"#,
        )
        .unwrap_or_default();
        assert_eq!(grants.allow.len(), 1);
        assert!(grants.is_authorized("function:get", "/account/a1/"));
    }
}
