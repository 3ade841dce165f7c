//! Runner identity and criteria matching.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies a class of runners by name and architecture.
///
/// Both fields are optional: an absent field acts as a wildcard when matched
/// against a project's runner criteria, so a runner that advertises neither
/// name nor arch is eligible for every project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

impl RunnerId {
    pub fn new(name: Option<String>, arch: Option<String>) -> Self {
        Self { name, arch }
    }

    /// Whether this runner satisfies a project's criteria object.
    ///
    /// Per criterion key: absent (or null) means "don't care"; present means
    /// the runner's corresponding field must equal it — unless the runner
    /// left that field unset, which wildcards the comparison.
    pub fn matches(&self, criteria: &Value) -> bool {
        field_matches(self.name.as_deref(), criteria.get("name"))
            && field_matches(self.arch.as_deref(), criteria.get("arch"))
    }
}

fn field_matches(runner_field: Option<&str>, criterion: Option<&Value>) -> bool {
    match (runner_field, criterion) {
        (_, None) | (_, Some(Value::Null)) => true,
        (None, Some(_)) => true,
        (Some(value), Some(required)) => required.as_str() == Some(value),
    }
}

impl std::fmt::Display for RunnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            self.name.as_deref().unwrap_or("*"),
            self.arch.as_deref().unwrap_or("*")
        )
    }
}
