//! Supporting types for the PreviewEnvironment CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Preview environment lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum PreviewPhase {
    /// Environment has been accepted but not yet initialized
    #[default]
    Pending,
    /// Child resources are being created
    Creating,
    /// Environment is reachable and serving the PR's image
    Ready,
    /// TTL elapsed or deletion requested, teardown in progress
    Expiring,
    /// Convergence encountered an error
    Failed,
}

impl std::fmt::Display for PreviewPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Creating => write!(f, "Creating"),
            Self::Ready => write!(f, "Ready"),
            Self::Expiring => write!(f, "Expiring"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, Expired)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod phase {
        use super::*;

        #[test]
        fn test_default_is_pending() {
            assert_eq!(PreviewPhase::default(), PreviewPhase::Pending);
        }

        #[test]
        fn test_display() {
            assert_eq!(PreviewPhase::Pending.to_string(), "Pending");
            assert_eq!(PreviewPhase::Creating.to_string(), "Creating");
            assert_eq!(PreviewPhase::Ready.to_string(), "Ready");
            assert_eq!(PreviewPhase::Expiring.to_string(), "Expiring");
            assert_eq!(PreviewPhase::Failed.to_string(), "Failed");
        }

        #[test]
        fn test_serializes_as_bare_string() {
            let json = serde_json::to_string(&PreviewPhase::Ready).unwrap();
            assert_eq!(json, "\"Ready\"");
        }
    }

    mod condition {
        use super::*;

        #[test]
        fn test_new_sets_timestamp() {
            let before = Utc::now();
            let condition = Condition::new(
                "Ready",
                ConditionStatus::True,
                "ResourcesReady",
                "Preview environment is ready",
            );
            let after = Utc::now();

            assert!(condition.last_transition_time >= before);
            assert!(condition.last_transition_time <= after);
            assert_eq!(condition.type_, "Ready");
            assert_eq!(condition.status, ConditionStatus::True);
        }

        #[test]
        fn test_serializes_with_kubernetes_field_names() {
            let condition = Condition::new(
                "Expired",
                ConditionStatus::True,
                "TTLElapsed",
                "Environment TTL has elapsed",
            );
            let json = serde_json::to_value(&condition).unwrap();
            assert!(json.get("type").is_some());
            assert!(json.get("lastTransitionTime").is_some());
        }
    }
}
