//! PreviewEnvironment Custom Resource Definition
//!
//! A PreviewEnvironment declares the desired state of one ephemeral
//! per-pull-request environment: which image to run, where it came from,
//! and how long it may live. The controller derives all child resource
//! identities from this record and records them in status.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, PreviewPhase};
use crate::{DEFAULT_PREVIEW_DOMAIN, DEFAULT_TTL_HOURS, PREVIEW_FINALIZER};

/// Specification for a PreviewEnvironment
///
/// All fields except `ttl` are required. Identifier fields are constrained
/// to DNS-safe character sets by the CRD schema; the controller relies on
/// that validation rather than re-checking syntax.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "preview.ephemeral.dev",
    version = "v1alpha1",
    kind = "PreviewEnvironment",
    plural = "previewenvironments",
    shortname = "pvenv",
    status = "PreviewEnvironmentStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.environmentUrl"}"#,
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".status.namespace"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"Expires","type":"date","jsonPath":".status.expiresAt"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PreviewEnvironmentSpec {
    /// Name of the source repository
    pub repo_name: String,

    /// Pull request number (positive)
    pub pr_number: u32,

    /// Source branch name
    pub branch: String,

    /// Commit SHA to deploy (hex, 7-40 characters)
    pub commit_sha: String,

    /// Username of the PR author
    pub github_username: String,

    /// Container image to deploy
    pub image_tag: String,

    /// How long the environment should exist, in hours (1-168, default 24)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
}

impl PreviewEnvironmentSpec {
    /// Derive the namespace name for this preview environment.
    ///
    /// A function of the author and PR number only. Commit and branch are
    /// deliberately excluded so the namespace stays stable when new commits
    /// land on the same PR.
    pub fn derive_namespace(&self) -> String {
        format!(
            "preview{}-pr{}",
            self.github_username.to_lowercase(),
            self.pr_number
        )
    }

    /// Derive the external hostname for this preview environment.
    ///
    /// Uses at most the first 7 characters of the commit SHA (the whole SHA
    /// if shorter). Called once, at first initialization; the result is
    /// persisted in status and never recomputed afterwards.
    pub fn derive_hostname(&self) -> String {
        format!(
            "{}{}{}.{}",
            self.github_username.to_lowercase(),
            self.pr_number,
            self.short_sha(),
            DEFAULT_PREVIEW_DOMAIN
        )
    }

    /// Derive the full preview URL for this environment.
    pub fn derive_environment_url(&self) -> String {
        format!("https://{}", self.derive_hostname())
    }

    /// The effective TTL in hours, defaulting when zero or unset.
    ///
    /// Values outside 1-168 are rejected by the CRD schema; no clamping
    /// happens here.
    pub fn ttl_hours(&self) -> u32 {
        match self.ttl {
            None | Some(0) => DEFAULT_TTL_HOURS,
            Some(hours) => hours,
        }
    }

    fn short_sha(&self) -> &str {
        if self.commit_sha.len() > 7 {
            &self.commit_sha[..7]
        } else {
            &self.commit_sha
        }
    }
}

/// Status for a PreviewEnvironment
///
/// Written only by the controller. Namespace, URL and timestamps are set
/// exactly once at initialization and are authoritative for the lifetime of
/// the record; status patches after that point omit them (merge-patch
/// semantics leave absent fields untouched).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreviewEnvironmentStatus {
    /// Current phase of the environment lifecycle
    #[serde(default)]
    pub phase: PreviewPhase,

    /// Namespace holding the environment's child resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// URL where the environment can be reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_url: Option<String>,

    /// When the environment was initialized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// When the environment will be torn down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the environment state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl PreviewEnvironmentStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: PreviewPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Set the namespace and return self for chaining
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the environment URL and return self for chaining
    pub fn environment_url(mut self, url: impl Into<String>) -> Self {
        self.environment_url = Some(url.into());
        self
    }

    /// Set the creation timestamp and return self for chaining
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Set the expiry timestamp and return self for chaining
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        // Replace any existing condition of the same type
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}

impl PreviewEnvironment {
    /// The namespace this environment's resources live in.
    ///
    /// Prefers the persisted status value; derives it only when status has
    /// not been initialized yet.
    pub fn namespace_name(&self) -> String {
        self.status
            .as_ref()
            .and_then(|s| s.namespace.clone())
            .unwrap_or_else(|| self.spec.derive_namespace())
    }

    /// The external hostname for this environment.
    ///
    /// Prefers the persisted status URL so the ingress host never drifts
    /// from the published URL, even after commit updates to the spec.
    pub fn hostname(&self) -> String {
        self.status
            .as_ref()
            .and_then(|s| s.environment_url.as_deref())
            .map(|url| url.trim_start_matches("https://").to_string())
            .unwrap_or_else(|| self.spec.derive_hostname())
    }

    /// Whether identity (namespace/URL/timestamps) has been persisted yet.
    pub fn is_initialized(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.namespace.is_some())
            .unwrap_or(false)
    }

    /// Whether the environment has exceeded its TTL.
    pub fn is_expired(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.expires_at)
            .map(|expires_at| Utc::now() > expires_at)
            .unwrap_or(false)
    }

    /// Whether the controller's finalizer token is present.
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|t| t == PREVIEW_FINALIZER))
            .unwrap_or(false)
    }
}
