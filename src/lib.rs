//! Preview operator - TTL-bounded preview environments for pull requests
//!
//! The operator watches `PreviewEnvironment` resources and converges the
//! cluster toward the state each one declares: a dedicated namespace, a
//! single-replica deployment of the PR's image, a ClusterIP service, and an
//! ingress exposing the environment on a per-PR hostname. Every environment
//! carries a TTL; when it elapses the operator tears the whole footprint
//! down again.
//!
//! # Architecture
//!
//! The reconciler is a level-triggered control loop:
//! - child resource names and the external hostname are derived
//!   deterministically from the spec and persisted in status on first
//!   reconcile, then never recomputed
//! - convergence is idempotent create-or-update, resumable after partial
//!   failure
//! - a finalizer gates deletion of the `PreviewEnvironment` record behind
//!   cleanup of its namespace (everything else lives inside it and is
//!   cascade-deleted with it)
//! - TTL expiry is detected by periodic requeue, no external timer
//!
//! # Modules
//!
//! - [`crd`] - The PreviewEnvironment CRD (spec, status, identity derivation)
//! - [`resources`] - Desired-state builders for the child resources
//! - [`controller`] - Reconciliation logic and the cluster client boundary
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod resources;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer token gating deletion of a PreviewEnvironment behind cleanup
/// of its cluster footprint.
pub const PREVIEW_FINALIZER: &str = "preview.ephemeral.dev/finalizer";

/// Domain suffix under which preview hostnames are published.
pub const DEFAULT_PREVIEW_DOMAIN: &str = "apps.ephemeral.dev";

/// TTL applied when a PreviewEnvironment does not specify one, in hours.
pub const DEFAULT_TTL_HOURS: u32 = 24;
