//! Controller implementation for the PreviewEnvironment CRD
//!
//! This module contains the reconciliation logic for preview environments.
//! The controller follows the Kubernetes controller pattern with an
//! observe-diff-act loop.

mod preview;

pub use preview::{error_policy, reconcile, Context, KubeClient, KubeClientImpl};
