//! Custom Resource Definitions for the preview operator
//!
//! This module contains the PreviewEnvironment CRD and its supporting types.

mod preview;
mod types;

pub use preview::{PreviewEnvironment, PreviewEnvironmentSpec, PreviewEnvironmentStatus};
pub use types::{Condition, ConditionStatus, PreviewPhase};
