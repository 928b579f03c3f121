//! Error types for the preview operator

use thiserror::Error;

/// Main error type for preview operator operations
///
/// Every failure is transient from the controller's point of view: errors
/// surface in the resource's status and the reconcile is redelivered after
/// a bounded delay. Optimistic-concurrency conflicts on status updates
/// arrive here as [`Error::Kube`] (HTTP 409) and resolve on redelivery.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Child resource convergence error
    #[error("resource error: {0}")]
    Resource(String),
}

impl Error {
    /// Create a resource error with the given message
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: child resource failures carry enough context to debug
    ///
    /// When creating or updating one of the four child resources fails, the
    /// error names the resource so the status message points at the culprit.
    #[test]
    fn story_resource_errors_name_the_failing_child() {
        let err = Error::resource("namespace previewalice-pr42: admission webhook denied");
        assert!(err.to_string().contains("resource error"));
        assert!(err.to_string().contains("previewalice-pr42"));

        let err = Error::resource("deployment preview-app: quota exceeded");
        assert!(err.to_string().contains("quota exceeded"));

        match Error::resource("any message") {
            Error::Resource(msg) => assert_eq!(msg, "any message"),
            _ => panic!("Expected Resource variant"),
        }
    }

    /// Story: error constructors accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let dynamic_msg = format!("ingress {} not accepted", "preview-app");
        let err = Error::resource(dynamic_msg);
        assert!(err.to_string().contains("preview-app"));

        let err = Error::resource("static message");
        assert!(err.to_string().contains("static message"));
    }

    /// Story: errors are categorized for handling in the reconcile loop
    ///
    /// API errors (including 409 conflicts) retry via redelivery; resource
    /// errors surface as phase=Failed with a short fixed retry delay.
    #[test]
    fn story_error_categorization_for_requeue_strategy() {
        fn categorize(err: &Error) -> &'static str {
            match err {
                Error::Kube(_) => "retry_on_redelivery",
                Error::Resource(_) => "failed_phase_short_retry",
            }
        }

        assert_eq!(
            categorize(&Error::resource("create failed")),
            "failed_phase_short_retry"
        );
    }
}
