//! Error types for the drover workspace.
//!
//! Control loops in drover never abort on transient failures; a provider,
//! minion, or Docker error is logged by the loop that hit it and the next
//! reconciliation tick retries from fresh state. The variants here exist so
//! call sites can tell those transient kinds apart from configuration errors
//! (which are surfaced to the caller of `deploy`) and genuine internal
//! invariant violations.

use thiserror::Error;

/// Result type to be used in all fallible drover functions.
pub type DroverResult<T> = Result<T, DroverError>;

#[derive(Debug, Error)]
pub enum DroverError {
    /// A cloud provider API call failed. Always transient; the reconciler
    /// logs it and re-derives its plan on the next tick.
    #[error("provider error: {0}")]
    Provider(String),

    /// An RPC to a minion failed or timed out. The foreman drops its client
    /// and transitions the machine to reconnecting.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// A Docker daemon operation failed. The scheduler retries next tick.
    #[error("docker error: {0}")]
    Docker(String),

    /// The blueprint's namespace no longer matches the namespace a control
    /// loop was created for. The enclosing transaction is abandoned without
    /// side effects.
    #[error("namespace changed (expected {expected:?}, found {found:?})")]
    NamespaceChanged { expected: String, found: String },

    /// The blueprint failed vetting. Raised before any datastore mutation;
    /// the message is intended for the user who submitted the deploy.
    #[error("invalid blueprint: {0}")]
    InvalidBlueprint(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An internal invariant was violated. These indicate bugs in drover
    /// itself, never bad user input.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DroverError {
    /// Whether the next reconciliation tick is expected to recover from this
    /// error without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DroverError::Provider(_) | DroverError::Rpc(_) | DroverError::Docker(_)
        )
    }
}

/// Return a [`DroverError::Internal`] from the enclosing function.
#[macro_export]
macro_rules! internal {
    ($($format_args:tt)*) => {
        return Err($crate::DroverError::Internal(format!($($format_args)*)).into())
    };
}

/// Return a [`DroverError::Internal`] from the enclosing function if the
/// given condition is false.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($format_args:tt)*) => {
        if !$cond {
            $crate::internal!($($format_args)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(DroverError::Provider("eperm".into()).is_transient());
        assert!(DroverError::Rpc("timeout".into()).is_transient());
        assert!(!DroverError::InvalidBlueprint("dup hostname".into()).is_transient());
        assert!(!DroverError::Internal("bug".into()).is_transient());
    }

    #[test]
    fn invariant_macro_propagates() {
        fn check(x: u32) -> DroverResult<u32> {
            invariant!(x < 10, "x out of range: {}", x);
            Ok(x)
        }
        assert_eq!(check(3).unwrap(), 3);
        assert!(matches!(check(12), Err(DroverError::Internal(_))));
    }
}
