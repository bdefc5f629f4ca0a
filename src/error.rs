//! Error types for the TAPMS operator
//!
//! Errors are structured with fields to aid debugging in production. Remote
//! failures carry the backing system they came from and, when the remote end
//! answered, the HTTP status, so syncers can recover idempotent conditions
//! locally and the controller can decide how to requeue.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for TAPMS operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Could not obtain a bearer token for a backing system
    #[error("authentication error [{system}]: {message}")]
    Authentication {
        /// Backing system the token was requested for
        system: String,
        /// Description of what failed
        message: String,
    },

    /// Network failure or 5xx from a backing system
    #[error("{system} unavailable: {message}")]
    RemoteUnavailable {
        /// Backing system that could not be reached
        system: String,
        /// Description of what failed
        message: String,
    },

    /// 4xx from a backing system other than a recognised idempotent case
    #[error("{system} rejected request ({status}): {message}")]
    RemoteRejected {
        /// Backing system that rejected the request
        system: String,
        /// HTTP status returned
        status: u16,
        /// Description of what was rejected
        message: String,
    },

    /// The declared tenant is invalid
    #[error("validation error for {tenant}: {message}")]
    Validation {
        /// Name of the tenant with invalid configuration
        tenant: String,
        /// Description of what's invalid
        message: String,
    },

    /// A blocking lifecycle hook refused the transition
    #[error("hook {hook} rejected transition: {message}")]
    HookRejected {
        /// Name of the hook
        hook: String,
        /// Description of the failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create an authentication error for a backing system
    pub fn authentication(system: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Authentication {
            system: system.into(),
            message: msg.into(),
        }
    }

    /// Create a remote-unavailable error for a backing system
    pub fn unavailable(system: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            system: system.into(),
            message: msg.into(),
        }
    }

    /// Create a remote-rejected error carrying the HTTP status
    pub fn rejected(system: impl Into<String>, status: u16, msg: impl Into<String>) -> Self {
        Self::RemoteRejected {
            system: system.into(),
            status,
            message: msg.into(),
        }
    }

    /// Classify a non-success HTTP status from a backing system
    ///
    /// 5xx and 429 are transient; every other status is a rejection.
    pub fn from_status(system: impl Into<String>, status: u16, msg: impl Into<String>) -> Self {
        if status >= 500 || status == 429 {
            Self::unavailable(system, format!("status {status}: {}", msg.into()))
        } else {
            Self::rejected(system, status, msg)
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            tenant: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with tenant context
    pub fn validation_for(tenant: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            tenant: tenant.into(),
            message: msg.into(),
        }
    }

    /// Create a hook rejection
    pub fn hook_rejected(hook: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::HookRejected {
            hook: hook.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// HTTP status reported by the remote end, if it answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::RemoteRejected { status, .. } => Some(*status),
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// True when the remote resource does not exist
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// True when the remote resource already exists or was modified concurrently
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Prefix the message of a remote error with what was being attempted
    ///
    /// The variant and status are preserved so retry classification is unchanged.
    pub fn context(self, what: impl std::fmt::Display) -> Self {
        match self {
            Error::RemoteUnavailable { system, message } => Error::RemoteUnavailable {
                system,
                message: format!("{what}: {message}"),
            },
            Error::RemoteRejected {
                system,
                status,
                message,
            } => Error::RemoteRejected {
                system,
                status,
                message: format!("{what}: {message}"),
            },
            Error::Authentication { system, message } => Error::Authentication {
                system,
                message: format!("{what}: {message}"),
            },
            other => other,
        }
    }

    /// Check if this error is retryable
    ///
    /// Authentication and availability failures are transient. Rejections,
    /// validation and hook failures need a change to the declared tenant or
    /// operator attention. Kubernetes errors are retried unless they are 4xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Authentication { .. } => true,
            Error::RemoteUnavailable { .. } => true,
            Error::RemoteRejected { .. } => false,
            Error::Validation { .. } => false,
            Error::HookRejected { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
