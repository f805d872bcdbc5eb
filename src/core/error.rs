//! # Errors
//!
//! What a store call can fail with, and how queue outcomes map onto it.

use std::fmt;
use std::sync::Arc;

use super::meta::RequestMeta;
use super::queue::TaskError;

/// Boxed error returned by feature handler code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Handler failure shared between the caller's future and the error hook.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the store.
///
/// `Configuration`, `NoResource`, `Destroyed`, `UnknownRequest` and
/// `NoRuntime` fail fast at
/// the call site. `Cancelled` and `Handler` only ever arrive through a
/// request's future. Bindings are expected to ignore `Cancelled` (a newer
/// action superseded an older one) and surface `Handler`.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Features could not be composed (merged key collision).
    Configuration(ConfigurationError),
    /// A request was issued while no target is attached.
    NoResource { request: String },
    /// The store (or its queue) has been destroyed.
    Destroyed,
    /// No feature declares a request with this name.
    UnknownRequest(String),
    /// A request was issued outside a tokio runtime.
    NoRuntime { request: String },
    /// The task was aborted before or while running.
    Cancelled { key: String },
    /// Feature handler code failed.
    Handler {
        key: String,
        meta: Option<RequestMeta>,
        source: SharedError,
    },
}

impl StoreError {
    /// Lifts a queue outcome into the store taxonomy, attaching request metadata.
    pub fn from_task(error: TaskError, meta: Option<RequestMeta>) -> Self {
        match error {
            TaskError::Cancelled { key } => StoreError::Cancelled { key },
            TaskError::Failed { key, source } => StoreError::Handler { key, meta, source },
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, StoreError::Cancelled { .. })
    }

    pub fn is_handler_failure(&self) -> bool {
        matches!(self, StoreError::Handler { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Configuration(e) => write!(f, "configuration error: {e}"),
            StoreError::NoResource { request } => {
                write!(f, "no target attached (request `{request}`)")
            }
            StoreError::Destroyed => write!(f, "store has been destroyed"),
            StoreError::UnknownRequest(name) => write!(f, "unknown request `{name}`"),
            StoreError::NoRuntime { request } => {
                write!(f, "no tokio runtime to run request `{request}`")
            }
            StoreError::Cancelled { key } => write!(f, "task `{key}` was cancelled"),
            StoreError::Handler { key, source, .. } => {
                write!(f, "task `{key}` failed: {source}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Configuration(e) => Some(e),
            StoreError::Handler { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<ConfigurationError> for StoreError {
    fn from(e: ConfigurationError) -> Self {
        StoreError::Configuration(e)
    }
}

/// A collision found while merging features into one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    DuplicateStateKey {
        key: String,
        first: String,
        second: String,
    },
    DuplicateRequest {
        name: String,
        first: String,
        second: String,
    },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::DuplicateStateKey { key, first, second } => write!(
                f,
                "state key `{key}` declared by both `{first}` and `{second}`"
            ),
            ConfigurationError::DuplicateRequest {
                name,
                first,
                second,
            } => write!(
                f,
                "request `{name}` declared by both `{first}` and `{second}`"
            ),
        }
    }
}

impl std::error::Error for ConfigurationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinct_from_handler_failure() {
        let cancelled = StoreError::Cancelled { key: "play".into() };
        let failed = StoreError::Handler {
            key: "play".into(),
            meta: None,
            source: Arc::from(BoxError::from("media error")),
        };
        assert!(cancelled.is_cancellation());
        assert!(!cancelled.is_handler_failure());
        assert!(failed.is_handler_failure());
        assert!(!failed.is_cancellation());
    }

    #[test]
    fn test_display_messages() {
        let err = StoreError::NoResource {
            request: "play".into(),
        };
        assert_eq!(err.to_string(), "no target attached (request `play`)");

        let err: StoreError = ConfigurationError::DuplicateStateKey {
            key: "volume".into(),
            first: "volume".into(),
            second: "audio".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "configuration error: state key `volume` declared by both `volume` and `audio`"
        );
    }

    #[test]
    fn test_from_task_keeps_meta_on_failure() {
        let meta = RequestMeta::new("user");
        let err = StoreError::from_task(
            TaskError::Failed {
                key: "play".into(),
                source: Arc::from(BoxError::from("blocked")),
            },
            Some(meta.clone()),
        );
        match err {
            StoreError::Handler { key, meta: got, .. } => {
                assert_eq!(key, "play");
                assert_eq!(got, Some(meta));
            }
            other => panic!("expected handler error, got {other:?}"),
        }

        let err = StoreError::from_task(TaskError::Cancelled { key: "play".into() }, None);
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_handler_error_exposes_source() {
        use std::error::Error;
        let err = StoreError::Handler {
            key: "seek".into(),
            meta: None,
            source: Arc::from(BoxError::from("out of range")),
        };
        assert_eq!(err.source().unwrap().to_string(), "out of range");
    }
}
