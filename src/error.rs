//! Error types for the xget fetch engine

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, XgetError>;

/// Errors that can occur while planning, fetching, or reassembling a download
#[derive(Error, Debug, Clone)]
pub enum XgetError {
    #[error("non-2xx response: {status} {message}")]
    NetException { status: u16, message: String },

    #[error("segment {index} exhausted its retries: {last_err}")]
    SegmentExhausted { index: usize, last_err: String },

    #[error("metadata probe exhausted its retries: {last_err}")]
    MetaExhausted { last_err: String },

    #[error("start offset {start} is past the resource end (total size {total_size})")]
    RangeExceeded { start: u64, total_size: u64 },

    #[error("transformer {tag} failed: {cause}")]
    TransformError { tag: String, cause: String },

    #[error("middleware {tag} failed: {cause}")]
    MiddlewareError { tag: String, cause: String },

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("unsupported hash algorithm: {0}")]
    HashUnsupported(String),

    #[error("io error: {0}")]
    IoError(String),

    #[error("http error: {0}")]
    HttpError(String),

    #[error("instance already loaded; middleware can only be registered before start")]
    AlreadyLoaded,

    #[error("destroyed")]
    Destroyed,
}

impl From<std::io::Error> for XgetError {
    fn from(err: std::io::Error) -> Self {
        XgetError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for XgetError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            XgetError::NetException {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            XgetError::HttpError(err.to_string())
        }
    }
}

/// Source of an error that originated inside user-supplied code, used to
/// annotate errors raised from `with` middleware or `use` transformer factories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Middleware,
    Transform,
}

impl std::fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSource::Middleware => write!(f, "with"),
            ErrorSource::Transform => write!(f, "transform"),
        }
    }
}

/// The `{tag, source}` annotation attached to errors raised inside user code,
/// retrievable via [`crate::Xget::err_context`].
#[derive(Debug, Clone)]
pub struct ErrContext {
    pub raw: XgetError,
    pub tag: String,
    pub source: ErrorSource,
}

impl XgetError {
    /// Whether this error should trigger a retry when encountered by the
    /// resilient segment source or the metadata probe.
    ///
    /// 403 is the one authoritative refusal that must never be retried; every
    /// other transport-shaped failure is presumed transient.
    pub fn should_retry(&self) -> bool {
        match self {
            XgetError::NetException { status, .. } => *status != 403,
            XgetError::HttpError(_) | XgetError::IoError(_) => true,
            _ => false,
        }
    }
}
