use std::error::Error as StdError;
use std::fmt;

/// Stable error-kind identifiers surfaced to callers of [`crate::generate::generate`].
///
/// Every error produced by this crate carries one of these kinds plus a
/// human-readable detail. Kinds are stable; detail messages are not.
#[derive(Debug)]
pub enum Error {
    /// Required shape metadata was missing or internally inconsistent.
    ShapeDiscoveryFailed(String),

    /// Tensor counts or (layer, head) coverage were inconsistent after
    /// classification (e.g. a missing K/V slot for some layer/head pair).
    ClassificationMismatch(String),

    /// The host could not provide memory of the requested size/alignment.
    AllocationFailed(String),

    /// A required tensor role was absent from a graph's binding plan.
    BindingMissing(String),

    /// The external accelerator runtime rejected a call.
    RuntimeFailure(Box<dyn StdError + Send + Sync>),

    /// An internal consistency check failed; indicates a bug in this crate.
    InvariantViolation(String),

    /// The caller requested cancellation between decode steps.
    Cancelled,
}

impl Error {
    pub fn runtime_failure<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::RuntimeFailure(err.into())
    }

    /// Short, stable tag for this error's kind (used by the CLI's `<kind>: <detail>` output).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ShapeDiscoveryFailed(_) => "ShapeDiscoveryFailed",
            Error::ClassificationMismatch(_) => "ClassificationMismatch",
            Error::AllocationFailed(_) => "AllocationFailed",
            Error::BindingMissing(_) => "BindingMissing",
            Error::RuntimeFailure(_) => "RuntimeFailure",
            Error::InvariantViolation(_) => "InvariantViolation",
            Error::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ShapeDiscoveryFailed(detail) => write!(f, "shape discovery failed: {detail}"),
            Error::ClassificationMismatch(detail) => {
                write!(f, "tensor classification mismatch: {detail}")
            }
            Error::AllocationFailed(detail) => write!(f, "allocation failed: {detail}"),
            Error::BindingMissing(detail) => write!(f, "binding missing: {detail}"),
            Error::RuntimeFailure(err) => write!(f, "runtime failure: {err}"),
            Error::InvariantViolation(detail) => write!(f, "invariant violation: {detail}"),
            Error::Cancelled => write!(f, "generation cancelled"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::RuntimeFailure(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
