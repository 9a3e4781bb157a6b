//! A minimal, transport-independent status type.
//!
//! The real wire encoding of a gRPC status (trailers, the
//! `google.rpc.Status` proto, etc.) lives in the transport layer, which is
//! out of scope for the load-balancing core. Everything in this crate that
//! needs to report success/failure does so in terms of [`Status`] and
//! [`Code`]; the call-dispatch layer is responsible for converting to and
//! from whatever wire type the transport uses.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// A gRPC status code, mirroring the canonical set defined by the gRPC
/// protocol. Only `Code::Ok` denotes success; every other code is an error.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// `(code, detail, debugException?)` per the data model: a `code = Ok`
/// status encodes success, everything else is an error carrying a
/// human-readable `detail` and an optional wrapped source error.
#[derive(Clone, Debug)]
pub struct Status {
    code: Code,
    detail: String,
    cause: Option<Arc<dyn Error + Send + Sync>>,
}

impl Status {
    pub fn new(code: Code, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            cause: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn with_cause(
        code: Code,
        detail: impl Into<String>,
        cause: impl Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            detail: detail.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, detail)
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(Code::Internal, detail)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync)> {
        self.cause.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

impl Error for Status {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as &(dyn Error + 'static))
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.detail == other.detail
    }
}
