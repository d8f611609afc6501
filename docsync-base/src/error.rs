// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
// 4. A coarse kind tag so call sites can branch (validation vs. everything else)
//    without downcasting the wrapped error.

use std::borrow::Cow;
use backtrace_error::DynBacktraceError;
use tracing::error;

use crate::kind::ErrorKind;

#[cfg(test)]
use test_log::test;

#[derive(Debug)]
pub struct Error {
    inner: DynBacktraceError,
    kind: ErrorKind,
}
pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.inner)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
        error!(target: "docsync", "{:?}", err);
        let dbe = DynBacktraceError::from(err);
        Error { inner: dbe, kind: ErrorKind::Other }
    }

    pub fn with_kind<E: std::error::Error + Send + Sync + 'static>(kind: ErrorKind, err: E) -> Error {
        let mut e = Error::new(err);
        e.kind = kind;
        e
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_validation(&self) -> bool {
        self.kind == ErrorKind::Validation
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::new(err)
}

pub fn err_kind(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::with_kind(kind, err)
}

#[test]
fn test_error() {
    let e = err("test error");
    assert_eq!(e.kind(), ErrorKind::Other);
    let v = err_kind(ErrorKind::Validation, "bad op");
    assert!(v.is_validation());
}
