//! Shared error classification for the segment engine.
//!
//! Mirrors the error-handling convention used throughout this codebase:
//! internal plumbing returns `anyhow::Result`, and any error that should be
//! classified for a caller (or for metrics) is attached to the error chain
//! via `.context(EngineError::not_found(...))`. Call sites that need to know
//! *why* an `anyhow::Error` failed use the `EngineErrorExt` extension trait
//! rather than downcasting directly.

use std::borrow::Cow;

mod metrics;

/// The error kinds enumerated in the engine's error-handling design: every
/// user-visible or background-loop failure is classified as exactly one of
/// these.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Io,
    Catalog,
    Engine,
    ShuttingDown,
    Internal,
}

impl ErrorKind {
    fn tag(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Io => "io",
            ErrorKind::Catalog => "catalog",
            ErrorKind::Engine => "engine",
            ErrorKind::ShuttingDown => "shutting_down",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A classified engine error. Attach to an `anyhow::Error` chain via
/// `.context(e)` at the point the error is first known, the same way this
/// codebase's `ErrorMetadata` is used.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    /// Short, stable identifier for the failure, useful for test assertions
    /// and metric tags (e.g. `TableNotFound`).
    pub code: Cow<'static, str>,
    pub message: Cow<'static, str>,
}

impl EngineError {
    pub fn new(
        kind: ErrorKind,
        code: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        metrics::log_error_kind(kind.tag());
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(
        code: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(ErrorKind::NotFound, code, message)
    }

    pub fn invalid_argument(
        code: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(ErrorKind::InvalidArgument, code, message)
    }

    pub fn io(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Io, "IoError", message)
    }

    pub fn catalog(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Catalog, "CatalogError", message)
    }

    pub fn engine(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Engine, "EngineError", message)
    }

    pub fn shutting_down() -> Self {
        Self::new(
            ErrorKind::ShuttingDown,
            "ShuttingDown",
            "the engine is shutting down and is no longer accepting new work",
        )
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Internal, "InternalError", message)
    }

    pub fn table_not_found(table_id: &str) -> Self {
        Self::not_found("TableNotFound", format!("no table named {table_id:?}"))
    }
}

pub trait EngineErrorExt {
    fn kind(&self) -> Option<ErrorKind>;
    fn is_not_found(&self) -> bool;
    fn is_invalid_argument(&self) -> bool;
    fn is_shutting_down(&self) -> bool;
}

impl EngineErrorExt for anyhow::Error {
    fn kind(&self) -> Option<ErrorKind> {
        self.downcast_ref::<EngineError>().map(|e| e.kind)
    }

    fn is_not_found(&self) -> bool {
        self.kind() == Some(ErrorKind::NotFound)
    }

    fn is_invalid_argument(&self) -> bool {
        self.kind() == Some(ErrorKind::InvalidArgument)
    }

    fn is_shutting_down(&self) -> bool {
        self.kind() == Some(ErrorKind::ShuttingDown)
    }
}

#[cfg(any(test, feature = "testing"))]
mod proptest_impls {
    use proptest::prelude::*;

    use crate::EngineError;

    impl Arbitrary for EngineError {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<crate::ErrorKind>()
                .prop_map(|kind| EngineError::new(kind, "Test", "test error"))
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_round_trips_through_anyhow() {
        let err: anyhow::Error = anyhow::Error::new(EngineError::table_not_found("widgets"));
        assert!(err.is_not_found());
        assert!(!err.is_invalid_argument());
    }

    #[test]
    fn plain_anyhow_error_is_unclassified() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(err.kind(), None);
        assert!(!err.is_not_found());
    }
}
