//! A `Runtime` for use from `#[tokio::test]` functions. Background loops in
//! this engine are generic over `Runtime`, so tests can drive them against
//! the ambient `tokio` test executor rather than a full production runtime.

use crate::prod::TokioRuntime;

/// Build a `Runtime` from the ambient `tokio` executor. Must be called from
/// within a running `tokio` runtime (e.g. an `#[tokio::test]` function).
pub fn test_runtime() -> TokioRuntime {
    TokioRuntime::new(tokio::runtime::Handle::current())
}
