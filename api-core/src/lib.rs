//! Wire-level types shared by every service: the error-kind taxonomy and a
//! couple of small axum response helpers that the error types depend on.

/// The `AppError`/`AppErrorKind` taxonomy and the `api_error!`/
/// `api_error_kind!` macros that generate it.
pub mod error;

/// Axum helpers which must live in `api-core` because `error` depends on
/// them.
#[cfg(feature = "axum")]
pub mod axum_helpers;
