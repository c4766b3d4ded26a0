//! The error-kind taxonomy used across this service.
//!
//! Kinds, not types: every fallible operation in this tree eventually
//! produces one `AppError`, whose `kind` picks an HTTP status and a stable
//! wire error code. Internal layers never format an HTTP status themselves;
//! only the edge (axum's `IntoResponse` impl below) does.

#![deny(non_snake_case)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "axum")]
use crate::axum_helpers;

pub const CLIENT_400_BAD_REQUEST: http::StatusCode = http::StatusCode::BAD_REQUEST;
pub const CLIENT_401_UNAUTHORIZED: http::StatusCode = http::StatusCode::UNAUTHORIZED;
pub const CLIENT_402_PAYMENT_REQUIRED: http::StatusCode = http::StatusCode::PAYMENT_REQUIRED;
pub const CLIENT_403_FORBIDDEN: http::StatusCode = http::StatusCode::FORBIDDEN;
pub const CLIENT_404_NOT_FOUND: http::StatusCode = http::StatusCode::NOT_FOUND;
pub const CLIENT_409_CONFLICT: http::StatusCode = http::StatusCode::CONFLICT;
pub const SERVER_500_INTERNAL_SERVER_ERROR: http::StatusCode =
    http::StatusCode::INTERNAL_SERVER_ERROR;
pub const SERVER_502_BAD_GATEWAY: http::StatusCode = http::StatusCode::BAD_GATEWAY;
pub const SERVER_503_SERVICE_UNAVAILABLE: http::StatusCode =
    http::StatusCode::SERVICE_UNAVAILABLE;
pub const SERVER_504_GATEWAY_TIMEOUT: http::StatusCode = http::StatusCode::GATEWAY_TIMEOUT;

/// `ErrorCode` is the common serialized representation for all error kinds.
pub type ErrorCode = u16;

/// The only error struct actually sent across the wire; everything else
/// converts to/from it.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub msg: String,
    /// Structured data associated with this error.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Whether `data` contains sensitive information (e.g. a route) that
    /// shouldn't be logged by this service's own infra, even though it may
    /// still be safe to show a caller.
    #[serde(default)]
    pub sensitive: bool,
}

/// Methods required of every error kind enum. Implementations are generated
/// by [`api_error_kind!`].
pub trait AppErrorKind:
    Copy
    + Clone
    + Default
    + Eq
    + PartialEq
    + fmt::Debug
    + fmt::Display
    + ToHttpStatus
    + From<CommonErrorKind>
    + From<ErrorCode>
    + Sized
    + 'static
{
    /// All known error kind variants, excluding `Unknown(_)`.
    const KINDS: &'static [Self];

    fn is_unknown(&self) -> bool;
    fn to_name(self) -> &'static str;
    fn to_msg(self) -> &'static str;
    fn to_code(self) -> ErrorCode;
    fn from_code(code: ErrorCode) -> Self;
}

/// Get the HTTP status code for a given error (kind).
pub trait ToHttpStatus {
    fn to_http_status(&self) -> http::StatusCode;
}

/// A 'trait alias' for all the supertraits an API error type must impl to be
/// accepted by [`crate::axum_helpers`] and the REST client in `api::rest`.
pub trait ApiError:
    ToHttpStatus
    + From<CommonApiError>
    + From<ErrorResponse>
    + Into<ErrorResponse>
    + std::error::Error
    + Clone
{
}

impl<E> ApiError for E where
    E: ToHttpStatus
        + From<CommonApiError>
        + From<ErrorResponse>
        + Into<ErrorResponse>
        + std::error::Error
        + Clone
{
}

// --- api_error! and api_error_kind! macros --- //

/// Generates the `ApiError`-shaped struct wrapping an error kind, plus all
/// the plumbing (`Display`, wire conversions, `IntoResponse`) it needs.
macro_rules! api_error {
    ($api_error:ident, $api_error_kind:ident) => {
        #[derive(Clone, Debug, Default, Eq, PartialEq, Error)]
        pub struct $api_error<D = serde_json::Value> {
            pub kind: $api_error_kind,
            pub msg: String,
            /// Structured data associated with this error.
            pub data: D,
            /// Whether `data` is sensitive (see [`ErrorResponse::sensitive`]).
            pub sensitive: bool,
        }

        impl $api_error {
            /// Log this error and get its HTTP status code.
            #[cfg(feature = "axum")]
            fn log_and_status(&self) -> http::StatusCode {
                let status = self.to_http_status();
                if status.is_server_error() {
                    tracing::error!("{self}");
                } else if status.is_client_error() {
                    tracing::warn!("{self}");
                } else {
                    tracing::error!("Unexpected status code {status} for error: {self}");
                }
                status
            }
        }

        impl fmt::Display for $api_error {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let kind_msg = self.kind.to_msg();
                let msg = &self.msg;
                write!(f, "{kind_msg}: {msg}")
            }
        }

        impl From<ErrorResponse> for $api_error {
            fn from(err_resp: ErrorResponse) -> Self {
                let ErrorResponse { code, msg, data, sensitive } = err_resp;
                let kind = $api_error_kind::from_code(code);
                Self { kind, msg, data, sensitive }
            }
        }

        impl From<$api_error> for ErrorResponse {
            fn from(api_error: $api_error) -> Self {
                let $api_error { kind, msg, data, sensitive } = api_error;
                let code = kind.to_code();
                Self { code, msg, data, sensitive }
            }
        }

        impl From<CommonApiError> for $api_error {
            fn from(common_error: CommonApiError) -> Self {
                let CommonApiError { kind, msg } = common_error;
                let kind = $api_error_kind::from(kind);
                Self { kind, msg, ..Default::default() }
            }
        }

        impl ToHttpStatus for $api_error {
            fn to_http_status(&self) -> http::StatusCode {
                self.kind.to_http_status()
            }
        }

        #[cfg(feature = "axum")]
        impl axum::response::IntoResponse for $api_error {
            fn into_response(self) -> http::Response<axum::body::Body> {
                // Server-side errors are logged here since the error is
                // converted to an `http::Response` before axum's own layers
                // get a chance to see it.
                let status = self.log_and_status();
                let error_response = ErrorResponse::from(self);
                axum_helpers::build_json_response(status, &error_response)
            }
        }

        #[cfg(any(test, feature = "test-utils"))]
        impl proptest::arbitrary::Arbitrary for $api_error {
            type Parameters = ();
            type Strategy = proptest::strategy::BoxedStrategy<Self>;
            fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
                use proptest::{arbitrary::any, strategy::Strategy};
                (
                    any::<$api_error_kind>(),
                    ".*",
                    proptest::prop_oneof![
                        proptest::strategy::Just(serde_json::Value::Null),
                        "[a-z]{0,8}".prop_map(|s| serde_json::json!({ "detail": s })),
                    ],
                    any::<bool>(),
                )
                    .prop_map(|(kind, msg, data, sensitive)| Self {
                        kind,
                        msg,
                        data,
                        sensitive,
                    })
                    .boxed()
            }
        }
    };
}

/// Generates the error kind enum's trait impls. Each invocation must be
/// paired with a [`ToHttpStatus`] impl written by hand (the status mapping is
/// domain knowledge, not mechanical).
///
/// All error kind enums must have an `Unknown(ErrorCode)` variant, listed
/// first: it handles unrecognized codes seen from an older/newer version of
/// this service and preserves the original code for debugging.
///
/// Doc strings on each variant are used for [`AppErrorKind::to_msg`] and the
/// [`fmt::Display`] impl.
macro_rules! api_error_kind {
    {
        $(#[$enum_meta:meta])*
        pub enum $error_kind_name:ident {
            $( #[doc = $unknown_msg:literal] )*
            Unknown(ErrorCode),

            $(
                $( #[doc = $item_msg:literal] )*
                $item_name:ident = $item_code:literal
            ),*
            $(,)?
        }
    } => {
        $(#[$enum_meta])*
        pub enum $error_kind_name {
            $( #[doc = $unknown_msg] )*
            Unknown(ErrorCode),
            $(
                $( #[doc = $item_msg] )*
                $item_name
            ),*
        }

        impl AppErrorKind for $error_kind_name {
            const KINDS: &'static [Self] = &[ $( Self::$item_name, )* ];

            #[inline]
            fn is_unknown(&self) -> bool {
                matches!(self, Self::Unknown(_))
            }

            fn to_name(self) -> &'static str {
                match self {
                    $( Self::$item_name => stringify!($item_name), )*
                    Self::Unknown(_) => "Unknown",
                }
            }

            fn to_msg(self) -> &'static str {
                let kind_msg = match self {
                    $( Self::$item_name => concat!($( $item_msg, )*), )*
                    Self::Unknown(_) => concat!($( $unknown_msg, )*),
                };
                kind_msg.trim_start()
            }

            fn to_code(self) -> ErrorCode {
                match self {
                    $( Self::$item_name => $item_code, )*
                    Self::Unknown(code) => code,
                }
            }

            fn from_code(code: ErrorCode) -> Self {
                #[deny(unreachable_patterns)]
                match code {
                    0 => Self::Unknown(0),
                    $( $item_code => Self::$item_name, )*
                    _ => Self::Unknown(code),
                }
            }
        }

        impl Default for $error_kind_name {
            fn default() -> Self {
                Self::Unknown(0)
            }
        }

        impl fmt::Display for $error_kind_name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // No leading "[<code>=<name>]" prefix: we tried it and it
                // wasn't helpful. ApiError's own Display adds the ": ".
                write!(f, "{}", (*self).to_msg())
            }
        }

        impl From<ErrorCode> for $error_kind_name {
            #[inline]
            fn from(code: ErrorCode) -> Self {
                Self::from_code(code)
            }
        }

        impl From<$error_kind_name> for ErrorCode {
            #[inline]
            fn from(val: $error_kind_name) -> ErrorCode {
                val.to_code()
            }
        }

        impl From<CommonErrorKind> for $error_kind_name {
            #[inline]
            fn from(common: CommonErrorKind) -> Self {
                Self::from_code(common.to_code())
            }
        }

        #[cfg(any(test, feature = "test-utils"))]
        impl proptest::arbitrary::Arbitrary for $error_kind_name {
            type Parameters = ();
            type Strategy = proptest::strategy::BoxedStrategy<Self>;

            fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
                use proptest::{arbitrary::any, prop_oneof, sample, strategy::Strategy};
                // 9/10 sample a valid code, o/w sample a random (likely
                // unknown) code.
                prop_oneof![
                    9 => sample::select(Self::KINDS),
                    1 => any::<ErrorCode>().prop_map(Self::from_code),
                ].boxed()
            }
        }
    }
}

// --- Error structs --- //

/// Error variants common to every `ApiError`. Intermediate type used only in
/// library code (the REST client, `api::server`) that can't assume a
/// specific `ApiError` impl.
pub struct CommonApiError {
    pub kind: CommonErrorKind,
    pub msg: String,
}

api_error!(AppApiError, AppErrorKindImpl);

#[derive(Copy, Clone, Debug)]
#[repr(u16)]
pub enum CommonErrorKind {
    /// Unknown reqwest client error
    UnknownReqwest = 1,
    /// Error building the HTTP request
    Building = 2,
    /// Error connecting to a remote HTTP service
    Connect = 3,
    /// Request timed out
    Timeout = 4,
    /// Error decoding/deserializing the HTTP response body
    Decode = 5,
    /// General server error
    Server = 6,
    /// Client provided a bad request that the server rejected
    Rejection = 7,
    /// Server is currently at capacity; retry later
    AtCapacity = 8,
}

impl ToHttpStatus for CommonErrorKind {
    fn to_http_status(&self) -> http::StatusCode {
        use CommonErrorKind::*;
        match self {
            UnknownReqwest => CLIENT_400_BAD_REQUEST,
            Building => CLIENT_400_BAD_REQUEST,
            Connect => SERVER_503_SERVICE_UNAVAILABLE,
            Timeout => SERVER_504_GATEWAY_TIMEOUT,
            Decode => SERVER_502_BAD_GATEWAY,
            Server => SERVER_500_INTERNAL_SERVER_ERROR,
            Rejection => CLIENT_400_BAD_REQUEST,
            AtCapacity => SERVER_503_SERVICE_UNAVAILABLE,
        }
    }
}

impl CommonErrorKind {
    pub fn to_code(self) -> ErrorCode {
        self as u16
    }
}

api_error_kind! {
    /// Every error kind this service can return, across the LLM pipeline and
    /// the payment engine.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub enum AppErrorKindImpl {
        /// Unknown error
        Unknown(ErrorCode),

        // --- Common --- //
        /// Unknown reqwest client error
        UnknownReqwest = 1,
        /// Error building the HTTP request
        Building = 2,
        /// Error connecting to a remote HTTP service
        Connect = 3,
        /// Request timed out
        Timeout = 4,
        /// Error decoding/deserializing the HTTP response body
        Decode = 5,
        /// General server error
        Server = 6,
        /// Client provided a bad request that the server rejected
        Rejection = 7,
        /// Server is currently at capacity; retry later
        AtCapacity = 8,

        // --- Domain --- //
        /// Malformed input, invalid UUID, or unknown enum value
        Validation = 100,
        /// Missing, malformed, or expired bearer token
        Auth = 101,
        /// Authenticated, but not authorized for this workspace
        Authorization = 102,
        /// Referenced entity does not exist
        NotFound = 103,
        /// Uniqueness violation, duplicate webhook, or reference collision
        Conflict = 104,
        /// A downstream payment provider returned an error
        Provider = 105,
        /// The ledger refused a consume for lack of balance
        InsufficientCredits = 106,
        /// A transient failure (deadlock, network timeout) that was retried
        /// and exhausted its budget
        Transient = 107,
        /// A fatal, non-retryable failure (subprocess spawn, missing config)
        Fatal = 108,
    }
}

impl ToHttpStatus for AppErrorKindImpl {
    fn to_http_status(&self) -> http::StatusCode {
        use AppErrorKindImpl::*;
        match self {
            Unknown(_) => SERVER_500_INTERNAL_SERVER_ERROR,
            UnknownReqwest => CLIENT_400_BAD_REQUEST,
            Building => CLIENT_400_BAD_REQUEST,
            Connect => SERVER_503_SERVICE_UNAVAILABLE,
            Timeout => SERVER_504_GATEWAY_TIMEOUT,
            Decode => SERVER_502_BAD_GATEWAY,
            Server => SERVER_500_INTERNAL_SERVER_ERROR,
            Rejection => CLIENT_400_BAD_REQUEST,
            AtCapacity => SERVER_503_SERVICE_UNAVAILABLE,

            Validation => CLIENT_400_BAD_REQUEST,
            Auth => CLIENT_401_UNAUTHORIZED,
            Authorization => CLIENT_403_FORBIDDEN,
            NotFound => CLIENT_404_NOT_FOUND,
            Conflict => CLIENT_409_CONFLICT,
            Provider => SERVER_502_BAD_GATEWAY,
            InsufficientCredits => CLIENT_402_PAYMENT_REQUIRED,
            Transient => SERVER_503_SERVICE_UNAVAILABLE,
            Fatal => SERVER_500_INTERNAL_SERVER_ERROR,
        }
    }
}

impl CommonApiError {
    pub fn server(msg: impl Into<String>) -> Self {
        Self { kind: CommonErrorKind::Server, msg: msg.into() }
    }
}

impl fmt::Display for CommonApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.to_msg(), self.msg)
    }
}

impl CommonErrorKind {
    pub fn to_msg(self) -> &'static str {
        use CommonErrorKind::*;
        match self {
            UnknownReqwest => "Unknown reqwest client error",
            Building => "Error building the HTTP request",
            Connect => "Error connecting to a remote HTTP service",
            Timeout => "Request timed out",
            Decode => "Error decoding/deserializing the HTTP response body",
            Server => "General server error",
            Rejection => "Client provided a bad request that the server rejected",
            AtCapacity => "Server is currently at capacity; retry later",
        }
    }
}

impl From<serde_json::Error> for CommonApiError {
    fn from(err: serde_json::Error) -> Self {
        Self { kind: CommonErrorKind::Decode, msg: err.to_string() }
    }
}

#[cfg(feature = "axum")]
impl From<CommonApiError> for ErrorResponse {
    fn from(err: CommonApiError) -> Self {
        Self {
            code: err.kind.to_code(),
            msg: err.msg,
            data: serde_json::Value::Null,
            sensitive: false,
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for CommonApiError {
    fn into_response(self) -> http::Response<axum::body::Body> {
        let status = self.kind.to_http_status();
        if status.is_server_error() {
            tracing::error!("{self}");
        } else {
            tracing::warn!("{self}");
        }
        let error_response = ErrorResponse::from(self);
        axum_helpers::build_json_response(status, &error_response)
    }
}

impl AppApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self { kind: AppErrorKindImpl::Validation, msg: msg.into(), ..Default::default() }
    }
    pub fn auth(msg: impl Into<String>) -> Self {
        Self { kind: AppErrorKindImpl::Auth, msg: msg.into(), ..Default::default() }
    }
    pub fn authorization(msg: impl Into<String>) -> Self {
        Self { kind: AppErrorKindImpl::Authorization, msg: msg.into(), ..Default::default() }
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self { kind: AppErrorKindImpl::NotFound, msg: msg.into(), ..Default::default() }
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self { kind: AppErrorKindImpl::Conflict, msg: msg.into(), ..Default::default() }
    }
    pub fn provider(msg: impl Into<String>) -> Self {
        Self { kind: AppErrorKindImpl::Provider, msg: msg.into(), ..Default::default() }
    }
    pub fn insufficient_credits(msg: impl Into<String>) -> Self {
        Self {
            kind: AppErrorKindImpl::InsufficientCredits,
            msg: msg.into(),
            ..Default::default()
        }
    }
    pub fn transient(msg: impl Into<String>) -> Self {
        Self { kind: AppErrorKindImpl::Transient, msg: msg.into(), ..Default::default() }
    }
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self { kind: AppErrorKindImpl::Fatal, msg: msg.into(), ..Default::default() }
    }
}

/// Join multiple fallible results into one, concatenating error messages with
/// "; ". Used when several independent cleanup/reconciliation steps each
/// produce their own `anyhow::Result<()>`.
pub fn join_results(results: Vec<anyhow::Result<()>>) -> anyhow::Result<()> {
    let errors: Vec<String> = results
        .into_iter()
        .filter_map(|r| r.err())
        .map(|e| format!("{e:#}"))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(errors.join("; ")))
    }
}
