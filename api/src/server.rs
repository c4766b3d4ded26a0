// This is the only place where we are allowed to use e.g. `Json` and `Query`.
#![allow(clippy::disallowed_types)]

//! This module provides various API server utilities.
//!
//! # Serving
//!
//! Methods to serve a [`Router`] with a fallback handler (for unmatched
//! paths), tracing / request instrumentation, backpressure, load shedding,
//! concurrency limits, server-side timeouts, and graceful shutdown:
//!
//! - [`build_server_fut`]
//! - [`build_server_fut_with_listener`]
//! - [`spawn_server_task`]
//! - [`spawn_server_task_with_listener`]
//!
//! # Extractors to get data from requests:
//!
//! - [`LxJson`] to deserialize from HTTP body JSON
//! - [`extract::LxQuery`] to deserialize from query strings
//!
//! # [`IntoResponse`] types / impls for building API-conformant responses:
//!
//! - [`LxJson`] for returning success responses as JSON
//! - [`AppApiError`] and [`CommonApiError`] impl [`IntoResponse`]
//! - [`LxRejection`] for notifying clients of bad JSON, query strings, etc.

use std::{
    convert::Infallible,
    fmt::{self, Display},
    future::Future,
    net::{SocketAddr, TcpListener},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use api_core::error::{CommonApiError, CommonErrorKind};
use axum::{
    Router, ServiceExt as AxumServiceExt,
    error_handling::HandleErrorLayer,
    extract::{
        DefaultBodyLimit, FromRequest,
        rejection::{BytesRejection, HostRejection, JsonRejection, QueryRejection},
    },
    response::IntoResponse,
    routing::RouterIntoService,
};
use http::StatusCode;
use runtime::task::Task;
use serde::{Serialize, de::DeserializeOwned};
use tower::{
    Layer, buffer::BufferLayer, limit::ConcurrencyLimitLayer,
    load_shed::LoadShedLayer, timeout::TimeoutLayer, util::MapRequestLayer,
};
use tracing::{Instrument, debug, error, info, warn};

use crate::trace;

/// The grace period passed before we wait for existing connections to
/// terminate before initiating a hard shutdown.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(3);
/// The maximum time we'll wait for a server to complete shutdown.
pub const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
stdx::const_assert!(
    SHUTDOWN_GRACE_PERIOD.as_secs() < SERVER_SHUTDOWN_TIMEOUT.as_secs()
);

/// A configuration object for Axum / Tower middleware.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayerConfig {
    /// The maximum size of the request body in bytes ([`None`] to disable).
    pub body_limit: Option<usize>,
    /// Whether to shed load when the service has reached capacity.
    pub load_shed: bool,
    /// The size of the work buffer for our service ([`None`] to disable).
    pub buffer_size: Option<usize>,
    /// The maximum # of requests we'll process at once ([`None`] to disable).
    pub concurrency: Option<usize>,
    /// The maximum time a server can spend handling a request
    /// ([`None`] to disable).
    pub handling_timeout: Option<Duration>,
    /// Whether to add the default [`Router::fallback`] to the [`Router`].
    pub default_fallback: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            body_limit: Some(16384),
            load_shed: true,
            buffer_size: Some(4096),
            concurrency: Some(4096),
            handling_timeout: Some(Duration::from_secs(15)),
            default_fallback: true,
        }
    }
}

// --- Server helpers --- //

/// Constructs an API server future which can be spawned into a task.
/// Additionally returns the server url.
pub fn build_server_fut(
    bind_addr: SocketAddr,
    router: Router<()>,
    layer_config: LayerConfig,
    server_span_name: &str,
    server_span: tracing::Span,
    shutdown: runtime::notify_once::NotifyOnce,
) -> anyhow::Result<(impl Future<Output = ()>, String)> {
    let listener =
        TcpListener::bind(bind_addr).context("Could not bind TCP listener")?;
    build_server_fut_with_listener(
        listener,
        router,
        layer_config,
        server_span_name,
        server_span,
        shutdown,
    )
    .context("Could not build server future")
}

/// [`build_server_fut`] but takes a [`TcpListener`] instead of [`SocketAddr`].
pub fn build_server_fut_with_listener(
    listener: TcpListener,
    router: Router<()>,
    layer_config: LayerConfig,
    server_span_name: &str,
    server_span: tracing::Span,
    mut shutdown: runtime::notify_once::NotifyOnce,
) -> anyhow::Result<(impl Future<Output = ()>, String)> {
    let server_addr = listener
        .local_addr()
        .context("Could not get local address of TcpListener")?;
    let server_url = format!("http://{server_addr}");
    info!("Url for {server_span_name}: {server_url}");

    let router = if layer_config.default_fallback {
        router.fallback(default_fallback)
    } else {
        router
    };

    type HyperService = RouterIntoService<hyper::body::Incoming, ()>;
    type AxumService = RouterIntoService<axum::body::Body, ()>;
    type HyperReq = http::Request<hyper::body::Incoming>;
    type AxumReq = http::Request<axum::body::Body>;
    type AxumResp = http::Response<axum::body::Body>;

    // Requests flow top-to-bottom, responses bottom-to-top (see axum's
    // middleware docs for why this ordering matters).
    let outer_middleware = tower::ServiceBuilder::new()
        .check_service::<HyperService, HyperReq, AxumResp, Infallible>()
        .layer(trace::server::trace_layer(server_span.clone()))
        .check_service::<HyperService, HyperReq, AxumResp, Infallible>();

    let inner_middleware = tower::ServiceBuilder::new()
        .check_service::<AxumService, AxumReq, AxumResp, Infallible>()
        .layer(axum::middleware::map_request_with_state(
            layer_config.body_limit,
            middleware::check_content_length_header,
        ))
        .check_service::<AxumService, AxumReq, AxumResp, Infallible>()
        .layer(
            layer_config
                .body_limit
                .map(DefaultBodyLimit::max)
                .unwrap_or_else(DefaultBodyLimit::disable),
        )
        .check_service::<AxumService, AxumReq, AxumResp, Infallible>()
        .layer(MapRequestLayer::new(axum::RequestExt::with_limited_body))
        .check_service::<AxumService, AxumReq, AxumResp, Infallible>()
        .layer(HandleErrorLayer::new(|error| async move {
            CommonApiError {
                kind: CommonErrorKind::AtCapacity,
                msg: format!("Service is at capacity; retry later: {error:#}"),
            }
        }))
        .option_layer(layer_config.load_shed.then(LoadShedLayer::new))
        .check_service::<AxumService, AxumReq, AxumResp, Infallible>()
        .option_layer(layer_config.buffer_size.map(BufferLayer::new))
        .check_service::<AxumService, AxumReq, AxumResp, Infallible>()
        .option_layer(layer_config.concurrency.map(ConcurrencyLimitLayer::new))
        .check_service::<AxumService, AxumReq, AxumResp, Infallible>()
        .layer(HandleErrorLayer::new(|error| async move {
            CommonApiError {
                kind: CommonErrorKind::Server,
                msg: format!("Server timed out handling request: {error:#}"),
            }
        }))
        .option_layer(layer_config.handling_timeout.map(TimeoutLayer::new))
        .check_service::<AxumService, AxumReq, AxumResp, Infallible>();

    let layered_router = router.layer(inner_middleware);
    let router_service = layered_router.into_service::<hyper::body::Incoming>();
    let layered_service = Layer::layer(&outer_middleware, router_service);
    let make_service = layered_service.into_make_service();

    let handle = axum_server::Handle::new();
    let handle_clone = handle.clone();
    let server_fut = async {
        axum_server::from_tcp(listener)
            .handle(handle_clone)
            .serve(make_service)
            .await
            .expect("No binding + axum MakeService::poll_ready never errors");

        info!("API server finished");
    };

    let graceful_shutdown_fut = async move {
        shutdown.recv().await;
        info!("Shutting down API server");
        handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
    };

    let combined_fut = async {
        tokio::pin!(server_fut);
        tokio::select! {
            biased; // Ensure graceful shutdown future finishes first
            () = graceful_shutdown_fut => (),
            _ = &mut server_fut => return error!("Server exited early"),
        }
        match tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, server_fut).await {
            Ok(()) => debug!("API server graceful shutdown success"),
            Err(_) => warn!("API server timed out during shutdown"),
        }
    }
    .instrument(server_span);

    Ok((combined_fut, server_url))
}

/// [`build_server_fut`] but additionally spawns the server future into an
/// instrumented server task and logs the full URL used to access the server.
pub fn spawn_server_task(
    bind_addr: SocketAddr,
    router: Router<()>,
    layer_config: LayerConfig,
    server_span_name: &'static str,
    server_span: tracing::Span,
    shutdown: runtime::notify_once::NotifyOnce,
) -> anyhow::Result<(Task<()>, String)> {
    let listener = TcpListener::bind(bind_addr)
        .context(bind_addr)
        .context("Failed to bind TcpListener")?;

    spawn_server_task_with_listener(
        listener,
        router,
        layer_config,
        server_span_name,
        server_span,
        shutdown,
    )
    .context("spawn_server_task_with_listener failed")
}

/// [`spawn_server_task`] but takes [`TcpListener`] instead of [`SocketAddr`].
pub fn spawn_server_task_with_listener(
    listener: TcpListener,
    router: Router<()>,
    layer_config: LayerConfig,
    server_span_name: &'static str,
    server_span: tracing::Span,
    shutdown: runtime::notify_once::NotifyOnce,
) -> anyhow::Result<(Task<()>, String)> {
    let (server_fut, server_url) = build_server_fut_with_listener(
        listener,
        router,
        layer_config,
        server_span_name,
        server_span.clone(),
        shutdown,
    )
    .context("Failed to build server future")?;

    let server_task = Task::spawn_with_span(server_span_name, server_span, server_fut);

    Ok((server_task, server_url))
}

// --- LxJson --- //

/// A version of [`axum::Json`] which conforms to this service's API.
/// Can be used as either an extractor or a response.
///
/// NOTE: This must only be used for forming *success* responses, i.e. `T` in
/// `Result<T, E>`, since its [`IntoResponse`] impl always uses
/// [`StatusCode::OK`]. Error types have their own [`IntoResponse`] impls.
pub struct LxJson<T>(pub T);

impl<T: DeserializeOwned, S: Send + Sync> FromRequest<S> for LxJson<T> {
    type Rejection = LxRejection;

    async fn from_request(
        req: http::Request<axum::body::Body>,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        axum::Json::from_request(req, state)
            .await
            .map(|axum::Json(t)| Self(t))
            .map_err(LxRejection::from)
    }
}

impl<T: Serialize> IntoResponse for LxJson<T> {
    fn into_response(self) -> http::Response<axum::body::Body> {
        api_core::axum_helpers::build_json_response(StatusCode::OK, &self.0)
    }
}

impl<T: Clone> Clone for LxJson<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: fmt::Debug> fmt::Debug for LxJson<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        T::fmt(&self.0, f)
    }
}

// --- LxRejection --- //

/// Our own rejection type with an [`IntoResponse`] impl which conforms to
/// this service's API. Contains the source rejection's error text.
pub struct LxRejection {
    kind: LxRejectionKind,
    source_msg: String,
}

enum LxRejectionKind {
    Bytes,
    Host,
    Json,
    Query,
    Auth,
    BadEndpoint,
    BodyLengthOverLimit,
}

impl LxRejection {
    pub fn from_auth(msg: impl Display) -> Self {
        Self {
            kind: LxRejectionKind::Auth,
            source_msg: format!("{msg:#}"),
        }
    }
}

impl From<BytesRejection> for LxRejection {
    fn from(r: BytesRejection) -> Self {
        Self {
            kind: LxRejectionKind::Bytes,
            source_msg: r.body_text(),
        }
    }
}

impl From<HostRejection> for LxRejection {
    fn from(r: HostRejection) -> Self {
        Self {
            kind: LxRejectionKind::Host,
            source_msg: r.body_text(),
        }
    }
}

impl From<JsonRejection> for LxRejection {
    fn from(r: JsonRejection) -> Self {
        Self {
            kind: LxRejectionKind::Json,
            source_msg: r.body_text(),
        }
    }
}

impl From<QueryRejection> for LxRejection {
    fn from(r: QueryRejection) -> Self {
        Self {
            kind: LxRejectionKind::Query,
            source_msg: r.body_text(),
        }
    }
}

impl IntoResponse for LxRejection {
    fn into_response(self) -> http::Response<axum::body::Body> {
        let kind = CommonErrorKind::Rejection;
        let kind_msg = self.kind.to_msg();
        let source_msg = &self.source_msg;
        let msg = format!("Rejection: {kind_msg}: {source_msg}");
        warn!("{msg}");
        let common_error = CommonApiError { kind, msg };
        common_error.into_response()
    }
}

impl LxRejectionKind {
    fn to_msg(&self) -> &'static str {
        match self {
            Self::Bytes => "Bad request bytes",
            Self::Host => "Missing or invalid host",
            Self::Json => "Client provided bad JSON",
            Self::Query => "Client provided bad query string",
            Self::Auth => "Bad bearer auth token",
            Self::BadEndpoint => "Client requested a non-existent endpoint",
            Self::BodyLengthOverLimit => "Request body length over limit",
        }
    }
}

// --- Extractors --- //

pub mod extract {
    use axum::extract::FromRequestParts;

    use super::*;

    /// Conforming version of [`axum::extract::Query`].
    pub struct LxQuery<T>(pub T);

    impl<T: DeserializeOwned, S: Send + Sync> FromRequestParts<S> for LxQuery<T> {
        type Rejection = LxRejection;

        async fn from_request_parts(
            parts: &mut http::request::Parts,
            state: &S,
        ) -> Result<Self, Self::Rejection> {
            axum::extract::Query::from_request_parts(parts, state)
                .await
                .map(|axum::extract::Query(t)| Self(t))
                .map_err(LxRejection::from)
        }
    }

    impl<T: Clone> Clone for LxQuery<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone())
        }
    }
}

// --- Custom middleware --- //

pub mod middleware {
    use axum::extract::State;

    use super::*;

    /// Checks the `CONTENT_LENGTH` header and returns an early rejection if
    /// the contained value exceeds our configured body limit. This
    /// optimization allows us to avoid unnecessary work processing the
    /// request further.
    ///
    /// NOTE: This does not enforce the body length; use [`DefaultBodyLimit`]
    /// in combination with [`axum::RequestExt::with_limited_body`] for that.
    pub async fn check_content_length_header<B>(
        State(config_body_limit): State<Option<usize>>,
        request: http::Request<B>,
    ) -> Result<http::Request<B>, LxRejection> {
        let content_length = request
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value_str| usize::from_str(value_str).ok());

        if content_length
            .zip(config_body_limit)
            .is_some_and(|(length, limit)| length > limit)
        {
            return Err(LxRejection {
                kind: LxRejectionKind::BodyLengthOverLimit,
                source_msg: "Content length header over limit".to_owned(),
            });
        }

        Ok(request)
    }
}

// --- Helpers --- //

/// Default fallback [`Handler`](axum::handler::Handler). Returns a
/// "bad endpoint" rejection along with the requested method and path.
pub async fn default_fallback(
    method: http::Method,
    uri: http::Uri,
) -> LxRejection {
    let path = uri.path();
    LxRejection {
        kind: LxRejectionKind::BadEndpoint,
        source_msg: format!("{method} {path}"),
    }
}
