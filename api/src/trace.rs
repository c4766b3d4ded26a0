//! API tracing utilities for both client and server, including constants and
//! fns which help keep client and server logs consistent.

use std::{
    fmt::{self, Display},
    time::Duration,
};

use anyhow::{bail, ensure};
use http::{HeaderName, HeaderValue};
use uuid::Uuid;

/// The `target` used for request spans and events. Short, greppable, low
/// chance of collision with other targets in logs.
pub(crate) const TARGET: &str = "api";

/// The [`HeaderName`] used to read/write [`TraceId`]s.
pub(crate) static TRACE_ID_HEADER_NAME: HeaderName =
    HeaderName::from_static("x-trace-id");

/// A [`TraceId`] identifies a tree of requests sharing a single causal
/// source as it travels between services, e.g. `server` calling out to a
/// payment provider or the LLM runner. Generated by the originating client
/// and propagated via the `x-trace-id` header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TraceId(Uuid);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn to_header_value(self) -> HeaderValue {
        HeaderValue::from_str(&self.0.to_string())
            .expect("uuid hyphenated string is always a valid header value")
    }
}

impl TryFrom<&HeaderValue> for TraceId {
    type Error = anyhow::Error;

    fn try_from(src: &HeaderValue) -> Result<Self, Self::Error> {
        let s = src.to_str().map_err(|_| {
            anyhow::anyhow!("trace id header value was not valid ASCII")
        })?;
        let uuid = Uuid::parse_str(s)
            .map_err(|e| anyhow::anyhow!("trace id was not a uuid: {e:#}"))?;
        ensure!(!uuid.is_nil(), "trace id must not be the nil uuid");
        Ok(Self(uuid))
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Rejects non-trace-id header values up front; used by tests that exercise
/// the "malformed header" rejection path without round-tripping a real uuid.
pub fn parse_trace_id_or_bail(s: &str) -> anyhow::Result<TraceId> {
    let uuid = Uuid::parse_str(s)?;
    if uuid.is_nil() {
        bail!("nil uuid is not a valid trace id");
    }
    Ok(TraceId(uuid))
}

/// [`Display`]s a [`Duration`] in ms with 3 decimal places, e.g. "123.456ms".
/// Used to log request / response times in a consistent unit.
pub(crate) struct DisplayMs(pub Duration);

impl Display for DisplayMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_secs_f64() * 1000.0;
        write!(f, "{ms:.3}ms")
    }
}

/// Client tracing utilities.
pub mod client {
    use tracing::info_span;

    use super::*;

    /// Get a [`tracing::Span`] and [`TraceId`] for a client request.
    pub fn request_span(
        req: &reqwest::Request,
        from: &'static str,
        to: &'static str,
    ) -> (tracing::Span, TraceId) {
        let trace_id = TraceId::generate();
        let request_span = info_span!(
            target: TARGET,
            "(req)(cli)",
            %trace_id,
            %from,
            %to,
            method = %req.method(),
            url = %req.url(),
            attempts_left = tracing::field::Empty,
        );
        (request_span, trace_id)
    }
}

/// Server tracing utilities.
pub mod server {
    use anyhow::anyhow;
    use http::header::USER_AGENT;
    use tower_http::{
        classify::{
            ClassifiedResponse, ClassifyResponse, NeverClassifyEos,
            SharedClassifier,
        },
        trace::{
            MakeSpan, OnEos, OnFailure, OnRequest, OnResponse, TraceLayer,
        },
    };
    use tracing::{debug, error, info, info_span, warn};

    use super::*;

    /// Builds a [`TraceLayer`] which:
    ///
    /// - Instruments each incoming request with its own request span, reusing
    ///   the [`TraceId`] from the `x-trace-id` header if available
    /// - Logs "New server request" at the start of each received request
    /// - Logs "Done (result)" after the completion of each response
    /// - Logs "Stream ended" when streaming bodies (e.g. SSE) complete
    /// - Logs "Other failure" whenever anything else goes wrong
    pub fn trace_layer(
        api_span: tracing::Span,
    ) -> TraceLayer<
        SharedClassifier<LxClassifyResponse>,
        LxMakeSpan,
        LxOnRequest,
        LxOnResponse,
        (),
        LxOnEos,
        LxOnFailure,
    > {
        TraceLayer::new(SharedClassifier::new(LxClassifyResponse))
            .make_span_with(LxMakeSpan { api_span })
            .on_request(LxOnRequest)
            .on_response(LxOnResponse)
            .on_body_chunk(())
            .on_eos(LxOnEos)
            .on_failure(LxOnFailure)
    }

    /// A [`ClassifyResponse`] which classifies all responses as OK, since all
    /// responses (including error responses) are already logged by
    /// [`LxOnResponse`]; triggering [`OnFailure`] for them too would be
    /// redundant.
    #[derive(Clone)]
    pub struct LxClassifyResponse;

    impl ClassifyResponse for LxClassifyResponse {
        type FailureClass = anyhow::Error;
        type ClassifyEos = NeverClassifyEos<Self::FailureClass>;

        fn classify_response<B>(
            self,
            _response: &http::Response<B>,
        ) -> ClassifiedResponse<Self::FailureClass, Self::ClassifyEos> {
            ClassifiedResponse::Ready(Ok(()))
        }

        fn classify_error<E: Display + 'static>(
            self,
            error: &E,
        ) -> Self::FailureClass {
            anyhow!("{error:#}")
        }
    }

    /// A [`MakeSpan`] impl which mirrors [`client::request_span`].
    #[derive(Clone)]
    pub struct LxMakeSpan {
        /// The server's top-level API span, used as each request span's parent.
        api_span: tracing::Span,
    }

    impl<B> MakeSpan<B> for LxMakeSpan {
        fn make_span(&mut self, request: &http::Request<B>) -> tracing::Span {
            let url = request
                .uri()
                .path_and_query()
                .map(|url| url.as_str())
                .unwrap_or("/");

            let trace_id = request
                .headers()
                .get(&TRACE_ID_HEADER_NAME)
                .and_then(|value| TraceId::try_from(value).ok())
                .unwrap_or_else(TraceId::generate);

            let from = request
                .headers()
                .get(USER_AGENT)
                .map(|value| value.to_str().unwrap_or("(non-ascii)"))
                .unwrap_or("(none)");

            info_span!(
                target: TARGET,
                parent: self.api_span.clone(),
                "(req)(srv)",
                %trace_id,
                %from,
                method = %request.method().as_str(),
                url = %url,
                version = ?request.version(),
            )
        }
    }

    /// `OnRequest` impl mirroring `RestClient::send_inner`.
    #[derive(Clone)]
    pub struct LxOnRequest;

    impl<B> OnRequest<B> for LxOnRequest {
        fn on_request(
            &mut self,
            request: &http::Request<B>,
            _request_span: &tracing::Span,
        ) {
            let headers = request.headers();
            debug!(target: TARGET, "New server request");
            debug!(target: TARGET, ?headers, "Server request (headers)");
        }
    }

    /// [`OnResponse`] impl which logs the completion of requests by the server.
    #[derive(Clone)]
    pub struct LxOnResponse;

    impl<B> OnResponse<B> for LxOnResponse {
        fn on_response(
            self,
            response: &http::Response<B>,
            resp_time: Duration,
            _request_span: &tracing::Span,
        ) {
            let status = response.status();
            let resp_time = DisplayMs(resp_time);

            if status.is_success() {
                info!(target: TARGET, %resp_time, ?status, "Done (success)");
            } else if status.is_client_error() {
                warn!(target: TARGET, %resp_time, ?status, "Done (client error)");
            } else if status.is_server_error() && status.as_u16() == 503 {
                // Don't spam ERRORs for load-shedded 503s. ERRORs should be
                // reserved for genuine surprises.
                warn!(target: TARGET, %resp_time, ?status, "Done (load shedded)");
            } else if status.is_server_error() {
                error!(target: TARGET, %resp_time, ?status, "Done (server error)");
            } else {
                info!(target: TARGET, %resp_time, ?status, "Done (other)");
            }
        }
    }

    /// Logs when a streaming body (e.g. an SSE response) finishes.
    #[derive(Clone)]
    pub struct LxOnEos;

    impl OnEos for LxOnEos {
        fn on_eos(
            self,
            trailers: Option<&http::HeaderMap>,
            stream_time: Duration,
            _request_span: &tracing::Span,
        ) {
            let num_trailers = trailers.map(|trailers| trailers.len());
            let stream_time = DisplayMs(stream_time);
            info!(target: TARGET, %stream_time, ?num_trailers, "Stream ended");
        }
    }

    /// [`OnFailure`] impl which logs failures not already classified by
    /// [`LxClassifyResponse`], i.e. the inner [`tower::Service`] itself erroring.
    #[derive(Clone)]
    pub struct LxOnFailure;

    impl<FailureClass: Display> OnFailure<FailureClass> for LxOnFailure {
        fn on_failure(
            &mut self,
            fail_class: FailureClass,
            fail_time: Duration,
            _request_span: &tracing::Span,
        ) {
            let fail_time = DisplayMs(fail_time);
            warn!(target: TARGET, %fail_time, %fail_class, "Other failure");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trace_id_header_roundtrip() {
        let id1 = TraceId::generate();
        let header = id1.to_header_value();
        let id2 = TraceId::try_from(&header).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn trace_id_rejects_non_uuid() {
        assert!(parse_trace_id_or_bail("not-a-uuid").is_err());
    }

    #[test]
    fn trace_id_rejects_nil() {
        assert!(
            parse_trace_id_or_bail("00000000-0000-0000-0000-000000000000")
                .is_err()
        );
    }
}
