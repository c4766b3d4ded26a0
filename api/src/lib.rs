//! Client/server plumbing shared by every service binary: the axum server
//! builder, a `RestClient` for calling out to payment providers and the LLM
//! runner, the inbound bearer-auth gate, SSE event framing, and request
//! tracing utilities.

/// Inbound bearer-auth gate: JWT verification and the `AuthSubject` extractor.
pub mod auth;
/// A client and helpers that enforce common REST semantics across services.
pub mod rest;
/// Server-Sent Events framing for streaming task output to clients.
pub mod sse;
/// Webserver utilities: the server builder, extractors, and middleware.
pub mod server;
/// API tracing utilities for both client and server.
pub mod trace;
