//! Inbound bearer-auth gate: chained as middleware on every non-public route.
//!
//! 1. Extract `Authorization: Bearer <JWT>`.
//! 2. Verify the JWT against a fixed HMAC secret shared with the identity
//!    provider.
//! 3. Extract `sub` as `user_id` (must be a UUID).
//! 4. Extract `X-Workspace-Id` if present (must be a UUID); the request's
//!    `universal_id` is the workspace id when present, else the user id
//!    (self-tenanted requests).
//! 5. If a [`WorkspaceAccessVerifier`] is configured and a workspace id was
//!    supplied, verify the user belongs to that workspace.
//! 6. Attach the resulting [`AuthContext`] to the request's extensions.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use api_core::error::AppApiError;

/// Claims consumed from the identity provider's JWT. `exp`/`iat` are verified
/// by `jsonwebtoken` itself; everything else is read out by hand.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    email: Option<String>,
    role: Option<String>,
}

/// The authenticated identity attached to a request after it passes the gate.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: Uuid,
    /// `workspace_id` when the caller supplied one, else `user_id`.
    pub universal_id: Uuid,
    pub email: Option<String>,
    pub role: Option<String>,
    /// A per-request id, generated fresh for every request that passes the
    /// gate, used to correlate this request's log lines.
    pub request_id: Uuid,
}

/// External collaborator that checks whether a user belongs to a workspace.
/// Out of scope for this crate: user-profile CRUD and team membership live
/// in a separate service; this is only the interface the gate calls through.
#[async_trait]
pub trait WorkspaceAccessVerifier: Send + Sync + 'static {
    async fn verify(&self, user_id: Uuid, workspace_id: Uuid) -> anyhow::Result<bool>;
}

/// Shared state for the [`auth_gate`] middleware.
#[derive(Clone)]
pub struct AuthGateState {
    decoding_key: Arc<DecodingKey>,
    validation: Arc<Validation>,
    workspace_verifier: Option<Arc<dyn WorkspaceAccessVerifier>>,
}

impl AuthGateState {
    pub fn new(hmac_secret: &[u8]) -> Self {
        Self::with_workspace_verifier(hmac_secret, None)
    }

    pub fn with_workspace_verifier(
        hmac_secret: &[u8],
        workspace_verifier: Option<Arc<dyn WorkspaceAccessVerifier>>,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `aud` isn't part of this service's wire contract.
        validation.validate_aud = false;
        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(hmac_secret)),
            validation: Arc::new(validation),
            workspace_verifier,
        }
    }
}

/// Axum middleware implementing C9. Reject with the documented 401/403
/// kinds; on success, stash an [`AuthContext`] in the request extensions for
/// downstream handlers to pull out via the `Extension` extractor.
pub async fn auth_gate(
    State(state): State<AuthGateState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppApiError> {
    let header = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .ok_or_else(|| AppApiError::auth("missing Authorization header"))?;
    let header_str = header
        .to_str()
        .map_err(|_| AppApiError::auth("Authorization header was not ASCII"))?;
    let token = header_str
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppApiError::auth("Authorization header was not Bearer-prefixed"))?;

    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &state.decoding_key,
        &state.validation,
    )
    .map_err(|e| AppApiError::auth(format!("invalid token: {e}")))?;

    let claims = token_data.claims;
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| AppApiError::auth("sub claim was not a valid uuid"))?;

    let workspace_id = match request.headers().get("x-workspace-id") {
        Some(value) => {
            let s = value
                .to_str()
                .map_err(|_| AppApiError::auth("X-Workspace-Id was not ASCII"))?;
            Some(
                Uuid::parse_str(s)
                    .map_err(|_| AppApiError::auth("X-Workspace-Id was not a valid uuid"))?,
            )
        }
        None => None,
    };

    if let (Some(verifier), Some(workspace_id)) =
        (state.workspace_verifier.as_ref(), workspace_id)
    {
        let allowed = verifier
            .verify(user_id, workspace_id)
            .await
            .map_err(|e| AppApiError::auth(format!("workspace access check failed: {e:#}")))?;
        if !allowed {
            return Err(AppApiError::authorization(
                "user does not belong to the requested workspace",
            ));
        }
    }

    let universal_id = workspace_id.unwrap_or(user_id);
    let ctx = AuthContext {
        user_id,
        universal_id,
        email: claims.email,
        role: claims.role,
        request_id: Uuid::new_v4(),
    };
    request.extensions_mut().insert(ctx);

    Ok(next.run(request).await)
}

#[cfg(test)]
mod test {
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;

    const SECRET: &[u8] = b"test-hmac-secret";

    fn sign(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    #[test]
    fn decode_accepts_well_formed_claims() {
        let now = 2_000_000_000;
        let user_id = Uuid::new_v4();
        let token = sign(json!({
            "sub": user_id.to_string(),
            "email": "a@example.com",
            "role": "member",
            "exp": now + 3600,
            "iat": now,
        }));
        let state = AuthGateState::new(SECRET);
        let data = jsonwebtoken::decode::<Claims>(
            &token,
            &state.decoding_key,
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();
        assert_eq!(data.claims.sub, user_id.to_string());
        assert_eq!(data.claims.email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn decode_rejects_wrong_secret() {
        let token = sign(json!({
            "sub": Uuid::new_v4().to_string(),
            "exp": 9_999_999_999i64,
        }));
        let wrong_key = DecodingKey::from_secret(b"wrong-secret");
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        let result = jsonwebtoken::decode::<Claims>(&token, &wrong_key, &validation);
        assert!(result.is_err());
    }
}
