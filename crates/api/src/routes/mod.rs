//! HTTP handlers, one module per component.

pub mod health;
pub mod inventory;
pub mod issuer;
pub mod metrics;
pub mod orders;
pub mod queue;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use common::ActorId;

use crate::error::ApiError;

/// Header carrying the caller's identity. Authentication happens upstream.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// The authenticated caller, taken from [`ACTOR_HEADER`].
#[derive(Debug, Clone)]
pub struct Actor(pub ActorId);

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Actor(ActorId::new(v)))
            .ok_or_else(|| ApiError::BadRequest(format!("missing {ACTOR_HEADER} header")))
    }
}
