use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Request},
    http::request::Parts,
    Json,
};
use serde::de::DeserializeOwned;
use service_core::error::AppError;
use service_core::middleware::tracing::ACTOR_ID_HEADER;
use uuid::Uuid;
use validator::Validate;

/// Caller identity from `x-actor-id`, set by the upstream auth layer.
///
/// Absent means an anonymous/system call; a malformed value is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActorId(pub Option<Uuid>);

#[async_trait]
impl<S> FromRequestParts<S> for ActorId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(raw) = parts.headers.get(ACTOR_ID_HEADER) else {
            return Ok(ActorId(None));
        };
        let actor_id = raw
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!("{} must be a UUID", ACTOR_ID_HEADER))
            })?;

        tracing::Span::current().record("actor_id", tracing::field::display(actor_id));

        Ok(ActorId(Some(actor_id)))
    }
}

/// JSON body that has passed its `validator` rules.
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Json parse error: {}", e)))?;

        value.validate()?;

        Ok(ValidatedJson(value))
    }
}
