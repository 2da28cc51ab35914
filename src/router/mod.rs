//! HTTP API.
pub mod sessions;
pub mod status;

use axum::extract::{FromRequestParts, Query};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::session::{Principal, SessionContext};
use crate::{AppState, ServerError};

pub const SUBJECT_HEADER: &str = "x-auth-subject";
pub const EMAIL_HEADER: &str = "x-auth-email";
pub const NAME_HEADER: &str = "x-auth-name";
pub const REGISTRATION_HEADER: &str = "x-auth-registration";
/// Shared secret proving the identity headers come from the login proxy.
pub const SECRET_HEADER: &str = "x-auth-secret";

/// Query string deserialized then validated.
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<T, S> FromRequestParts<S> for Valid<T>
where
    T: DeserializeOwned + Validate + Send,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Compare without exiting on the first differing byte.
fn secret_matches(given: &str, expected: &str) -> bool {
    given.len() == expected.len()
        && given
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

/// Build the context from headers set by the login proxy in front.
///
/// Identity headers are ignored unless `x-auth-secret` carries the
/// configured secret. Without a configured secret every caller is anonymous.
fn session_context(
    headers: &HeaderMap,
    secret: Option<&str>,
    default_registration: &str,
) -> SessionContext {
    let Some(subject) = header(headers, SUBJECT_HEADER) else {
        return SessionContext::anonymous();
    };

    let trusted = match (secret, header(headers, SECRET_HEADER)) {
        (Some(expected), Some(given)) => secret_matches(given, expected),
        _ => false,
    };
    if !trusted {
        tracing::warn!(
            subject,
            configured = secret.is_some(),
            "identity headers without a valid proxy secret"
        );
        return SessionContext::anonymous();
    }

    let mut principal = Principal::new(subject);
    if let Some(email) = header(headers, EMAIL_HEADER) {
        principal = principal.with_email(email);
    }
    if let Some(name) = header(headers, NAME_HEADER) {
        principal = principal.with_name(name);
    }
    let registration = header(headers, REGISTRATION_HEADER).unwrap_or(default_registration);

    SessionContext::authenticated(principal, registration)
}

impl FromRequestParts<AppState> for SessionContext {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let session = &state.config.session;
        let ctx = session_context(
            &parts.headers,
            session.context_secret.as_deref().filter(|s| !s.is_empty()),
            &session.registration_id,
        );
        if !ctx.is_authenticated() {
            tracing::debug!("request without authenticated principal");
        }
        Ok(ctx)
    }
}
