//! Result objects returned by session operations.
//!
//! Failures are values here, never errors. Each failure carries a
//! [`FailureSource`] telling local preconditions, authority refusals and
//! transport trouble apart.

use std::collections::BTreeSet;

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::expiry::{ExpiryInfo, ExpiryStatus};
use super::types::{Principal, TokenPair, TokenType};
use crate::authority::{AuthorityError, Claims, RefreshedTokens};

const NO_ACCESS_TOKEN: &str = "No access token found";
const NO_REFRESH_TOKEN: &str = "No refresh token available";
const NOTE_PERSISTED: &str = "New tokens have been updated in the session context.";
const NOTE_NOT_PERSISTED: &str =
    "New tokens obtained but could not be updated in session context.";

/// Where a failed operation broke down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureSource {
    /// The identity authority refused the token.
    #[serde(rename = "rejected")]
    AuthorityRejected,
    /// Network failure, unexpected status, unreadable answer or store failure.
    #[serde(rename = "transport_error")]
    TransportError,
    /// Nothing to send: no session, token or refresh token.
    #[serde(rename = "precondition_failed")]
    LocalPreconditionFailed,
}

impl FailureSource {
    pub fn of(err: &AuthorityError) -> Self {
        if err.is_rejection() {
            Self::AuthorityRejected
        } else {
            Self::TransportError
        }
    }

    /// Legacy `apiError` flag: only set once the authority was contacted.
    pub fn api_error(self) -> Option<bool> {
        match self {
            Self::AuthorityRejected => Some(true),
            Self::TransportError => Some(false),
            Self::LocalPreconditionFailed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorityRejected => "rejected",
            Self::TransportError => "transport_error",
            Self::LocalPreconditionFailed => "precondition_failed",
        }
    }
}

/// Snapshot of the current session: identity plus stored token fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<TokenType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_refresh_token: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_type: Option<TokenType>,
}

impl SessionInfo {
    pub(super) fn with_principal(mut self, principal: &Principal) -> Self {
        self.user_id = Some(principal.subject.clone());
        self.email = principal.email.clone();
        self.name = principal.name.clone();
        self
    }

    pub(super) fn with_tokens(mut self, tokens: &TokenPair) -> Self {
        self.access_token = Some(tokens.access_token.clone());
        self.token_type = Some(tokens.token_type);
        self.scopes = Some(tokens.scopes.clone());
        self.expires_at = tokens.expires_at;

        let refresh_token = tokens.refresh_token();
        self.has_refresh_token = Some(refresh_token.is_some());
        if let Some(refresh_token) = refresh_token {
            self.refresh_token = Some(refresh_token.to_owned());
            self.refresh_token_type = Some(TokenType::Bearer);
        }
        self
    }

    /// Whether any token field was filled in.
    pub fn has_tokens(&self) -> bool {
        self.access_token.is_some()
    }
}

/// Session info and expiry state read from one stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOverview {
    pub session_info: SessionInfo,
    pub expiry_info: Option<ExpiryInfo>,
    pub is_token_expired: bool,
    pub is_token_expiring_soon: bool,
    pub expiry_status: ExpiryStatus,
}

/// Outcome of access token validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<FailureSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<Claims>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<Value>,
}

impl ValidationResult {
    /// Accepted token, common claims copied to top-level fields.
    pub fn valid(claims: Claims) -> Self {
        Self {
            valid: true,
            message: Some("Token is valid".into()),
            user_id: claims.subject().cloned(),
            email: claims.email().cloned(),
            name: claims.name().cloned(),
            exp: claims.expires_at().cloned(),
            iat: claims.issued_at().cloned(),
            iss: claims.issuer().cloned(),
            aud: claims.audience().cloned(),
            claims: Some(claims),
            ..Default::default()
        }
    }

    pub fn no_token() -> Self {
        Self::failure(FailureSource::LocalPreconditionFailed, NO_ACCESS_TOKEN.into())
    }

    pub fn failed(err: &AuthorityError) -> Self {
        let source = FailureSource::of(err);
        let error = match source {
            FailureSource::AuthorityRejected => format!("Token validation failed: {err}"),
            _ => format!("Unexpected error during token validation: {err}"),
        };
        Self::failure(source, error)
    }

    /// Failure before the authority was reached, such as a broken store.
    pub fn unexpected(err: &dyn Display) -> Self {
        Self::failure(
            FailureSource::TransportError,
            format!("Unexpected error during token validation: {err}"),
        )
    }

    fn failure(source: FailureSource, error: String) -> Self {
        Self {
            valid: false,
            error: Some(error),
            source: Some(source),
            api_error: source.api_error(),
            ..Default::default()
        }
    }

    /// Metric label.
    pub fn outcome(&self) -> &'static str {
        match self.source {
            None => "valid",
            Some(source) => source.as_str(),
        }
    }
}

/// Outcome of a token refresh.
///
/// `success` reports the authority call; `tokens_updated_in_context` reports
/// whether the new pair replaced the stored one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<FailureSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_updated_in_context: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip)]
    pub new_token_pair: Option<TokenPair>,
}

impl RefreshResult {
    pub fn refreshed(tokens: RefreshedTokens, pair: TokenPair, persisted: bool) -> Self {
        Self {
            success: true,
            message: Some("Tokens refreshed successfully".into()),
            new_access_token: Some(tokens.access_token),
            new_refresh_token: tokens.refresh_token,
            new_id_token: tokens.id_token,
            tokens_updated_in_context: Some(persisted),
            note: Some(if persisted { NOTE_PERSISTED } else { NOTE_NOT_PERSISTED }.into()),
            new_token_pair: Some(pair),
            ..Default::default()
        }
    }

    pub fn no_refresh_token() -> Self {
        Self::failure(FailureSource::LocalPreconditionFailed, NO_REFRESH_TOKEN.into())
    }

    pub fn failed(err: &AuthorityError) -> Self {
        let source = FailureSource::of(err);
        let error = match source {
            FailureSource::AuthorityRejected => format!("Token refresh failed: {err}"),
            _ => format!("Unexpected error during token refresh: {err}"),
        };
        Self::failure(source, error)
    }

    /// Failure before the authority was reached, such as a broken store.
    pub fn unexpected(err: &dyn Display) -> Self {
        Self::failure(
            FailureSource::TransportError,
            format!("Unexpected error during token refresh: {err}"),
        )
    }

    fn failure(source: FailureSource, error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            source: Some(source),
            api_error: source.api_error(),
            ..Default::default()
        }
    }

    /// Metric label.
    pub fn outcome(&self) -> &'static str {
        match (self.source, self.tokens_updated_in_context) {
            (Some(source), _) => source.as_str(),
            (None, Some(false)) => "not_persisted",
            (None, _) => "refreshed",
        }
    }
}
