//! Session data model.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of the authenticated end user, supplied by the login layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Subject identifier (`sub`).
    pub subject: String,
    pub email: Option<String>,
    /// Display name.
    pub name: Option<String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            email: None,
            name: None,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Key of an authorized-client record: `(registration_id, principal_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey {
    pub registration_id: String,
    pub principal_name: String,
}

impl ClientKey {
    pub fn new(
        registration_id: impl Into<String>,
        principal_name: impl Into<String>,
    ) -> Self {
        Self {
            registration_id: registration_id.into(),
            principal_name: principal_name.into(),
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registration_id, self.principal_name)
    }
}

/// Authentication context of one inbound request.
///
/// Passed explicitly to every [`SessionManager`](super::SessionManager)
/// operation. An anonymous context has neither a principal nor a client key.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub principal: Option<Principal>,
    pub client: Option<ClientKey>,
}

impl SessionContext {
    /// Context with no authenticated user.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Context for a principal logged in through `registration_id`.
    ///
    /// The principal name of the record key is the subject.
    pub fn authenticated(
        principal: Principal,
        registration_id: impl Into<String>,
    ) -> Self {
        let client = ClientKey::new(registration_id, principal.subject.clone());
        Self {
            principal: Some(principal),
            client: Some(client),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }
}

/// Access token type. OAuth2 only defines `Bearer` for this flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    #[default]
    Bearer,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Bearer => "Bearer",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access/refresh token pair held for one authorized client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub token_type: TokenType,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Absent refresh token means refresh must fail without a network call.
    pub refresh_token: Option<String>,
    pub scopes: BTreeSet<String>,
}

impl TokenPair {
    /// Bearer token without expiry, refresh token or scopes.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: TokenType::Bearer,
            issued_at: None,
            expires_at: None,
            refresh_token: None,
            scopes: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_issued_at(mut self, issued_at: DateTime<Utc>) -> Self {
        self.issued_at = Some(issued_at);
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Refresh token, ignoring empty values.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }
}
