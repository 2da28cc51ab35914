//! Identity authority port.
//!
//! The authority issues, introspects and refreshes access tokens. Token
//! cryptography stays on its side; this crate only consumes its answers.

mod http;

pub use http::HttpAuthority;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Result<T> = std::result::Result<T, AuthorityError>;

/// Errors returned by an [`IdentityAuthority`].
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    /// The authority looked at the token and said no.
    #[error("{message}")]
    Rejected {
        status: Option<u16>,
        message: String,
    },

    #[error("identity authority unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("identity authority answered with status {status}")]
    Unavailable { status: u16 },

    #[error("malformed identity authority response: {0}")]
    Malformed(String),
}

impl AuthorityError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the authority itself refused the request.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Claims returned by token introspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn new(claims: Map<String, Value>) -> Self {
        Self(claims)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn subject(&self) -> Option<&Value> {
        self.get("sub")
    }

    pub fn email(&self) -> Option<&Value> {
        self.get("email")
    }

    pub fn name(&self) -> Option<&Value> {
        self.get("name")
    }

    pub fn expires_at(&self) -> Option<&Value> {
        self.get("exp")
    }

    pub fn issued_at(&self) -> Option<&Value> {
        self.get("iat")
    }

    pub fn issuer(&self) -> Option<&Value> {
        self.get("iss")
    }

    /// `aud` is either a string or an array of strings.
    pub fn audience(&self) -> Option<&Value> {
        self.get("aud")
    }
}

impl From<Map<String, Value>> for Claims {
    fn from(claims: Map<String, Value>) -> Self {
        Self(claims)
    }
}

/// Tokens issued by a successful refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Rotated refresh token, if the authority issued one.
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    /// Lifetime of the new access token, in seconds.
    pub expires_in: Option<i64>,
    pub scopes: Option<Vec<String>>,
}

/// Port to the external identity authority.
#[async_trait]
pub trait IdentityAuthority: Send + Sync {
    /// Introspect `access_token` and return its claims.
    async fn validate(&self, access_token: &str) -> Result<Claims>;

    /// Exchange `refresh_token` for a new token set.
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted authority double.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Canned outcome for one authority call.
    #[derive(Clone)]
    pub enum Outcome<T> {
        Ok(T),
        Rejected(&'static str),
        Malformed(&'static str),
    }

    impl<T: Clone> Outcome<T> {
        fn play(&self) -> Result<T> {
            match self {
                Outcome::Ok(value) => Ok(value.clone()),
                Outcome::Rejected(message) => {
                    Err(AuthorityError::rejected(*message))
                },
                Outcome::Malformed(message) => {
                    Err(AuthorityError::Malformed((*message).to_owned()))
                },
            }
        }
    }

    /// Authority answering every call with a fixed outcome.
    pub struct ScriptedAuthority {
        validate: Outcome<Claims>,
        refresh: Outcome<RefreshedTokens>,
        pub validate_calls: AtomicUsize,
        pub refresh_calls: AtomicUsize,
        pub seen_refresh_tokens: Mutex<Vec<String>>,
    }

    impl ScriptedAuthority {
        pub fn new(
            validate: Outcome<Claims>,
            refresh: Outcome<RefreshedTokens>,
        ) -> Self {
            Self {
                validate,
                refresh,
                validate_calls: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
                seen_refresh_tokens: Mutex::new(Vec::new()),
            }
        }

        /// Accepts every token and answers every refresh with `refreshed`.
        pub fn accepting(claims: Claims, refreshed: RefreshedTokens) -> Self {
            Self::new(Outcome::Ok(claims), Outcome::Ok(refreshed))
        }

        pub fn validate_calls(&self) -> usize {
            self.validate_calls.load(Ordering::SeqCst)
        }

        pub fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentityAuthority for ScriptedAuthority {
        async fn validate(&self, _access_token: &str) -> Result<Claims> {
            self.validate_calls.fetch_add(1, Ordering::SeqCst);
            self.validate.play()
        }

        async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_refresh_tokens
                .lock()
                .unwrap()
                .push(refresh_token.to_owned());
            self.refresh.play()
        }
    }

    pub fn claims(pairs: &[(&str, Value)]) -> Claims {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect::<Map<String, Value>>()
            .into()
    }
}
