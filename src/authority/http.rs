//! OAuth2 identity authority over HTTP.
//!
//! Validation uses token introspection (RFC 7662), refresh uses the
//! `refresh_token` grant of the token endpoint. Both authenticate with the
//! client credentials.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use super::{AuthorityError, Claims, IdentityAuthority, RefreshedTokens, Result};

const TOKEN_PATH: &str = "oauth/token";
const INTROSPECTION_PATH: &str = "oauth/introspect";

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TryFrom<TokenResponse> for RefreshedTokens {
    type Error = AuthorityError;

    fn try_from(response: TokenResponse) -> Result<Self> {
        if response.access_token.is_empty() {
            return Err(AuthorityError::Malformed(
                "token response without access_token".into(),
            ));
        }

        Ok(Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
            id_token: response.id_token.filter(|t| !t.is_empty()),
            expires_in: response.expires_in,
            scopes: response
                .scope
                .map(|s| s.split_whitespace().map(str::to_owned).collect()),
        })
    }
}

/// OAuth2 error body.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// `reqwest` client for an OAuth2 identity authority.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    client_id: String,
    client_secret: String,
    token_url: Url,
    introspection_url: Url,
    http: reqwest::Client,
}

impl HttpAuthority {
    /// Create a client for the authority rooted at `base_url`.
    pub fn new(
        base_url: &Url,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> std::result::Result<Self, url::ParseError> {
        Ok(Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: endpoint(base_url, TOKEN_PATH)?,
            introspection_url: endpoint(base_url, INTROSPECTION_PATH)?,
            http: reqwest::Client::new(),
        })
    }

    /// Use a client with a request timeout.
    pub fn with_timeout(
        mut self,
        timeout: Duration,
    ) -> std::result::Result<Self, reqwest::Error> {
        self.http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    #[must_use]
    pub fn with_token_url(mut self, url: Url) -> Self {
        self.token_url = url;
        self
    }

    #[must_use]
    pub fn with_introspection_url(mut self, url: Url) -> Self {
        self.introspection_url = url;
        self
    }

    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    pub fn introspection_url(&self) -> &Url {
        &self.introspection_url
    }

    /// Turn a non-success response into the matching [`AuthorityError`].
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::debug!(operation, status = status.as_u16(), %body, "authority refused request");

        if status.is_client_error() {
            Err(AuthorityError::Rejected {
                status: Some(status.as_u16()),
                message: rejection_message(&body, status.as_u16()),
            })
        } else {
            Err(AuthorityError::Unavailable {
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl IdentityAuthority for HttpAuthority {
    async fn validate(&self, access_token: &str) -> Result<Claims> {
        let params = [
            ("token", access_token),
            ("token_type_hint", "access_token"),
        ];

        let response = self
            .http
            .post(self.introspection_url.clone())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&params)
            .send()
            .await?;

        let response = Self::ensure_success(response, "token introspection").await?;
        introspection_claims(decode(response).await?)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(self.token_url.clone())
            .form(&params)
            .send()
            .await?;

        let response = Self::ensure_success(response, "token refresh").await?;
        decode::<TokenResponse>(response).await?.try_into()
    }
}

/// Read a JSON body. A body that does not decode is a malformed answer,
/// not a transport failure.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|err| AuthorityError::Malformed(err.to_string()))
}

/// Join `path` onto `base`, keeping any path prefix of `base`.
fn endpoint(base: &Url, path: &str) -> std::result::Result<Url, url::ParseError> {
    if base.path().ends_with('/') {
        base.join(path)
    } else {
        Url::parse(&format!("{base}/"))?.join(path)
    }
}

/// Extract claims from an introspection body, rejecting inactive tokens.
fn introspection_claims(body: Value) -> Result<Claims> {
    let Value::Object(mut fields) = body else {
        return Err(AuthorityError::Malformed(
            "introspection response is not an object".into(),
        ));
    };

    match fields.remove("active") {
        Some(Value::Bool(true)) => Ok(Claims::new(fields)),
        Some(Value::Bool(false)) => {
            Err(AuthorityError::rejected("token is not active"))
        },
        _ => Err(AuthorityError::Malformed(
            "introspection response without `active`".into(),
        )),
    }
}

/// Readable message out of an OAuth2 error body.
fn rejection_message(body: &str, status: u16) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(ErrorResponse {
            error,
            error_description: Some(description),
        }) => format!("{error}: {description}"),
        Ok(ErrorResponse { error, .. }) => error,
        Err(_) if !body.trim().is_empty() => body.trim().to_owned(),
        Err(_) => format!("authority rejected the request with status {status}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoints_keep_base_path() {
        let base: Url = "https://acme.authority.dev".parse().unwrap();
        let authority = HttpAuthority::new(&base, "client", "secret").unwrap();
        assert_eq!(
            authority.token_url().as_str(),
            "https://acme.authority.dev/oauth/token"
        );
        assert_eq!(
            authority.introspection_url().as_str(),
            "https://acme.authority.dev/oauth/introspect"
        );

        let base: Url = "https://sso.example.com/tenant".parse().unwrap();
        let authority = HttpAuthority::new(&base, "client", "secret").unwrap();
        assert_eq!(
            authority.token_url().as_str(),
            "https://sso.example.com/tenant/oauth/token"
        );
    }

    #[test]
    fn endpoint_overrides() {
        let base: Url = "https://acme.authority.dev".parse().unwrap();
        let authority = HttpAuthority::new(&base, "client", "secret")
            .unwrap()
            .with_token_url("https://other.dev/token".parse().unwrap());

        assert_eq!(authority.token_url().as_str(), "https://other.dev/token");
    }

    #[test]
    fn active_introspection_yields_claims() {
        let claims = introspection_claims(json!({
            "active": true,
            "sub": "usr_1",
            "email": "jane@acme.dev",
            "exp": 1_760_003_600,
        }))
        .unwrap();

        assert_eq!(claims.subject(), Some(&json!("usr_1")));
        assert_eq!(claims.email(), Some(&json!("jane@acme.dev")));
        assert!(claims.get("active").is_none());
    }

    #[test]
    fn inactive_introspection_is_a_rejection() {
        let err = introspection_claims(json!({ "active": false })).unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(err.to_string(), "token is not active");
    }

    #[test]
    fn introspection_without_active_is_malformed() {
        let err = introspection_claims(json!({ "sub": "usr_1" })).unwrap_err();
        assert!(matches!(err, AuthorityError::Malformed(_)));

        let err = introspection_claims(json!(null)).unwrap_err();
        assert!(matches!(err, AuthorityError::Malformed(_)));
    }

    #[test]
    fn rejection_messages() {
        assert_eq!(
            rejection_message(
                r#"{"error":"invalid_grant","error_description":"refresh token expired"}"#,
                400
            ),
            "invalid_grant: refresh token expired"
        );
        assert_eq!(
            rejection_message(r#"{"error":"invalid_client"}"#, 401),
            "invalid_client"
        );
        assert_eq!(rejection_message("  forbidden \n", 403), "forbidden");
        assert_eq!(
            rejection_message("", 401),
            "authority rejected the request with status 401"
        );
    }

    #[test]
    fn token_response_conversion() {
        let response: TokenResponse = serde_json::from_value(json!({
            "access_token": "new-access",
            "token_type": "Bearer",
            "expires_in": 1800,
            "refresh_token": "new-refresh",
            "scope": "openid profile email",
        }))
        .unwrap();

        let tokens = RefreshedTokens::try_from(response).unwrap();
        assert_eq!(tokens.access_token, "new-access");
        assert_eq!(tokens.refresh_token.as_deref(), Some("new-refresh"));
        assert_eq!(tokens.id_token, None);
        assert_eq!(tokens.expires_in, Some(1800));
        assert_eq!(
            tokens.scopes,
            Some(vec!["openid".into(), "profile".into(), "email".into()])
        );
    }

    #[test]
    fn token_response_without_access_token_is_malformed() {
        let response: TokenResponse =
            serde_json::from_value(json!({ "access_token": "" })).unwrap();

        assert!(matches!(
            RefreshedTokens::try_from(response),
            Err(AuthorityError::Malformed(_))
        ));
    }

    mod over_http {
        use std::collections::HashMap;

        use axum::http::{HeaderMap, StatusCode, header};
        use axum::response::IntoResponse;
        use axum::routing::post;
        use axum::{Form, Json, Router};
        use serde_json::json;

        use super::*;
        use crate::session::FailureSource;

        /// `client:secret` as HTTP basic credentials.
        const BASIC_CREDENTIALS: &str = "Basic Y2xpZW50OnNlY3JldA==";

        /// Serve `router` on a random local port.
        async fn serve(router: Router) -> Url {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
            format!("http://{addr}/").parse().unwrap()
        }

        fn client(base: &Url) -> HttpAuthority {
            HttpAuthority::new(base, "client", "secret")
                .unwrap()
                .with_timeout(Duration::from_secs(5))
                .unwrap()
        }

        async fn introspect(
            headers: HeaderMap,
            Form(form): Form<HashMap<String, String>>,
        ) -> impl IntoResponse {
            let authorization = headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok());
            if authorization != Some(BASIC_CREDENTIALS) {
                return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid_client" })));
            }
            assert_eq!(form["token_type_hint"], "access_token");

            let body = match form["token"].as_str() {
                "A" => json!({ "active": true, "sub": "usr_1", "email": "jane@acme.dev" }),
                _ => json!({ "active": false }),
            };
            (StatusCode::OK, Json(body))
        }

        async fn token(Form(form): Form<HashMap<String, String>>) -> impl IntoResponse {
            assert_eq!(form["grant_type"], "refresh_token");
            assert_eq!(form["client_id"], "client");
            assert_eq!(form["client_secret"], "secret");

            match form["refresh_token"].as_str() {
                "R1" => (
                    StatusCode::OK,
                    Json(json!({
                        "access_token": "B",
                        "token_type": "Bearer",
                        "expires_in": 600,
                        "refresh_token": "R2",
                        "scope": "openid offline_access",
                    })),
                ),
                _ => (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "invalid_grant", "error_description": "revoked" })),
                ),
            }
        }

        fn authority_router() -> Router {
            Router::new()
                .route("/oauth/introspect", post(introspect))
                .route("/oauth/token", post(token))
        }

        #[tokio::test]
        async fn introspection_sends_credentials_and_token() {
            let base = serve(authority_router()).await;
            let authority = client(&base);

            let claims = authority.validate("A").await.unwrap();
            assert_eq!(claims.subject(), Some(&json!("usr_1")));
            assert_eq!(claims.email(), Some(&json!("jane@acme.dev")));

            let err = authority.validate("stale").await.unwrap_err();
            assert!(err.is_rejection());
            assert_eq!(FailureSource::of(&err), FailureSource::AuthorityRejected);

            let err = HttpAuthority::new(&base, "client", "wrong")
                .unwrap()
                .validate("A")
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                AuthorityError::Rejected {
                    status: Some(401),
                    ..
                }
            ));
            assert_eq!(err.to_string(), "invalid_client");
        }

        #[tokio::test]
        async fn refresh_grant_over_http() {
            let authority = client(&serve(authority_router()).await);

            let tokens = authority.refresh("R1").await.unwrap();
            assert_eq!(tokens.access_token, "B");
            assert_eq!(tokens.refresh_token.as_deref(), Some("R2"));
            assert_eq!(tokens.expires_in, Some(600));
            assert_eq!(
                tokens.scopes,
                Some(vec!["openid".into(), "offline_access".into()])
            );

            let err = authority.refresh("R0").await.unwrap_err();
            match &err {
                AuthorityError::Rejected { status, message } => {
                    assert_eq!(*status, Some(400));
                    assert_eq!(message, "invalid_grant: revoked");
                },
                other => panic!("expected a rejection, got {other:?}"),
            }
            assert_eq!(FailureSource::of(&err).api_error(), Some(true));
        }

        #[tokio::test]
        async fn server_errors_are_unavailable() {
            let router = Router::new()
                .route("/oauth/introspect", post(|| async { StatusCode::SERVICE_UNAVAILABLE }))
                .route("/oauth/token", post(|| async { StatusCode::BAD_GATEWAY }));
            let authority = client(&serve(router).await);

            let err = authority.validate("A").await.unwrap_err();
            assert!(matches!(err, AuthorityError::Unavailable { status: 503 }));
            assert_eq!(FailureSource::of(&err).api_error(), Some(false));

            let err = authority.refresh("R1").await.unwrap_err();
            assert!(matches!(err, AuthorityError::Unavailable { status: 502 }));
        }

        #[tokio::test]
        async fn undecodable_bodies_are_malformed() {
            let router = Router::new()
                .route("/oauth/introspect", post(|| async { "<html>maintenance</html>" }))
                .route("/oauth/token", post(|| async { "not json" }));
            let authority = client(&serve(router).await);

            let err = authority.validate("A").await.unwrap_err();
            assert!(matches!(err, AuthorityError::Malformed(_)), "{err:?}");

            let err = authority.refresh("R1").await.unwrap_err();
            assert!(matches!(err, AuthorityError::Malformed(_)), "{err:?}");
            assert_eq!(FailureSource::of(&err), FailureSource::TransportError);
        }

        #[tokio::test]
        async fn unreachable_authority_is_a_transport_error() {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            let base: Url = format!("http://{addr}/").parse().unwrap();

            let err = client(&base).validate("A").await.unwrap_err();
            assert!(matches!(err, AuthorityError::Transport(_)), "{err:?}");
            assert_eq!(FailureSource::of(&err), FailureSource::TransportError);
            assert_eq!(FailureSource::of(&err).api_error(), Some(false));
        }
    }
}
