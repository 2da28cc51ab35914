//! Inspect, validate and refresh the caller's session tokens.
//!
//! Every route answers `200` with a result object, even for anonymous
//! callers or failed authority calls.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use validator::Validate;

use crate::AppState;
use crate::router::Valid;
use crate::session::{RefreshResult, SessionContext, SessionOverview, ValidationResult};

#[derive(Debug, Default, Deserialize, Validate)]
pub struct Params {
    /// Overrides the configured "expiring soon" threshold.
    #[validate(range(min = 1, max = 1440))]
    threshold_minutes: Option<i64>,
}

/// `GET /sessions`.
pub async fn overview(
    State(state): State<AppState>,
    ctx: SessionContext,
    Valid(params): Valid<Params>,
) -> Json<SessionOverview> {
    let threshold = params
        .threshold_minutes
        .unwrap_or(state.sessions.settings().expiring_soon_minutes);

    Json(state.sessions.session_overview(&ctx, threshold).await)
}

/// `POST /sessions/validate-token`.
pub async fn validate_token(
    State(state): State<AppState>,
    ctx: SessionContext,
) -> Json<ValidationResult> {
    Json(state.sessions.validate_current_access_token(&ctx).await)
}

/// `POST /sessions/refresh-token`.
pub async fn refresh_token(
    State(state): State<AppState>,
    ctx: SessionContext,
) -> Json<RefreshResult> {
    Json(state.sessions.refresh_access_token(&ctx).await)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(overview))
        .route("/sessions/validate-token", post(validate_token))
        .route("/sessions/refresh-token", post(refresh_token))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use chrono::TimeDelta;
    use serde_json::{Value, json};

    use crate::authority::testing::{Outcome, ScriptedAuthority};
    use crate::router::{SECRET_HEADER, SUBJECT_HEADER};
    use crate::session::{ClientKey, TokenPair};
    use crate::store::AuthorizedClientStore;
    use crate::{TEST_CONTEXT_SECRET, TestApp, make_request};

    async fn json(response: axum::http::Response<axum::body::Body>) -> Value {
        use http_body_util::BodyExt;

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn subject() -> Vec<(&'static str, &'static str)> {
        vec![(SUBJECT_HEADER, "usr_1"), (SECRET_HEADER, TEST_CONTEXT_SECRET)]
    }

    async fn seeded(app: &TestApp, pair: TokenPair) {
        app.store
            .save(&ClientKey::new("scalekit", "usr_1"), pair)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn overview_for_anonymous_caller() {
        let app = TestApp::new(ScriptedAuthority::new(
            Outcome::Rejected("unused"),
            Outcome::Rejected("unused"),
        ));

        let response = make_request(app.router(), Method::GET, "/sessions", &[]).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["sessionInfo"], json!({}));
        assert_eq!(body["expiryInfo"], Value::Null);
        assert_eq!(body["isTokenExpired"], false);
        assert_eq!(body["isTokenExpiringSoon"], false);
        assert_eq!(body["expiryStatus"], "unknown");
    }

    #[tokio::test]
    async fn forged_identity_headers_see_no_tokens() {
        let app = TestApp::default();
        seeded(&app, TokenPair::bearer("A").with_refresh_token("R")).await;

        for headers in [
            vec![(SUBJECT_HEADER, "usr_1")],
            vec![(SUBJECT_HEADER, "usr_1"), (SECRET_HEADER, "guessed")],
        ] {
            let body =
                json(make_request(app.router(), Method::GET, "/sessions", &headers).await).await;
            assert_eq!(body["sessionInfo"], json!({}));

            let body = json(
                make_request(
                    app.router(),
                    Method::POST,
                    "/sessions/refresh-token",
                    &headers,
                )
                .await,
            )
            .await;
            assert_eq!(body["success"], false);
            assert_eq!(body["error"], "No refresh token available");
        }
        assert_eq!(app.authority.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn overview_with_threshold() {
        let app = TestApp::default();
        seeded(
            &app,
            TokenPair::bearer("A")
                .with_expires_at(app.now() + TimeDelta::minutes(20))
                .with_refresh_token("R"),
        )
        .await;

        let body = json(make_request(app.router(), Method::GET, "/sessions", &subject()).await).await;
        assert_eq!(body["sessionInfo"]["userId"], "usr_1");
        assert_eq!(body["sessionInfo"]["accessToken"], "A");
        assert_eq!(body["sessionInfo"]["hasRefreshToken"], true);
        assert_eq!(body["expiryInfo"]["minutesUntilExpiry"], 20);
        assert_eq!(body["expiryInfo"]["expiryDisplay"], "20 minutes");
        assert_eq!(body["isTokenExpiringSoon"], false);
        assert_eq!(body["expiryStatus"], "active");

        let body = json(
            make_request(
                app.router(),
                Method::GET,
                "/sessions?threshold_minutes=30",
                &subject(),
            )
            .await,
        )
        .await;
        assert_eq!(body["isTokenExpiringSoon"], true);
        assert_eq!(body["expiryInfo"]["isExpiringSoon"], true);
    }

    #[tokio::test]
    async fn overview_rejects_invalid_threshold() {
        let app = TestApp::default();

        let response = make_request(
            app.router(),
            Method::GET,
            "/sessions?threshold_minutes=0",
            &subject(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json(response).await;
        assert_eq!(body["errors"][0]["field"], "threshold_minutes");

        let response = make_request(
            app.router(),
            Method::GET,
            "/sessions?threshold_minutes=soon",
            &subject(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn validate_without_token() {
        let app = TestApp::default();

        let response = make_request(
            app.router(),
            Method::POST,
            "/sessions/validate-token",
            &subject(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["valid"], false);
        assert_eq!(body["error"], "No access token found");
        assert_eq!(body.get("apiError"), None);
        assert_eq!(app.authority.validate_calls(), 0);
    }

    #[tokio::test]
    async fn validate_stored_token() {
        let app = TestApp::default();
        seeded(&app, TokenPair::bearer("A")).await;

        let body = json(
            make_request(
                app.router(),
                Method::POST,
                "/sessions/validate-token",
                &subject(),
            )
            .await,
        )
        .await;
        assert_eq!(body["valid"], true);
        assert_eq!(body["message"], "Token is valid");
        assert_eq!(body["userId"], "usr_1");
    }

    #[tokio::test]
    async fn refresh_rejected_is_still_ok() {
        let app = TestApp::new(ScriptedAuthority::new(
            Outcome::Rejected("unused"),
            Outcome::Rejected("invalid_grant"),
        ));
        seeded(&app, TokenPair::bearer("A").with_refresh_token("R")).await;

        let response = make_request(
            app.router(),
            Method::POST,
            "/sessions/refresh-token",
            &subject(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["apiError"], true);
        assert_eq!(body["error"], "Token refresh failed: invalid_grant");
    }

    #[tokio::test]
    async fn refresh_then_overview_sees_new_token() {
        let app = TestApp::default();
        seeded(
            &app,
            TokenPair::bearer("A")
                .with_expires_at(app.now() - TimeDelta::minutes(10))
                .with_refresh_token("R"),
        )
        .await;

        let body = json(
            make_request(
                app.router(),
                Method::POST,
                "/sessions/refresh-token",
                &subject(),
            )
            .await,
        )
        .await;
        assert_eq!(body["success"], true);
        assert_eq!(body["tokensUpdatedInContext"], true);
        assert_eq!(body.get("newTokenPair"), None);

        let body = json(make_request(app.router(), Method::GET, "/sessions", &subject()).await).await;
        assert_eq!(body["sessionInfo"]["accessToken"], "B");
        assert_eq!(body["isTokenExpired"], false);
        assert_eq!(body["expiryInfo"]["expiryDisplay"], "60 minutes");
    }
}
