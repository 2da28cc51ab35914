//! Session manager keeps the OAuth2 tokens of logged-in users alive.
//!
//! It inspects, validates and refreshes the token pair stored for each
//! authenticated session.

#![forbid(unsafe_code)]

pub mod authority;
pub mod clock;
pub mod config;
pub mod error;
mod router;
pub mod session;
pub mod store;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderName, Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
pub use error::ServerError;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use authority::{HttpAuthority, IdentityAuthority};
use clock::SystemClock;
use session::SessionManager;
use store::{AuthorizedClientStore, MemoryStore, PostgresStore};

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub sessions: Arc<SessionManager>,
    pub metrics: Option<PrometheusHandle>,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
            HeaderName::from_static(router::SECRET_HEADER),
        ]));

    // Only the public status is readable from other origins. Session routes
    // hand out tokens and stay same-origin.
    let public = Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::OPTIONS])
                .allow_headers(Any),
        );

    Router::new()
        .merge(public)
        // `GET /metrics` goes to `metrics`.
        .route("/metrics", get(router::status::metrics))
        .merge(router::sessions::router())
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Token store picked from configuration.
async fn store(
    config: &config::Configuration,
) -> error::Result<Arc<dyn AuthorizedClientStore>> {
    let Some(cfg) = &config.postgres else {
        tracing::warn!("missing `postgres` entry on `config.yaml` file, tokens are kept in memory");
        return Ok(Arc::new(MemoryStore::new()));
    };

    let username = cfg
        .username
        .as_deref()
        .unwrap_or(store::postgres::DEFAULT_CREDENTIALS);
    let password = cfg
        .password
        .as_deref()
        .unwrap_or(store::postgres::DEFAULT_CREDENTIALS);
    let database = cfg
        .database
        .as_deref()
        .unwrap_or(store::postgres::DEFAULT_DATABASE_NAME);

    let postgres = PostgresStore::connect(
        &cfg.address,
        username,
        password,
        database,
        cfg.pool_size.unwrap_or(store::postgres::DEFAULT_POOL_SIZE),
    )
    .await
    .map_err(|err| ServerError::Internal {
        details: "cannot connect to PostgreSQL".into(),
        source: Some(Box::new(err)),
    })?;

    // execute migrations scripts on start.
    postgres.migrate().await?;

    Ok(Arc::new(postgres))
}

/// Identity authority client from configuration.
fn authority(config: &config::Configuration) -> error::Result<Arc<dyn IdentityAuthority>> {
    let cfg = config
        .authority
        .as_ref()
        .ok_or(ServerError::MissingConfig("authority"))?;

    let mut authority =
        HttpAuthority::new(&url::Url::parse(&cfg.url)?, &cfg.client_id, &cfg.client_secret)?;
    if let Some(timeout) = cfg.timeout() {
        authority = authority.with_timeout(timeout)?;
    }

    tracing::info!(
        token_url = %authority.token_url(),
        introspection_url = %authority.introspection_url(),
        "identity authority configured"
    );

    Ok(Arc::new(authority))
}

/// Initialize the application state.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
    metrics: Option<PrometheusHandle>,
) -> error::Result<AppState> {
    let authority = authority(&config)?;
    let store = store(&config).await?;

    if config.session.context_secret.as_deref().is_none_or(str::is_empty) {
        tracing::warn!("missing `session.context_secret`, every caller is treated as anonymous");
    }

    let sessions = SessionManager::new(store, authority, Arc::new(SystemClock::new()))
        .with_settings(config.session.settings());

    Ok(AppState {
        config,
        sessions: Arc::new(sessions),
        metrics,
    })
}

/// Proxy secret configured on [`TestApp`].
#[cfg(test)]
pub(crate) const TEST_CONTEXT_SECRET: &str = "test-proxy-secret";

/// Application wired to in-memory doubles.
#[cfg(test)]
pub(crate) struct TestApp {
    pub store: Arc<MemoryStore>,
    pub authority: Arc<authority::testing::ScriptedAuthority>,
    pub clock: Arc<clock::FixedClock>,
    pub state: AppState,
}

#[cfg(test)]
impl TestApp {
    pub fn new(authority: authority::testing::ScriptedAuthority) -> Self {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(authority);
        let clock = Arc::new(clock::FixedClock::epoch());
        let mut config = config::Configuration::default();
        config.session.context_secret = Some(TEST_CONTEXT_SECRET.into());
        let config = Arc::new(config);
        let sessions = SessionManager::new(store.clone(), authority.clone(), clock.clone())
            .with_settings(config.session.settings());

        Self {
            store,
            authority,
            clock,
            state: AppState {
                config,
                sessions: Arc::new(sessions),
                metrics: None,
            },
        }
    }

    pub fn router(&self) -> Router {
        app(self.state.clone())
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        clock::Clock::now(self.clock.as_ref())
    }
}

#[cfg(test)]
impl Default for TestApp {
    fn default() -> Self {
        use authority::RefreshedTokens;
        use authority::testing::{ScriptedAuthority, claims};
        use serde_json::json;

        Self::new(ScriptedAuthority::accepting(
            claims(&[("sub", json!("usr_1")), ("active", json!(true))]),
            RefreshedTokens {
                access_token: "B".into(),
                refresh_token: Some("R2".into()),
                id_token: None,
                expires_in: None,
                scopes: None,
            },
        ))
    }
}

/// MUST NEVER be used in production.
#[cfg(test)]
pub(crate) async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        request = request.header(*name, *value);
    }

    app.oneshot(request.body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap()
}
