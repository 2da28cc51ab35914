//! Configuration manager for the session service.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::session::SessionSettings;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const CONFIG_PATH_ENV: &str = "CONFIG_PATH";
const CLIENT_SECRET_ENV: &str = "AUTHORITY_CLIENT_SECRET";
const CONTEXT_SECRET_ENV: &str = "SESSION_CONTEXT_SECRET";

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_REGISTRATION_ID: &str = "scalekit";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public URL of current instance.
    pub url: String,
    /// Listening port.
    pub port: Option<u16>,
    #[serde(skip)]
    path: PathBuf,
    /// Related to the OAuth2 identity authority.
    #[serde(skip_serializing)]
    pub authority: Option<Authority>,
    /// Related to session token handling.
    #[serde(default)]
    pub session: Session,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to OpenTelemetry export.
    #[serde(skip_serializing)]
    pub telemetry: Option<Telemetry>,
}

/// Identity authority configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authority {
    /// Base URL of the authority environment.
    pub url: String,
    /// OAuth2 client identifier.
    pub client_id: String,
    /// OAuth2 client secret.
    /// Overridden by `AUTHORITY_CLIENT_SECRET`.
    #[serde(default)]
    pub client_secret: String,
    /// Request timeout in seconds.
    pub timeout: Option<u64>,
}

impl Authority {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Session token configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    /// Client registration the stored token pairs belong to.
    pub registration_id: String,
    /// Threshold used by "expiring soon" checks.
    pub expiring_soon_minutes: i64,
    /// Seconds given to refreshed tokens without `expires_in`.
    pub default_token_lifetime: i64,
    /// Secret the login proxy sends in `x-auth-secret` so identity headers
    /// are trusted. Every caller is anonymous without it.
    /// Overridden by `SESSION_CONTEXT_SECRET`.
    #[serde(skip_serializing)]
    pub context_secret: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        let settings = SessionSettings::default();
        Self {
            registration_id: DEFAULT_REGISTRATION_ID.into(),
            expiring_soon_minutes: settings.expiring_soon_minutes,
            default_token_lifetime: settings.default_token_lifetime.num_seconds(),
            context_secret: None,
        }
    }
}

impl Session {
    /// Settings for the session manager. Non-positive values fall back to
    /// defaults.
    pub fn settings(&self) -> SessionSettings {
        let defaults = SessionSettings::default();
        SessionSettings {
            expiring_soon_minutes: if self.expiring_soon_minutes > 0 {
                self.expiring_soon_minutes
            } else {
                defaults.expiring_soon_minutes
            },
            default_token_lifetime: Some(self.default_token_lifetime)
                .filter(|secs| *secs > 0)
                .and_then(TimeDelta::try_seconds)
                .unwrap_or(defaults.default_token_lifetime),
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// OpenTelemetry configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    /// gRPC endpoint of the OTLP collector.
    pub otlp_endpoint: Option<String>,
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Replace the authority secret when one is given.
    fn override_secret(&mut self, secret: Option<String>) {
        if let (Some(authority), Some(secret)) = (self.authority.as_mut(), secret) {
            if !secret.is_empty() {
                authority.client_secret = secret;
            }
        }
    }

    /// Replace the context secret when one is given.
    fn override_context_secret(&mut self, secret: Option<String>) {
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            self.session.context_secret = Some(secret);
        }
    }

    /// Reads the `config.yaml` file from the specified path, `CONFIG_PATH`,
    /// or the default location.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            self.path.clone()
        } else {
            std::env::var(CONFIG_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| Path::new(DEFAULT_CONFIG_PATH).to_path_buf())
        };

        match File::open(&file_path) {
            Ok(file) => {
                let mut config: Configuration =
                    match serde_yaml::from_reader(file) {
                        Ok(config) => config,
                        Err(err) => {
                            return Ok(Arc::new(self.error(err)));
                        },
                    };

                config.path = file_path;

                // normalize URLs.
                if !config.url.is_empty() {
                    config.url = self.normalize_url(&config.url)?;
                }
                if let Some(authority) = config.authority.as_mut() {
                    authority.url = self.normalize_url(&authority.url)?;
                }

                config.override_secret(std::env::var(CLIENT_SECRET_ENV).ok());
                config.override_context_secret(std::env::var(CONTEXT_SECRET_ENV).ok());

                Ok(Arc::new(config))
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "cannot read `config.yaml` file");
        Self::default()
    }
}
