//! PostgreSQL store.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{AuthorizedClient, AuthorizedClientStore, Result, StoreError};
use crate::session::types::{ClientKey, TokenPair, TokenType};

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "sessions";
pub const DEFAULT_POOL_SIZE: u32 = 10;

const SELECT_CLIENT: &str = r#"
    SELECT registration_id, principal_name, access_token, token_type,
           issued_at, expires_at, refresh_token, scopes, version
    FROM authorized_clients
    WHERE registration_id = $1 AND principal_name = $2"#;

/// Authorized clients in the `authorized_clients` table.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pub postgres: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct ClientRow {
    registration_id: String,
    principal_name: String,
    access_token: String,
    token_type: String,
    issued_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    refresh_token: Option<String>,
    scopes: Vec<String>,
    version: i64,
}

impl TryFrom<ClientRow> for AuthorizedClient {
    type Error = StoreError;

    fn try_from(row: ClientRow) -> Result<Self> {
        let token_type = match row.token_type.as_str() {
            t if t.eq_ignore_ascii_case("bearer") => TokenType::Bearer,
            other => {
                return Err(StoreError::Corrupted(format!(
                    "unknown token type `{other}`"
                )));
            },
        };
        let version = u64::try_from(row.version)
            .map_err(|_| StoreError::Corrupted(format!("negative version {}", row.version)))?;

        Ok(Self {
            key: ClientKey::new(row.registration_id, row.principal_name),
            tokens: TokenPair {
                access_token: row.access_token,
                token_type,
                issued_at: row.issued_at,
                expires_at: row.expires_at,
                refresh_token: row.refresh_token,
                scopes: row.scopes.into_iter().collect(),
            },
            version,
        })
    }
}

fn to_db_version(version: u64) -> Result<i64> {
    i64::try_from(version)
        .map_err(|_| StoreError::Corrupted(format!("version {version} out of range")))
}

impl PostgresStore {
    /// Init database connections.
    pub async fn connect(
        hostname: &str,
        username: &str,
        password: &str,
        db: &str,
        pool: u32,
    ) -> Result<Self> {
        let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
        let pool = PgPoolOptions::new().max_connections(pool);
        let postgres = pool.connect(&addr).await?;

        tracing::info!(%hostname, %db, "postgres connected");

        Ok(Self { postgres })
    }

    pub fn from_pool(postgres: PgPool) -> Self {
        Self { postgres }
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!().run(&self.postgres).await
    }

    async fn current_version(&self, key: &ClientKey) -> Result<Option<i64>> {
        let version = sqlx::query_scalar::<_, i64>(
            "SELECT version FROM authorized_clients WHERE registration_id = $1 AND principal_name = $2",
        )
        .bind(&key.registration_id)
        .bind(&key.principal_name)
        .fetch_optional(&self.postgres)
        .await?;

        Ok(version)
    }
}

#[async_trait]
impl AuthorizedClientStore for PostgresStore {
    async fn load(&self, key: &ClientKey) -> Result<Option<AuthorizedClient>> {
        sqlx::query_as::<_, ClientRow>(SELECT_CLIENT)
            .bind(&key.registration_id)
            .bind(&key.principal_name)
            .fetch_optional(&self.postgres)
            .await?
            .map(AuthorizedClient::try_from)
            .transpose()
    }

    async fn save(&self, key: &ClientKey, tokens: TokenPair) -> Result<u64> {
        let scopes: Vec<String> = tokens.scopes.into_iter().collect();

        let version = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO authorized_clients
                (registration_id, principal_name, access_token, token_type,
                 issued_at, expires_at, refresh_token, scopes, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1)
            ON CONFLICT (registration_id, principal_name) DO UPDATE SET
                access_token = EXCLUDED.access_token,
                token_type = EXCLUDED.token_type,
                issued_at = EXCLUDED.issued_at,
                expires_at = EXCLUDED.expires_at,
                refresh_token = EXCLUDED.refresh_token,
                scopes = EXCLUDED.scopes,
                version = authorized_clients.version + 1,
                updated_at = now()
            RETURNING version"#,
        )
        .bind(&key.registration_id)
        .bind(&key.principal_name)
        .bind(&tokens.access_token)
        .bind(tokens.token_type.as_str())
        .bind(tokens.issued_at)
        .bind(tokens.expires_at)
        .bind(&tokens.refresh_token)
        .bind(&scopes)
        .fetch_one(&self.postgres)
        .await?;

        u64::try_from(version)
            .map_err(|_| StoreError::Corrupted(format!("negative version {version}")))
    }

    async fn replace(
        &self,
        key: &ClientKey,
        expected_version: u64,
        tokens: TokenPair,
    ) -> Result<u64> {
        let scopes: Vec<String> = tokens.scopes.into_iter().collect();

        let version = sqlx::query_scalar::<_, i64>(
            r#"UPDATE authorized_clients SET
                access_token = $4,
                token_type = $5,
                issued_at = $6,
                expires_at = $7,
                refresh_token = $8,
                scopes = $9,
                version = version + 1,
                updated_at = now()
            WHERE registration_id = $1 AND principal_name = $2 AND version = $3
            RETURNING version"#,
        )
        .bind(&key.registration_id)
        .bind(&key.principal_name)
        .bind(to_db_version(expected_version)?)
        .bind(&tokens.access_token)
        .bind(tokens.token_type.as_str())
        .bind(tokens.issued_at)
        .bind(tokens.expires_at)
        .bind(&tokens.refresh_token)
        .bind(&scopes)
        .fetch_optional(&self.postgres)
        .await?;

        if let Some(version) = version {
            return u64::try_from(version)
                .map_err(|_| StoreError::Corrupted(format!("negative version {version}")));
        }

        // Nothing matched: either the row is gone or someone wrote first.
        match self.current_version(key).await? {
            Some(found) => Err(StoreError::Conflict {
                key: key.clone(),
                expected: expected_version,
                found: u64::try_from(found).unwrap_or_default(),
            }),
            None => Err(StoreError::NotFound(key.clone())),
        }
    }
}
