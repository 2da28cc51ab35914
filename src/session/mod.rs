//! Session token lifecycle.
//!
//! [`SessionManager`] reads the token pair stored for the caller's
//! [`SessionContext`], reports its state, validates it against the identity
//! authority and refreshes it. No operation returns an error: missing data
//! degrades to partial results and failures are carried inside
//! [`ValidationResult`] and [`RefreshResult`].

pub mod expiry;
pub mod result;
pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::TimeDelta;

use crate::authority::{IdentityAuthority, RefreshedTokens};
use crate::clock::Clock;
use crate::store::{self, AuthorizedClient, AuthorizedClientStore};
pub use expiry::{ExpiryInfo, ExpiryStatus};
pub use result::{FailureSource, RefreshResult, SessionInfo, SessionOverview, ValidationResult};
pub use types::{ClientKey, Principal, SessionContext, TokenPair, TokenType};

/// Default lifetime of a refreshed access token when the authority omits it.
pub const DEFAULT_TOKEN_LIFETIME: TimeDelta = TimeDelta::hours(1);

/// Tunables of the [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Minutes under which a token counts as expiring soon.
    pub expiring_soon_minutes: i64,
    /// Lifetime given to refreshed tokens without `expires_in`.
    pub default_token_lifetime: TimeDelta,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            expiring_soon_minutes: expiry::DEFAULT_EXPIRING_SOON_MINUTES,
            default_token_lifetime: DEFAULT_TOKEN_LIFETIME,
        }
    }
}

type RefreshLock = Arc<tokio::sync::Mutex<()>>;

/// Refresh lock of one key and the number of leases waiting on or holding it.
#[derive(Default)]
struct RefreshSlot {
    lock: RefreshLock,
    holders: usize,
}

type RefreshSlots = Mutex<HashMap<ClientKey, RefreshSlot>>;

/// Claim on the refresh lock of a key.
///
/// Dropping the lease, including from a cancelled future, gives the claim
/// back and removes the slot once nobody else holds one.
struct RefreshLease<'a> {
    slots: &'a RefreshSlots,
    key: &'a ClientKey,
    lock: RefreshLock,
}

impl<'a> RefreshLease<'a> {
    fn acquire(slots: &'a RefreshSlots, key: &'a ClientKey) -> Self {
        let mut map = slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = map.entry(key.clone()).or_default();
        slot.holders += 1;

        Self {
            slots,
            key,
            lock: Arc::clone(&slot.lock),
        }
    }
}

impl Drop for RefreshLease<'_> {
    fn drop(&mut self) {
        let mut map = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let unused = match map.get_mut(self.key) {
            Some(slot) => {
                slot.holders = slot.holders.saturating_sub(1);
                slot.holders == 0
            },
            None => false,
        };
        if unused {
            map.remove(self.key);
        }
    }
}

/// Token lifecycle operations over an authorized-client store.
pub struct SessionManager {
    store: Arc<dyn AuthorizedClientStore>,
    authority: Arc<dyn IdentityAuthority>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    refresh_locks: RefreshSlots,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn AuthorizedClientStore>,
        authority: Arc<dyn IdentityAuthority>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            authority,
            clock,
            settings: SessionSettings::default(),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    async fn load(&self, ctx: &SessionContext) -> store::Result<Option<AuthorizedClient>> {
        match &ctx.client {
            Some(key) => self.store.load(key).await,
            None => Ok(None),
        }
    }

    /// Stored record for the context. Store failures count as no record.
    async fn authorized_client(&self, ctx: &SessionContext) -> Option<AuthorizedClient> {
        self.load(ctx).await.unwrap_or_else(|err| {
            tracing::warn!(key = ?ctx.client, error = %err, "cannot load authorized client");
            None
        })
    }

    fn session_info(ctx: &SessionContext, client: Option<&AuthorizedClient>) -> SessionInfo {
        let mut info = SessionInfo::default();

        if let Some(principal) = &ctx.principal {
            info = info.with_principal(principal);
        }
        if let Some(client) = client {
            info = info.with_tokens(&client.tokens);
        }

        info
    }

    /// Identity fields of the principal merged with the stored token fields.
    pub async fn current_session_info(&self, ctx: &SessionContext) -> SessionInfo {
        let client = self.authorized_client(ctx).await;
        Self::session_info(ctx, client.as_ref())
    }

    /// Session info, expiry snapshot and expiry state from a single read.
    pub async fn session_overview(
        &self,
        ctx: &SessionContext,
        threshold_minutes: i64,
    ) -> SessionOverview {
        let client = self.authorized_client(ctx).await;
        let expires_at = client.as_ref().and_then(|c| c.tokens.expires_at);
        let now = self.clock.now();

        let expiry_info =
            expires_at.map(|expires_at| ExpiryInfo::compute(now, expires_at, threshold_minutes));
        let expiry_status = ExpiryStatus::of(now, expires_at);

        SessionOverview {
            session_info: Self::session_info(ctx, client.as_ref()),
            is_token_expired: expiry_status.is_expired(),
            is_token_expiring_soon: expiry_info.as_ref().is_some_and(|i| i.is_expiring_soon),
            expiry_info,
            expiry_status,
        }
    }

    pub async fn current_access_token(&self, ctx: &SessionContext) -> Option<String> {
        self.authorized_client(ctx)
            .await
            .map(|c| c.tokens.access_token)
            .filter(|t| !t.is_empty())
    }

    pub async fn current_refresh_token(&self, ctx: &SessionContext) -> Option<String> {
        self.authorized_client(ctx)
            .await
            .and_then(|c| c.tokens.refresh_token().map(str::to_owned))
    }

    /// Three-valued expiry state of the stored access token.
    pub async fn expiry_status(&self, ctx: &SessionContext) -> ExpiryStatus {
        let expires_at = self
            .authorized_client(ctx)
            .await
            .and_then(|c| c.tokens.expires_at);

        ExpiryStatus::of(self.clock.now(), expires_at)
    }

    /// `false` when there is nothing to evaluate.
    pub async fn is_token_expired(&self, ctx: &SessionContext) -> bool {
        self.expiry_status(ctx).await.is_expired()
    }

    pub async fn is_token_expiring_soon(&self, ctx: &SessionContext) -> bool {
        self.is_token_expiring_within(ctx, self.settings.expiring_soon_minutes)
            .await
    }

    /// `false` when there is nothing to evaluate.
    pub async fn is_token_expiring_within(
        &self,
        ctx: &SessionContext,
        threshold_minutes: i64,
    ) -> bool {
        self.token_expiry_info_within(ctx, threshold_minutes)
            .await
            .is_some_and(|info| info.is_expiring_soon)
    }

    pub async fn token_expiry_info(&self, ctx: &SessionContext) -> Option<ExpiryInfo> {
        self.token_expiry_info_within(ctx, self.settings.expiring_soon_minutes)
            .await
    }

    /// Expiry snapshot, or `None` without a stored expiry timestamp.
    pub async fn token_expiry_info_within(
        &self,
        ctx: &SessionContext,
        threshold_minutes: i64,
    ) -> Option<ExpiryInfo> {
        let expires_at = self.authorized_client(ctx).await?.tokens.expires_at?;
        Some(ExpiryInfo::compute(
            self.clock.now(),
            expires_at,
            threshold_minutes,
        ))
    }

    /// Introspect the stored access token with the identity authority.
    ///
    /// A store failure is reported as an unexpected error, not as a missing
    /// token.
    pub async fn validate_current_access_token(
        &self,
        ctx: &SessionContext,
    ) -> ValidationResult {
        let access_token = self.load(ctx).await.map(|client| {
            client
                .map(|c| c.tokens.access_token)
                .filter(|t| !t.is_empty())
        });

        let result = match access_token {
            Err(err) => {
                tracing::error!(key = ?ctx.client, error = %err, "cannot load authorized client");
                ValidationResult::unexpected(&err)
            },
            Ok(None) => ValidationResult::no_token(),
            Ok(Some(access_token)) => match self.authority.validate(&access_token).await {
                Ok(claims) => ValidationResult::valid(claims),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        rejected = err.is_rejection(),
                        "access token validation failed"
                    );
                    ValidationResult::failed(&err)
                },
            },
        };

        metrics::counter!("session_token_validations_total", "outcome" => result.outcome())
            .increment(1);
        result
    }

    /// `true` only when the authority accepts the stored access token.
    pub async fn is_token_valid(&self, ctx: &SessionContext) -> bool {
        let Some(access_token) = self.current_access_token(ctx).await else {
            return false;
        };

        self.authority.validate(&access_token).await.is_ok()
    }

    /// Exchange the stored refresh token and replace the stored token pair.
    ///
    /// Refreshes of the same record are serialized, and the replacement only
    /// lands on the version that was read.
    pub async fn refresh_access_token(&self, ctx: &SessionContext) -> RefreshResult {
        let result = match &ctx.client {
            Some(key) => {
                let lease = RefreshLease::acquire(&self.refresh_locks, key);
                let _guard = lease.lock.lock().await;
                self.refresh_locked(ctx, key).await
            },
            None => RefreshResult::no_refresh_token(),
        };

        metrics::counter!("session_token_refreshes_total", "outcome" => result.outcome())
            .increment(1);
        result
    }

    async fn refresh_locked(&self, ctx: &SessionContext, key: &ClientKey) -> RefreshResult {
        let client = match self.load(ctx).await {
            Ok(Some(client)) => client,
            Ok(None) => return RefreshResult::no_refresh_token(),
            Err(err) => {
                tracing::error!(%key, error = %err, "cannot load authorized client");
                return RefreshResult::unexpected(&err);
            },
        };
        let Some(refresh_token) = client.tokens.refresh_token() else {
            return RefreshResult::no_refresh_token();
        };

        let refreshed = match self.authority.refresh(refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(err) => {
                tracing::warn!(
                    %key,
                    error = %err,
                    rejected = err.is_rejection(),
                    "token refresh failed"
                );
                return RefreshResult::failed(&err);
            },
        };

        let pair = self.replacement_pair(&refreshed);
        let persisted = match self
            .store
            .replace(key, client.version, pair.clone())
            .await
        {
            Ok(version) => {
                tracing::info!(%key, version, "token pair refreshed");
                true
            },
            Err(err) => {
                tracing::error!(%key, error = %err, "refreshed tokens not persisted");
                false
            },
        };

        RefreshResult::refreshed(refreshed, pair, persisted)
    }

    /// Token pair replacing the stored one. Nothing is carried over.
    fn replacement_pair(&self, refreshed: &RefreshedTokens) -> TokenPair {
        let now = self.clock.now();
        let lifetime = refreshed
            .expires_in
            .filter(|secs| *secs > 0)
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(self.settings.default_token_lifetime);
        let expires_at = now
            .checked_add_signed(lifetime)
            .unwrap_or(now + self.settings.default_token_lifetime);

        let mut pair = TokenPair::bearer(&refreshed.access_token)
            .with_issued_at(now)
            .with_expires_at(expires_at);
        if let Some(refresh_token) = &refreshed.refresh_token {
            pair = pair.with_refresh_token(refresh_token);
        }
        if let Some(scopes) = &refreshed.scopes {
            pair = pair.with_scopes(scopes.iter().cloned());
        }

        pair
    }
}
