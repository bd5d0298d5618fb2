use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Plan, User, UserWithPlan};
use crate::store::GatewayStore;

/// Lowercase hex SHA-256 of an API key, the form stored on the user row.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// An authenticated caller and the plan its quotas are counted against.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user: User,
    pub plan: Plan,
    /// When the gateway started handling the request
    pub started_at: Instant,
}

impl Principal {
    /// Milliseconds since `started_at`, saturating at `i32::MAX`.
    pub fn elapsed_ms(&self) -> i32 {
        i32::try_from(self.started_at.elapsed().as_millis()).unwrap_or(i32::MAX)
    }
}

/// Maps an API key to a [`Principal`].
///
/// Resolution has one write: a user whose non-default plan has expired is
/// moved to the default plan before the request continues
/// ([`CredentialResolver::downgrade_expired_plan`]).
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn GatewayStore>,
    default_plan_id: Arc<str>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn GatewayStore>, default_plan_id: impl Into<String>) -> Self {
        Self {
            store,
            default_plan_id: Arc::from(default_plan_id.into()),
        }
    }

    pub fn default_plan_id(&self) -> &str {
        &self.default_plan_id
    }

    /// Resolve `api_key` as of now.
    pub async fn resolve(&self, api_key: &str, started_at: Instant) -> AppResult<Principal> {
        self.resolve_at(api_key, started_at, Utc::now()).await
    }

    /// Resolve `api_key`, judging plan expiry against `now`.
    ///
    /// # Errors
    ///
    /// - `InvalidCredential` if no user holds this key
    /// - `NoPlanAssigned` if no plan remains after any downgrade
    /// - store errors from the lookup or the downgrade
    pub async fn resolve_at(
        &self,
        api_key: &str,
        started_at: Instant,
        now: DateTime<Utc>,
    ) -> AppResult<Principal> {
        let digest = hash_api_key(api_key);
        let UserWithPlan { mut user, mut plan } = self
            .store
            .find_user_by_key_digest(&digest)
            .await?
            .ok_or(AppError::InvalidCredential)?;

        if user.plan_expired(now) && user.plan_id.as_deref() != Some(self.default_plan_id()) {
            plan = self.downgrade_expired_plan(&mut user).await?;
        }

        let plan = plan.ok_or(AppError::NoPlanAssigned)?;

        Ok(Principal {
            user,
            plan,
            started_at,
        })
    }

    /// Persist the move to the default plan (clearing the expiry) and return
    /// the default plan, if it exists.
    #[instrument(skip(self, user), fields(user_id = %user.id, expired_plan = ?user.plan_id))]
    pub async fn downgrade_expired_plan(&self, user: &mut User) -> AppResult<Option<Plan>> {
        self.store
            .assign_plan(&user.id, self.default_plan_id())
            .await?;

        user.plan_id = Some(self.default_plan_id().to_string());
        user.plan_expires_at = None;
        metrics::record_plan_downgrade();
        info!(default_plan = %self.default_plan_id, "Downgraded expired plan");

        let plan = self.store.find_plan(self.default_plan_id()).await?;
        if plan.is_none() {
            warn!(default_plan = %self.default_plan_id, "Default plan does not exist");
        }
        Ok(plan)
    }
}
