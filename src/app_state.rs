use crate::admin::AdminProcessor;
use crate::auth::Authorizer;
use crate::config::RelaySettings;
use crate::metrics::PrometheusHandle;
use crate::rate_limiter::RateLimiter;
use crate::storage::RelayDatabase;
use crate::subscription::{ConnectionId, SubscriptionRegistry};
use crate::validator::EventValidator;
use crate::whitelist::{SqliteWhitelist, Whitelist, WhitelistStore};
use anyhow::Result;
use nostr::Keys;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Everything a connection or HTTP handler needs, shared behind an `Arc`.
#[derive(Debug)]
pub struct RelayState {
    pub settings: RelaySettings,
    pub relay_keys: Keys,
    pub validator: EventValidator,
    pub rate_limiter: RateLimiter,
    pub authorizer: Authorizer,
    pub admin: AdminProcessor,
    pub database: Arc<RelayDatabase>,
    pub registry: SubscriptionRegistry,
    pub metrics_handle: Option<PrometheusHandle>,
    pub cancellation_token: CancellationToken,
    next_connection_id: AtomicU64,
    started_at: Instant,
}

impl RelayState {
    /// Opens the database and the persisted whitelist named by `settings`.
    pub async fn open(
        settings: RelaySettings,
        metrics_handle: Option<PrometheusHandle>,
        cancellation_token: CancellationToken,
    ) -> Result<Self> {
        let database = Arc::new(RelayDatabase::open(
            &settings.db_path,
            settings.query.clone(),
        )?);
        let store = SqliteWhitelist::load(database.clone()).await?;
        Self::new(
            settings,
            database,
            Arc::new(store),
            metrics_handle,
            cancellation_token,
        )
        .await
    }

    pub async fn new(
        settings: RelaySettings,
        database: Arc<RelayDatabase>,
        whitelist_store: Arc<dyn WhitelistStore>,
        metrics_handle: Option<PrometheusHandle>,
        cancellation_token: CancellationToken,
    ) -> Result<Self> {
        let relay_keys = settings.relay_keys()?;
        let whitelist = Whitelist::new(
            whitelist_store,
            settings.default_cohort.clone(),
            settings.admin_cohort.clone(),
        );
        whitelist.seed_admins(&settings.admin_keys()?).await?;

        let authorizer = Authorizer::new(
            whitelist.clone(),
            settings.sections.clone(),
            settings.relay_url.clone(),
        );
        let registry = SubscriptionRegistry::new(
            settings.query.max_subscriptions,
            settings.websocket.channel_size,
        );

        Ok(Self {
            relay_keys,
            validator: EventValidator::new(settings.validation),
            rate_limiter: RateLimiter::new(settings.rate_limit.clone()),
            admin: AdminProcessor::new(whitelist, database.clone()),
            authorizer,
            database,
            registry,
            metrics_handle,
            cancellation_token,
            next_connection_id: AtomicU64::new(1),
            started_at: Instant::now(),
            settings,
        })
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Periodically evicts idle rate-limit buckets until shutdown.
    pub fn spawn_rate_limit_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(state.settings.rate_limit.sweep_interval.max(Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = state.cancellation_token.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = state.rate_limiter.sweep(Instant::now());
                        if evicted > 0 {
                            tracing::debug!("Evicted {} idle rate limit buckets", evicted);
                        }
                    }
                }
            }
        })
    }
}
