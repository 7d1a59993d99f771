//! Top-level entry point: the enclosing supervision tier.
//!
//! [`ThingStore`] spawns one supervisor per thing on first use, caches its
//! handle, and routes every inbound signal to it. Supervisors that stop,
//! whether passivated or escalated, are evicted; the next request for the
//! same thing gets a fresh one.
//!
//! The store is assembled with [`ThingStoreBuilder`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_stream::Stream;

use crate::backoff::BackoffConfig;
use crate::clock::{Clock, SystemClock};
use crate::command::CommandEnvelope;
use crate::config::{EnrichmentConfig, LiveConfig, TwinConfig, WorkerConfig};
use crate::correlation::CorrelationCache;
use crate::enrichment::PolicyEnricher;
use crate::event_log::{EventLog, InMemoryEventLog};
use crate::live::{LiveDispatcher, ResponseListener, deliver_response};
use crate::policy::PolicyClient;
use crate::pubsub::{InMemoryPubSub, PubSub, Signal};
use crate::response::CommandResponse;
use crate::storage::FileEventLog;
use crate::strategy::StrategyRegistry;
use crate::supervisor::{
    SupervisorDeps, SupervisorExit, SupervisorHandle, SupervisorStatus, spawn_supervisor,
};
use crate::thing::ThingId;
use crate::worker::{ExecuteResult, WorkerDeps};

type SupervisorCache = HashMap<ThingId, SupervisorHandle>;

/// Routes signals to per-thing supervisors.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct ThingStore {
    deps: SupervisorDeps,
    config: Arc<TwinConfig>,
    supervisors: Arc<RwLock<SupervisorCache>>,
}

impl std::fmt::Debug for ThingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThingStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ThingStore {
    pub fn builder() -> ThingStoreBuilder {
        ThingStoreBuilder::new()
    }

    /// Get the supervisor for `thing_id`, spawning one if needed.
    ///
    /// A cached supervisor that has stopped is replaced.
    pub async fn supervisor(&self, thing_id: &ThingId) -> SupervisorHandle {
        {
            let supervisors = self.supervisors.read().await;
            if let Some(handle) = supervisors.get(thing_id)
                && handle.is_alive()
            {
                return handle.clone();
            }
        }

        let mut supervisors = self.supervisors.write().await;
        // Another caller may have won the race for the write lock.
        if let Some(handle) = supervisors.get(thing_id)
            && handle.is_alive()
        {
            return handle.clone();
        }

        tracing::debug!(thing_id = %thing_id, "spawning supervisor");
        let (handle, join) = spawn_supervisor(thing_id.clone(), self.deps.clone(), &self.config);
        supervisors.insert(thing_id.clone(), handle.clone());
        tokio::spawn(watch_supervisor(
            Arc::clone(&self.supervisors),
            thing_id.clone(),
            join,
        ));
        handle
    }

    /// Route `signal` to its thing's supervisor and wait for the answer.
    ///
    /// # Errors
    ///
    /// See [`SupervisorHandle::ask`].
    pub async fn ask(&self, signal: Signal) -> ExecuteResult {
        let supervisor = self.supervisor(signal.thing_id()).await;
        supervisor.ask(signal).await
    }

    /// Shorthand for [`ask`](ThingStore::ask) with a command.
    ///
    /// # Errors
    ///
    /// See [`SupervisorHandle::ask`].
    pub async fn execute(&self, envelope: CommandEnvelope) -> ExecuteResult {
        self.ask(Signal::Command(envelope)).await
    }

    /// Relay a passivation signal to the thing's supervisor, if one runs.
    ///
    /// Returns `false` if the thing was not active.
    pub async fn passivate(&self, thing_id: &ThingId) -> bool {
        let handle = self.supervisors.write().await.remove(thing_id);
        match handle {
            Some(handle) => {
                tracing::info!(thing_id = %thing_id, "passivating thing");
                handle.passivate()
            }
            None => false,
        }
    }

    /// Status of the thing's supervisor, or `None` if it is not active.
    pub async fn status(&self, thing_id: &ThingId) -> Option<SupervisorStatus> {
        let supervisors = self.supervisors.read().await;
        supervisors
            .get(thing_id)
            .filter(|handle| handle.is_alive())
            .map(SupervisorHandle::status)
    }

    /// Ids of every thing with a live supervisor, sorted.
    pub async fn active_things(&self) -> Vec<ThingId> {
        let supervisors = self.supervisors.read().await;
        let mut ids: Vec<ThingId> = supervisors
            .iter()
            .filter(|(_, handle)| handle.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn correlation_cache(&self) -> &CorrelationCache {
        self.deps.live.cache()
    }

    pub fn config(&self) -> &TwinConfig {
        &self.config
    }

    /// Resolve one inbound live response. See [`deliver_response`].
    pub fn deliver_live_response(&self, response: CommandResponse) -> bool {
        deliver_response(self.correlation_cache(), response)
    }

    /// Resolve every response from `responses` until the stream ends or the
    /// returned listener is shut down.
    pub fn spawn_response_listener<S>(&self, responses: S) -> ResponseListener
    where
        S: Stream<Item = CommandResponse> + Send + Unpin + 'static,
    {
        ResponseListener::spawn(self.correlation_cache().clone(), responses)
    }
}

/// Wait for a supervisor to end, log why, and drop it from the cache
/// unless a newer one already replaced it.
async fn watch_supervisor(
    supervisors: Arc<RwLock<SupervisorCache>>,
    thing_id: ThingId,
    join: JoinHandle<SupervisorExit>,
) {
    match join.await {
        Ok(SupervisorExit::Escalated(reason)) => {
            tracing::error!(thing_id = %thing_id, %reason, "supervisor escalated, evicting");
        }
        Ok(exit) => tracing::debug!(thing_id = %thing_id, exit = ?exit, "supervisor stopped"),
        Err(e) => tracing::error!(thing_id = %thing_id, error = %e, "supervisor task failed"),
    }

    let mut supervisors = supervisors.write().await;
    if supervisors
        .get(&thing_id)
        .is_some_and(|handle| !handle.is_alive())
    {
        supervisors.remove(&thing_id);
    }
}

/// Builder for a [`ThingStore`].
///
/// Every collaborator has an in-process default, so the smallest working
/// store is `ThingStoreBuilder::new().build()`.
///
/// # Examples
///
/// ```no_run
/// use twinfold::{TwinConfig, ThingStoreBuilder};
///
/// # async fn example() {
/// let store = ThingStoreBuilder::new()
///     .base_dir("/tmp/twinfold")
///     .config(TwinConfig::default())
///     .build();
/// # }
/// ```
pub struct ThingStoreBuilder {
    event_log: Option<Arc<dyn EventLog>>,
    pubsub: Option<Arc<dyn PubSub>>,
    policy_client: Option<Arc<dyn PolicyClient>>,
    correlation_cache: Option<CorrelationCache>,
    clock: Arc<dyn Clock>,
    strategies: StrategyRegistry,
    config: TwinConfig,
}

impl ThingStoreBuilder {
    pub fn new() -> Self {
        Self {
            event_log: None,
            pubsub: None,
            policy_client: None,
            correlation_cache: None,
            clock: Arc::new(SystemClock),
            strategies: StrategyRegistry::default(),
            config: TwinConfig::default(),
        }
    }

    /// Use `log` for event persistence. Defaults to an
    /// [`InMemoryEventLog`].
    pub fn event_log(mut self, log: impl EventLog) -> Self {
        self.event_log = Some(Arc::new(log));
        self
    }

    /// Persist events as files under `path` with a [`FileEventLog`].
    pub fn base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_log = Some(Arc::new(FileEventLog::new(path)));
        self
    }

    /// Use `pubsub` for live signals. Defaults to an [`InMemoryPubSub`].
    pub fn pubsub(mut self, pubsub: impl PubSub) -> Self {
        self.pubsub = Some(Arc::new(pubsub));
        self
    }

    /// Enable policy enrichment backed by `client`.
    pub fn policy_client(mut self, client: impl PolicyClient) -> Self {
        self.policy_client = Some(Arc::new(client));
        self
    }

    /// Share `cache` with other components. Defaults to a new, private
    /// cache.
    pub fn correlation_cache(mut self, cache: CorrelationCache) -> Self {
        self.correlation_cache = Some(cache);
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the strategy registry. Defaults to
    /// [`StrategyRegistry::default`].
    pub fn strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn config(mut self, config: TwinConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.config.worker = config;
        self
    }

    pub fn backoff_config(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    pub fn live_config(mut self, config: LiveConfig) -> Self {
        self.config.live = config;
        self
    }

    pub fn enrichment_config(mut self, config: EnrichmentConfig) -> Self {
        self.config.enrichment = config;
        self
    }

    pub fn build(self) -> ThingStore {
        let event_log = self
            .event_log
            .unwrap_or_else(|| Arc::new(InMemoryEventLog::new()));
        let pubsub = self
            .pubsub
            .unwrap_or_else(|| Arc::new(InMemoryPubSub::default()));
        let cache = self.correlation_cache.unwrap_or_default();
        let enricher = self
            .policy_client
            .map(|client| PolicyEnricher::new(client, self.config.enrichment.clone()));

        let deps = SupervisorDeps {
            worker: WorkerDeps {
                event_log,
                strategies: Arc::new(self.strategies),
                clock: self.clock,
            },
            live: LiveDispatcher::new(pubsub, cache, self.config.live.clone()),
            enricher,
        };
        ThingStore {
            deps,
            config: Arc::new(self.config),
            supervisors: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for ThingStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
