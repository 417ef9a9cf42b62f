use crate::config::{ClientConfig, ShardingConfig};
use crate::error::{Error, ErrorKind};
use crate::handler::GatewayHandler;
use crate::metrics::Metrics;
use crate::protocol::GatewayBot;
use crate::rest::{RateLimitEvent, RestClient};
use crate::shard::{DisconnectMode, Shard, ShardEvent, ShardState};
use crate::transport::{ReqwestTransport, Transport};
use crate::Result;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Aggregate readiness of every shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
}

/// Shard layout decided on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSharding {
    pub max_shards: u32,
    pub max_concurrency: u32,
}

/// Folds shard states into one client state and reports transitions into
/// `Ready` or `Disconnected`.
#[derive(Debug, Default)]
struct ReadinessTracker {
    expected: usize,
    current: ClientState,
}

impl ReadinessTracker {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            current: ClientState::Disconnected,
        }
    }

    /// Recompute from `states`. Returns the new state only when it just
    /// became `Ready` or `Disconnected`.
    fn observe(&mut self, states: &[ShardState]) -> Option<ClientState> {
        let next = aggregate(self.expected, states);
        if next == self.current {
            return None;
        }
        self.current = next;
        matches!(next, ClientState::Ready | ClientState::Disconnected).then_some(next)
    }
}

fn aggregate(expected: usize, states: &[ShardState]) -> ClientState {
    if expected > 0 && states.len() == expected && states.iter().all(|s| *s == ShardState::Ready) {
        ClientState::Ready
    } else if states.iter().all(|s| *s == ShardState::Disconnected) {
        ClientState::Disconnected
    } else {
        ClientState::Connecting
    }
}

/// Resolve shard count and identify concurrency against the bootstrap info
pub(crate) fn resolve_sharding(config: &ShardingConfig, gateway: &GatewayBot) -> ResolvedSharding {
    if !config.enabled {
        return ResolvedSharding {
            max_shards: 1,
            max_concurrency: 1,
        };
    }

    ResolvedSharding {
        max_shards: config.max_shards.resolve(gateway.shards).max(1),
        max_concurrency: config
            .max_concurrency
            .resolve(gateway.session_start_limit.max_concurrency)
            .max(1),
    }
}

/// Group shard ids into spawn batches.
///
/// A shard's identify bucket is `id % max_concurrency`; every batch holds at
/// most one shard per bucket, so batches are runs of `max_concurrency`
/// consecutive ids.
pub(crate) fn spawn_batches(max_shards: u32, max_concurrency: u32) -> Vec<Vec<u32>> {
    let ids: Vec<u32> = (0..max_shards).collect();
    ids.chunks(max_concurrency.max(1) as usize)
        .map(<[u32]>::to_vec)
        .collect()
}

/// Shard that owns `guild_id` out of `shard_count` shards
pub fn shard_id_for_guild(guild_id: u64, shard_count: u32) -> u32 {
    ((guild_id >> 22) % u64::from(shard_count.max(1))) as u32
}

/// Connect failures the manager retries with backoff
fn is_connect_failure(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionFailed | ErrorKind::Timeout | ErrorKind::WebSocket
    )
}

#[derive(Default)]
struct ManagerState {
    /// Shards by id, in spawn order
    shards: BTreeMap<u32, Shard>,
    gateway: Option<GatewayBot>,
    sharding: Option<ResolvedSharding>,
    tracker: ReadinessTracker,
    /// Connect attempts per shard since it was last ready
    attempts: HashMap<u32, u32>,
    is_running: bool,
}

struct Shared<H> {
    handler: Arc<H>,
    config: Arc<ClientConfig>,
    metrics: Arc<Metrics>,
    state: RwLock<ManagerState>,
    watchers: Mutex<HashMap<u32, JoinHandle<()>>>,
    retries: Mutex<HashMap<u32, JoinHandle<()>>>,
}

/// Spawns shards under the identify-rate ceiling and folds their readiness
/// into one client-level signal.
///
/// # Thread Safety
///
/// `ShardManager` is `Send + Sync` and all methods can be called from
/// multiple tasks concurrently. Internal state is protected by
/// `parking_lot::RwLock`, which does not poison on panic.
///
/// # Example
///
/// ```ignore
/// let config = ClientConfig::builder()
///     .token(std::env::var("BOT_TOKEN")?)
///     .intents(513)
///     .build()?;
///
/// let manager = ShardManager::new(config, Bot);
/// manager.connect().await?;
/// ```
pub struct ShardManager<H: GatewayHandler, T: Transport = ReqwestTransport> {
    shared: Arc<Shared<H>>,
    rest: Arc<RestClient<T>>,
    /// Serializes connect and disconnect. Held across await points.
    lifecycle_lock: tokio::sync::Mutex<()>,
    rate_limit_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<H: GatewayHandler> ShardManager<H> {
    /// Create a manager whose REST client is backed by `reqwest`
    pub fn new(config: ClientConfig, handler: H) -> Self {
        let rest = RestClient::new(config.token.clone(), config.rest.clone());
        Self::with_rest(config, handler, rest)
    }
}

impl<H: GatewayHandler, T: Transport> ShardManager<H, T> {
    /// Create a manager over an existing REST client
    pub fn with_rest(config: ClientConfig, handler: H, rest: RestClient<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                handler: Arc::new(handler),
                config: Arc::new(config),
                metrics: Arc::new(Metrics::new()),
                state: RwLock::new(ManagerState::default()),
                watchers: Mutex::new(HashMap::new()),
                retries: Mutex::new(HashMap::new()),
            }),
            rest: Arc::new(rest),
            lifecycle_lock: tokio::sync::Mutex::new(()),
            rate_limit_watcher: Mutex::new(None),
        }
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.shared.metrics)
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.shared.handler
    }

    pub fn rest(&self) -> &Arc<RestClient<T>> {
        &self.rest
    }

    /// Check if the manager is currently connected
    pub fn is_running(&self) -> bool {
        self.shared.state.read().is_running
    }

    /// Bootstrap info fetched by the last [`connect`](Self::connect)
    pub fn gateway(&self) -> Option<GatewayBot> {
        self.shared.state.read().gateway.clone()
    }

    pub fn sharding(&self) -> Option<ResolvedSharding> {
        self.shared.state.read().sharding
    }

    pub fn shard(&self, id: u32) -> Option<Shard> {
        self.shared.state.read().shards.get(&id).cloned()
    }

    /// Shard responsible for `guild_id`, if it has been spawned
    pub fn shard_for_guild(&self, guild_id: u64) -> Option<Shard> {
        let state = self.shared.state.read();
        let count = state.sharding?.max_shards;
        state
            .shards
            .get(&shard_id_for_guild(guild_id, count))
            .cloned()
    }

    /// Ids of every spawned shard, ascending
    pub fn shard_ids(&self) -> Vec<u32> {
        self.shared.state.read().shards.keys().copied().collect()
    }

    /// Mean heartbeat latency over shards that have one
    pub fn latency(&self) -> Option<Duration> {
        let latencies: Vec<Duration> = self
            .shared
            .state
            .read()
            .shards
            .values()
            .filter_map(Shard::latency)
            .collect();
        if latencies.is_empty() {
            return None;
        }
        Some(latencies.iter().sum::<Duration>() / latencies.len() as u32)
    }

    /// Aggregate readiness right now
    pub fn state(&self) -> ClientState {
        let state = self.shared.state.read();
        let states: Vec<ShardState> = state.shards.values().map(Shard::state).collect();
        aggregate(state.tracker.expected, &states)
    }

    /// Fetch bootstrap info, resolve sharding and spawn every shard.
    ///
    /// Shards are spawned in batches of `max_concurrency`, one batch per
    /// spawn delay. Returns once every shard has been spawned; readiness is
    /// reported through [`GatewayHandler::on_ready`].
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is already running or the bootstrap
    /// call fails.
    pub async fn connect(&self) -> Result<()> {
        let batches = {
            let _lifecycle_guard = self.lifecycle_lock.lock().await;

            if self.shared.state.read().is_running {
                return Err(Error::Manager("ShardManager is already running".to_string()));
            }

            let gateway = self.rest.gateway_bot().await?;
            let sharding = resolve_sharding(&self.shared.config.sharding, &gateway);

            info!(
                "Starting ShardManager with {} shards (max concurrency {}, {} identifies remaining)",
                sharding.max_shards,
                sharding.max_concurrency,
                gateway.session_start_limit.remaining
            );

            {
                let mut state = self.shared.state.write();
                state.gateway = Some(gateway);
                state.sharding = Some(sharding);
                state.tracker = ReadinessTracker::new(sharding.max_shards as usize);
                state.attempts.clear();
                state.is_running = true;
            }

            self.start_rate_limit_watcher();
            spawn_batches(sharding.max_shards, sharding.max_concurrency)
        };

        let spawn_delay = self.shared.config.sharding.spawn_delay;
        for (index, batch) in batches.iter().enumerate() {
            if index > 0 {
                debug!("Waiting {:?} before spawning shards {:?}", spawn_delay, batch);
                tokio::time::sleep(spawn_delay).await;
            }
            if !self.is_running() {
                debug!("Manager stopped while spawning, {} batches skipped", batches.len() - index);
                break;
            }

            let results =
                futures_util::future::join_all(batch.iter().map(|id| self.spawn(*id))).await;
            for result in results {
                match result {
                    Ok(()) | Err(Error::ShardAlreadySpawned(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }

    /// Create shard `id`, start forwarding its events and connect it.
    ///
    /// A failed connect is not returned: it is reported through
    /// [`GatewayHandler::on_error`] and retried with backoff when allowed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShardAlreadySpawned`] if the shard exists, or
    /// [`Error::Manager`] before [`connect`](Self::connect).
    pub async fn spawn(&self, id: u32) -> Result<()> {
        let shard = {
            let mut state = self.shared.state.write();
            if state.shards.contains_key(&id) {
                return Err(Error::ShardAlreadySpawned(id));
            }
            let (Some(gateway), Some(sharding)) = (state.gateway.as_ref(), state.sharding) else {
                return Err(Error::Manager("ShardManager is not connected".to_string()));
            };

            let config = &self.shared.config;
            let url = config
                .gateway
                .url
                .clone()
                .unwrap_or_else(|| gateway.url.clone());
            let shard_info = config.sharding.enabled.then_some([id, sharding.max_shards]);

            let shard = Shard::new(
                id,
                shard_info,
                url,
                Arc::clone(config),
                Arc::clone(&self.shared.metrics),
            );
            state.shards.insert(id, shard.clone());
            shard
        };

        // Listen before connecting so no event is missed
        let events = shard.listen();
        let watcher = tokio::spawn(watch_shard(Arc::clone(&self.shared), shard.clone(), events));
        if let Some(previous) = self.shared.watchers.lock().insert(id, watcher) {
            previous.abort();
        }

        debug!("[SHARD-{}] Spawned", id);
        self.shared.handler.on_shard_create(id).await;

        if let Err(e) = shard.connect().await {
            warn!("[SHARD-{}] Connect failed: {}", id, e);
            handle_connect_failure(&self.shared, &shard, &e).await;
        }
        Ok(())
    }

    /// Disconnect every shard, forgetting their sessions, and stop
    /// forwarding events.
    pub async fn disconnect(&self) {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        info!("Stopping ShardManager");

        let shards: Vec<Shard> = {
            let mut state = self.shared.state.write();
            state.is_running = false;
            std::mem::take(&mut state.shards).into_values().collect()
        };

        abort_all(&self.shared.retries);
        abort_all(&self.shared.watchers);
        if let Some(watcher) = self.rate_limit_watcher.lock().take() {
            watcher.abort();
        }

        for shard in &shards {
            shard.disconnect(DisconnectMode::Reset);
        }

        let change = {
            let mut state = self.shared.state.write();
            let states: Vec<ShardState> = shards.iter().map(Shard::state).collect();
            let change = state.tracker.observe(&states);
            state.tracker = ReadinessTracker::default();
            state.sharding = None;
            state.attempts.clear();
            change
        };

        if change == Some(ClientState::Disconnected) {
            self.shared.handler.on_disconnect().await;
        }
        info!("ShardManager stopped ({} shards)", shards.len());
    }

    fn start_rate_limit_watcher(&self) {
        let events = self.rest.subscribe();
        let watcher = tokio::spawn(watch_rate_limits(Arc::clone(&self.shared), events));
        if let Some(previous) = self.rate_limit_watcher.lock().replace(watcher) {
            previous.abort();
        }
    }
}

impl<H: GatewayHandler, T: Transport> Drop for ShardManager<H, T> {
    fn drop(&mut self) {
        // Abort every task so nothing outlives the manager
        abort_all(&self.shared.retries);
        abort_all(&self.shared.watchers);
        if let Some(watcher) = self.rate_limit_watcher.lock().take() {
            watcher.abort();
        }
        let shards = std::mem::take(&mut self.shared.state.write().shards);
        for shard in shards.values() {
            shard.disconnect(DisconnectMode::Reset);
        }
    }
}

fn abort_all(tasks: &Mutex<HashMap<u32, JoinHandle<()>>>) {
    let tasks = std::mem::take(&mut *tasks.lock());
    for (_shard_id, task) in tasks {
        task.abort();
    }
}

impl<H: GatewayHandler> Shared<H> {
    /// Recompute aggregate readiness and notify the handler on a transition
    async fn update_readiness(&self) {
        let (change, count) = {
            let mut state = self.state.write();
            let states: Vec<ShardState> = state.shards.values().map(Shard::state).collect();
            let change = state.tracker.observe(&states);
            (change, states.len())
        };

        match change {
            Some(ClientState::Ready) => {
                info!("All {} shards ready", count);
                self.handler.on_ready().await;
            }
            Some(ClientState::Disconnected) => {
                info!("All {} shards disconnected", count);
                self.handler.on_disconnect().await;
            }
            _ => {}
        }
    }
}

/// Forward one shard's events to the handler until the manager stops.
async fn watch_shard<H: GatewayHandler>(
    shared: Arc<Shared<H>>,
    shard: Shard,
    mut events: mpsc::UnboundedReceiver<ShardEvent>,
) {
    let id = shard.id();
    while let Some(event) = events.recv().await {
        let handled = AssertUnwindSafe(handle_event(&shared, &shard, event))
            .catch_unwind()
            .await;
        if let Err(panic_err) = handled {
            // Extract panic message if possible
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!("[SHARD-{}] Handler PANICKED: {}", id, panic_msg);
            shared.metrics.record_error();
        }
    }
}

async fn handle_event<H: GatewayHandler>(shared: &Arc<Shared<H>>, shard: &Shard, event: ShardEvent) {
    let id = shard.id();
    match event {
        ShardEvent::Debug(message) => shared.handler.on_debug(Some(id), &message).await,
        ShardEvent::Raw(payload) => shared.handler.on_raw(id, &payload).await,
        ShardEvent::Dispatch(dispatch) => shared.handler.on_dispatch(id, dispatch).await,
        ShardEvent::Ready | ShardEvent::Resumed => {
            shared.state.write().attempts.remove(&id);
            shared.update_readiness().await;
        }
        ShardEvent::Reconnecting | ShardEvent::Disconnected => shared.update_readiness().await,
        ShardEvent::Error {
            kind,
            message,
            fatal,
        } => {
            let retry = shared.handler.on_error(kind, &message, id).await;
            if retry
                && !fatal
                && is_connect_failure(kind)
                && shard.state() == ShardState::Disconnected
            {
                schedule_retry(shared, shard);
            }
        }
    }
}

/// Report a failed connect to the handler and retry if it allows
async fn handle_connect_failure<H: GatewayHandler>(shared: &Arc<Shared<H>>, shard: &Shard, error: &Error) {
    let retry = shared
        .handler
        .on_error(error.kind(), &error.to_string(), shard.id())
        .await;
    if retry && is_connect_failure(error.kind()) {
        schedule_retry(shared, shard);
    }
}

fn schedule_retry<H: GatewayHandler>(shared: &Arc<Shared<H>>, shard: &Shard) {
    let task = tokio::spawn(retry_connect(Arc::clone(shared), shard.clone()));
    if let Some(previous) = shared.retries.lock().insert(shard.id(), task) {
        previous.abort();
    }
}

/// Reconnect a disconnected shard after backoff, up to the attempt limit
async fn retry_connect<H: GatewayHandler>(shared: Arc<Shared<H>>, shard: Shard) {
    let id = shard.id();
    let max_attempts = shared.config.connection.max_connect_attempts;

    loop {
        let attempt = {
            let mut state = shared.state.write();
            let attempt = state.attempts.entry(id).or_insert(0);
            *attempt += 1;
            *attempt
        };
        if attempt > max_attempts {
            error!("[SHARD-{}] Giving up after {} connect attempts", id, max_attempts);
            return;
        }

        let delay = shared.config.backoff.delay_for_attempt(attempt - 1);
        debug!(
            "[SHARD-{}] Retrying connect in {:?} (attempt {}/{})",
            id, delay, attempt, max_attempts
        );
        tokio::time::sleep(delay).await;

        if !shared.state.read().is_running || shard.state() != ShardState::Disconnected {
            return;
        }

        match shard.connect().await {
            Ok(()) => return,
            Err(e) => {
                warn!("[SHARD-{}] Connect attempt {} failed: {}", id, attempt, e);
                let retry = shared.handler.on_error(e.kind(), &e.to_string(), id).await;
                if !(retry && is_connect_failure(e.kind())) {
                    return;
                }
            }
        }
    }
}

/// Forward REST rate-limit notifications to the handler
async fn watch_rate_limits<H: GatewayHandler>(
    shared: Arc<Shared<H>>,
    mut events: broadcast::Receiver<RateLimitEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                shared.metrics.record_rest_rate_limit();
                shared.handler.on_rate_limit(event).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("[REST] Rate limit watcher lagged, {} events dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
