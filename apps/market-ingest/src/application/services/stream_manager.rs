//! Stream Subscription Manager
//!
//! Multiplexes per-symbol channel subscriptions over a bounded set of
//! push-stream connections to one exchange.
//!
//! # Ownership
//!
//! Each physical connection is driven by exactly one worker task that owns
//! its [`StreamSession`], its desired subscription set and its
//! [`HealthCell`]. The manager only sends commands and reads health
//! snapshots, so no two tasks ever touch the same socket.
//!
//! # Recovery
//!
//! On any non-fatal failure the worker backs off (`base * 2^attempt ±
//! jitter`, capped), reconnects and replays its full desired set, so keys
//! subscribed before the drop are active again after one successful cycle.
//! An authentication failure closes the connection for good. A socket that
//! delivers no data within the idle window is marked `DEGRADED` and
//! reconnected proactively.
//!
//! Every connect and subscribe passes through the stream rate limiter and
//! circuit breaker.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{EventSink, FeedHealth, StreamConnector, StreamError, StreamSession};
use crate::domain::connection::{ConnectionHealth, ConnectionId, ConnectionState, HealthCell};
use crate::domain::market::{Symbol, ValidationError};
use crate::domain::subscription::{AssignmentTable, ConsumerId, InterestRegistry, Migration, SubscriptionKey};
use crate::infrastructure::metrics;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerError, CircuitOpenError, EndpointClass, EndpointKey, RateLimitError,
    RateLimiter, ReconnectConfig, ReconnectPolicy,
};

// =============================================================================
// Configuration
// =============================================================================

/// Stream manager configuration.
#[derive(Debug, Clone)]
pub struct StreamManagerConfig {
    /// Maximum keys per physical connection.
    pub max_subscriptions_per_connection: usize,
    /// Window without data after which a connection is `DEGRADED`.
    pub idle_window: Duration,
    /// Longest wait for a stream rate-limit token.
    pub rate_limit_deadline: Duration,
    /// How long a rebalance waits for the target connection to confirm.
    pub migration_timeout: Duration,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 50,
            idle_window: Duration::from_secs(30),
            rate_limit_deadline: Duration::from_secs(10),
            migration_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failure that ends one connection cycle.
#[derive(Debug, Error)]
enum WorkerError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error("stream call timed out after {0:?}")]
    CallTimeout(Duration),
}

impl WorkerError {
    const fn is_fatal(&self) -> bool {
        matches!(self, Self::Stream(e) if e.is_fatal())
    }
}

impl From<CircuitBreakerError<StreamError>> for WorkerError {
    fn from(error: CircuitBreakerError<StreamError>) -> Self {
        match error {
            CircuitBreakerError::Open(open) => Self::CircuitOpen(open),
            CircuitBreakerError::Timeout { after, .. } => Self::CallTimeout(after),
            CircuitBreakerError::Inner(inner) => Self::Stream(inner),
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

#[derive(Debug)]
enum Command {
    Subscribe {
        keys: Vec<SubscriptionKey>,
        ack: Option<oneshot::Sender<()>>,
    },
    Unsubscribe(Vec<SubscriptionKey>),
    Shutdown,
}

struct WorkerHandle {
    commands: mpsc::UnboundedSender<Command>,
    health: Arc<HealthCell>,
    task: JoinHandle<()>,
}

/// Shared pieces every worker needs.
#[derive(Clone)]
struct WorkerContext {
    connector: Arc<dyn StreamConnector>,
    sink: Arc<dyn EventSink>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    endpoint: EndpointKey,
    config: StreamManagerConfig,
    cancel: CancellationToken,
}

struct ConnectionWorker {
    id: ConnectionId,
    ctx: WorkerContext,
    health: Arc<HealthCell>,
    commands: mpsc::UnboundedReceiver<Command>,
    desired: BTreeSet<SubscriptionKey>,
    pending_acks: Vec<oneshot::Sender<()>>,
}

enum CycleEnd {
    Shutdown,
    Failed(WorkerError),
}

impl ConnectionWorker {
    async fn run(mut self) {
        let mut policy = ReconnectPolicy::new(self.ctx.config.reconnect.clone());
        let exchange = self.ctx.endpoint.exchange.clone();

        loop {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            self.health.transition(ConnectionState::Connecting);

            match self.connect_and_run(&mut policy).await {
                CycleEnd::Shutdown => break,
                CycleEnd::Failed(error) if error.is_fatal() => {
                    tracing::error!(
                        connection = self.id,
                        exchange = %exchange,
                        error = %error,
                        "Stream authentication failed; connection closed"
                    );
                    self.health.record_failure(error.to_string());
                    break;
                }
                CycleEnd::Failed(error) => {
                    self.health.record_failure(error.to_string());
                    self.health.transition(ConnectionState::Reconnecting);
                    metrics::record_reconnect(&exchange);

                    let Some(delay) = policy.next_delay() else {
                        tracing::error!(
                            connection = self.id,
                            exchange = %exchange,
                            attempts = policy.attempt_count(),
                            "Maximum reconnect attempts exceeded"
                        );
                        break;
                    };
                    tracing::info!(
                        connection = self.id,
                        exchange = %exchange,
                        attempt = policy.attempt_count(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Reconnecting stream"
                    );
                    if self.wait_offline(delay).await {
                        break;
                    }
                }
            }
        }

        self.health.transition(ConnectionState::Closed);
        self.health.set_subscriptions(0);
        metrics::set_connection_subscriptions(self.id, 0);
    }

    /// Sleep out a backoff delay while still tracking commands.
    /// Returns `true` if the worker should stop.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = self.ctx.cancel.cancelled() => return true,
                () = &mut sleep => return false,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return true,
                    Some(Command::Subscribe { keys, ack }) => {
                        self.desired.extend(keys);
                        self.pending_acks.extend(ack);
                    }
                    Some(Command::Unsubscribe(keys)) => {
                        for key in &keys {
                            self.desired.remove(key);
                        }
                    }
                },
            }
        }
    }

    async fn connect_and_run(&mut self, policy: &mut ReconnectPolicy) -> CycleEnd {
        let mut session = match self.connect().await {
            Ok(session) => session,
            Err(error) => return CycleEnd::Failed(error),
        };

        let end = self.run_session(session.as_mut(), policy).await;
        session.close().await;
        end
    }

    async fn connect(&self) -> Result<Box<dyn StreamSession>, WorkerError> {
        self.ctx
            .limiter
            .acquire(&self.ctx.endpoint, Some(self.ctx.config.rate_limit_deadline))
            .await?;
        let connector = Arc::clone(&self.ctx.connector);
        let session = self
            .ctx
            .breaker
            .call_classified(|| async move { connector.connect().await }, StreamError::counts_as_failure)
            .await?;
        Ok(session)
    }

    async fn send_subscribe(
        &self,
        session: &mut dyn StreamSession,
        keys: &[SubscriptionKey],
    ) -> Result<(), WorkerError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.ctx
            .limiter
            .acquire(&self.ctx.endpoint, Some(self.ctx.config.rate_limit_deadline))
            .await?;
        self.ctx
            .breaker
            .call_classified(|| session.subscribe(keys), StreamError::counts_as_failure)
            .await?;
        Ok(())
    }

    async fn send_unsubscribe(
        &self,
        session: &mut dyn StreamSession,
        keys: &[SubscriptionKey],
    ) -> Result<(), WorkerError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.ctx
            .limiter
            .acquire(&self.ctx.endpoint, Some(self.ctx.config.rate_limit_deadline))
            .await?;
        self.ctx
            .breaker
            .call_classified(|| session.unsubscribe(keys), StreamError::counts_as_failure)
            .await?;
        Ok(())
    }

    async fn run_session(
        &mut self,
        session: &mut dyn StreamSession,
        policy: &mut ReconnectPolicy,
    ) -> CycleEnd {
        let replay: Vec<SubscriptionKey> = self.desired.iter().cloned().collect();
        if let Err(error) = self.send_subscribe(session, &replay).await {
            return CycleEnd::Failed(error);
        }
        if !replay.is_empty() {
            tracing::info!(
                connection = self.id,
                keys = replay.len(),
                "Replayed subscriptions after connect"
            );
        }

        self.health.transition(ConnectionState::Healthy);
        self.publish_count();
        policy.reset();
        for ack in self.pending_acks.drain(..) {
            let _ = ack.send(());
        }

        let idle_window = self.ctx.config.idle_window;
        let mut idle_check = tokio::time::interval((idle_window / 4).max(Duration::from_millis(10)));
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_data = Instant::now();

        loop {
            tokio::select! {
                () = self.ctx.cancel.cancelled() => return CycleEnd::Shutdown,
                command = self.commands.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => return CycleEnd::Shutdown,
                        Some(Command::Subscribe { keys, ack }) => {
                            let fresh: Vec<SubscriptionKey> = keys
                                .into_iter()
                                .filter(|key| !self.desired.contains(key))
                                .collect();
                            self.desired.extend(fresh.iter().cloned());
                            if let Err(error) = self.send_subscribe(session, &fresh).await {
                                self.pending_acks.extend(ack);
                                return CycleEnd::Failed(error);
                            }
                            if let Some(ack) = ack {
                                let _ = ack.send(());
                            }
                            self.publish_count();
                        }
                        Some(Command::Unsubscribe(keys)) => {
                            let removed: Vec<SubscriptionKey> = keys
                                .into_iter()
                                .filter(|key| self.desired.remove(key))
                                .collect();
                            self.publish_count();
                            if let Err(error) = self.send_unsubscribe(session, &removed).await {
                                tracing::warn!(connection = self.id, error = %error, "Unsubscribe failed");
                                if !matches!(error, WorkerError::Stream(StreamError::Rejected(_))) {
                                    return CycleEnd::Failed(error);
                                }
                            }
                        }
                    }
                }
                frame = session.next_event() => {
                    let events = match frame {
                        Ok(events) => events,
                        Err(error) => return CycleEnd::Failed(error.into()),
                    };
                    if events.is_empty() {
                        continue;
                    }
                    last_data = Instant::now();
                    self.health.record_message();
                    for event in events {
                        if !self.covers(&event.symbol) {
                            continue;
                        }
                        metrics::record_event_received(&self.ctx.endpoint.exchange, event.data_class);
                        self.ctx.sink.deliver(event).await;
                    }
                }
                _ = idle_check.tick() => {
                    let idle = last_data.elapsed();
                    if !self.desired.is_empty() && idle >= idle_window {
                        self.health.transition(ConnectionState::Degraded);
                        tracing::warn!(
                            connection = self.id,
                            idle_ms = idle.as_millis(),
                            "No data within idle window; reconnecting"
                        );
                        return CycleEnd::Failed(WorkerError::Stream(StreamError::Idle(idle)));
                    }
                }
            }
        }
    }

    fn covers(&self, symbol: &Symbol) -> bool {
        self.desired.iter().any(|key| &key.symbol == symbol)
    }

    fn publish_count(&self) {
        self.health.set_subscriptions(self.desired.len());
        metrics::set_connection_subscriptions(self.id, self.desired.len());
    }
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Debug)]
struct ManagerState {
    interest: InterestRegistry,
    table: AssignmentTable,
}

/// Subscription manager for one exchange.
pub struct StreamSubscriptionManager {
    ctx: WorkerContext,
    state: Mutex<ManagerState>,
    workers: Mutex<HashMap<ConnectionId, WorkerHandle>>,
}

impl std::fmt::Debug for StreamSubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSubscriptionManager")
            .field("exchange", &self.ctx.endpoint.exchange)
            .field("connections", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}

impl StreamSubscriptionManager {
    /// Create a manager. Connections are opened on first subscription.
    #[must_use]
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        sink: Arc<dyn EventSink>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        config: StreamManagerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let endpoint = EndpointKey::new(connector.exchange(), EndpointClass::Stream);
        let table = AssignmentTable::new(config.max_subscriptions_per_connection);
        Self {
            ctx: WorkerContext {
                connector,
                sink,
                limiter,
                breaker,
                endpoint,
                config,
                cancel,
            },
            state: Mutex::new(ManagerState {
                interest: InterestRegistry::default(),
                table,
            }),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Exchange served.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.ctx.endpoint.exchange
    }

    /// Declare `consumer`'s interest in `symbols`.
    ///
    /// Symbols newly covered are assigned to connections and subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidSymbol`] for a symbol of another
    /// exchange; nothing is subscribed in that case.
    pub fn subscribe(&self, consumer: ConsumerId, symbols: &[Symbol]) -> Result<(), ValidationError> {
        if let Some(foreign) = symbols.iter().find(|s| s.exchange() != self.exchange()) {
            return Err(ValidationError::InvalidSymbol(foreign.to_string()));
        }

        let mut state = self.state.lock();
        let changes = state.interest.add(consumer, symbols);
        let mut batches: BTreeMap<ConnectionId, Vec<SubscriptionKey>> = BTreeMap::new();
        for key in changes.added.iter().flat_map(|symbol| self.keys_for(symbol)) {
            if let Some(placement) = state.table.assign(key.clone()) {
                batches.entry(placement.connection).or_default().push(key);
            }
        }
        drop(state);

        for (connection, keys) in batches {
            tracing::debug!(connection, keys = keys.len(), "Assigning subscriptions");
            self.send(connection, Command::Subscribe { keys, ack: None });
        }
        Ok(())
    }

    /// Withdraw `consumer`'s interest in `symbols`.
    pub fn unsubscribe(&self, consumer: ConsumerId, symbols: &[Symbol]) {
        let changes = self.state.lock().interest.remove(consumer, symbols);
        self.release(&changes.removed);
    }

    /// Withdraw all of `consumer`'s interest.
    pub fn remove_consumer(&self, consumer: ConsumerId) {
        let changes = self.state.lock().interest.remove_consumer(consumer);
        self.release(&changes.removed);
    }

    /// Change the per-connection limit and migrate any overflow.
    pub async fn set_connection_limit(&self, limit: usize) -> Vec<Migration> {
        self.state.lock().table.set_limit(self.exchange(), limit);
        self.rebalance().await
    }

    /// Move keys off over-limit connections, make-before-break.
    ///
    /// Each key is subscribed on its target connection and unsubscribed from
    /// the source only once the target confirms. A key whose target stops or
    /// does not confirm within the migration timeout stays on its source.
    /// Returns the migrations that completed.
    pub async fn rebalance(&self) -> Vec<Migration> {
        let migrations = self.state.lock().table.rebalance();
        if migrations.is_empty() {
            return migrations;
        }

        let mut confirmations = Vec::with_capacity(migrations.len());
        for migration in &migrations {
            let (tx, rx) = oneshot::channel();
            self.send(
                migration.to,
                Command::Subscribe {
                    keys: vec![migration.key.clone()],
                    ack: Some(tx),
                },
            );
            confirmations.push(rx);
        }

        let mut completed = Vec::with_capacity(migrations.len());
        for (migration, confirmed) in migrations.into_iter().zip(confirmations) {
            match tokio::time::timeout(self.ctx.config.migration_timeout, confirmed).await {
                Ok(Ok(())) => {
                    self.send(migration.from, Command::Unsubscribe(vec![migration.key.clone()]));
                    completed.push(migration);
                }
                outcome => {
                    let reason = if outcome.is_err() {
                        "timed out"
                    } else {
                        "target connection stopped"
                    };
                    tracing::warn!(
                        key = %migration.key,
                        from = migration.from,
                        to = migration.to,
                        reason,
                        "Migration not confirmed; key stays on its source"
                    );
                    self.undo_migration(&migration);
                }
            }
        }

        tracing::info!(
            exchange = %self.exchange(),
            migrated = completed.len(),
            "Rebalanced subscriptions"
        );
        self.publish_connection_count();
        completed
    }

    fn undo_migration(&self, migration: &Migration) {
        let Some(release) = self.state.lock().table.revert(migration) else {
            return;
        };
        if release.now_empty {
            if let Some(handle) = self.workers.lock().remove(&release.connection) {
                let _ = handle.commands.send(Command::Shutdown);
            }
        } else {
            self.send(release.connection, Command::Unsubscribe(vec![migration.key.clone()]));
        }
    }

    /// Symbols with at least one interested consumer.
    #[must_use]
    pub fn subscribed_symbols(&self) -> Vec<Symbol> {
        self.state.lock().interest.active_symbols()
    }

    /// Whether any consumer covers `symbol`.
    #[must_use]
    pub fn is_subscribed(&self, symbol: &Symbol) -> bool {
        self.state.lock().interest.contains(symbol)
    }

    /// Worst health among the connections serving `symbol`.
    #[must_use]
    pub fn health_for(&self, symbol: &Symbol) -> Option<ConnectionHealth> {
        let connections: BTreeSet<ConnectionId> = {
            let state = self.state.lock();
            self.keys_for(symbol)
                .iter()
                .filter_map(|key| state.table.connection_of(key))
                .collect()
        };
        let workers = self.workers.lock();
        worst(
            connections
                .iter()
                .filter_map(|id| workers.get(id))
                .map(|worker| worker.health.snapshot()),
        )
    }

    /// Worst health across every connection.
    #[must_use]
    pub fn worst_health(&self) -> Option<ConnectionHealth> {
        worst(self.connections().into_iter())
    }

    /// Health of every live connection, by id.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionHealth> {
        let workers = self.workers.lock();
        let mut all: Vec<ConnectionHealth> = workers.values().map(|w| w.health.snapshot()).collect();
        all.sort_by_key(|health| health.connection);
        all
    }

    /// Stop every connection and wait for the workers to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<WorkerHandle> = self.workers.lock().drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            let _ = handle.commands.send(Command::Shutdown);
        }
        for handle in handles {
            let _ = handle.task.await;
        }
        self.publish_connection_count();
    }

    fn keys_for(&self, symbol: &Symbol) -> Vec<SubscriptionKey> {
        self.ctx
            .connector
            .stream_classes()
            .into_iter()
            .filter_map(|class| self.ctx.connector.channel_for(class))
            .map(|channel| SubscriptionKey::new(symbol.clone(), channel))
            .collect()
    }

    fn release(&self, symbols: &[Symbol]) {
        if symbols.is_empty() {
            return;
        }
        let mut unsubscribes: BTreeMap<ConnectionId, Vec<SubscriptionKey>> = BTreeMap::new();
        let mut emptied = Vec::new();
        {
            let mut state = self.state.lock();
            for key in symbols.iter().flat_map(|symbol| self.keys_for(symbol)) {
                if let Some(release) = state.table.release(&key) {
                    if release.now_empty {
                        emptied.push(release.connection);
                    }
                    unsubscribes.entry(release.connection).or_default().push(key);
                }
            }
        }

        for (connection, keys) in unsubscribes {
            if emptied.contains(&connection) {
                continue;
            }
            self.send(connection, Command::Unsubscribe(keys));
        }
        for connection in emptied {
            if let Some(handle) = self.workers.lock().remove(&connection) {
                tracing::info!(connection, "Closing connection with no subscriptions");
                let _ = handle.commands.send(Command::Shutdown);
            }
        }
        self.publish_connection_count();
    }

    /// Deliver a command, starting the connection's worker if needed.
    fn send(&self, connection: ConnectionId, command: Command) {
        let mut workers = self.workers.lock();
        let handle = workers
            .entry(connection)
            .or_insert_with(|| self.spawn_worker(connection));
        if handle.commands.send(command).is_err() {
            tracing::warn!(connection, "Connection worker has stopped; command dropped");
        }
        drop(workers);
        self.publish_connection_count();
    }

    fn spawn_worker(&self, connection: ConnectionId) -> WorkerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let health = Arc::new(HealthCell::new(connection, self.exchange()));
        let worker = ConnectionWorker {
            id: connection,
            ctx: self.ctx.clone(),
            health: Arc::clone(&health),
            commands: rx,
            desired: BTreeSet::new(),
            pending_acks: Vec::new(),
        };
        tracing::info!(connection, exchange = %self.exchange(), "Opening stream connection");
        WorkerHandle {
            commands: tx,
            health,
            task: tokio::spawn(worker.run()),
        }
    }

    fn publish_connection_count(&self) {
        metrics::set_connections(self.exchange(), self.workers.lock().len());
    }
}

impl FeedHealth for StreamSubscriptionManager {
    fn covered_symbols(&self) -> Vec<Symbol> {
        self.subscribed_symbols()
    }

    fn health_for(&self, symbol: &Symbol) -> Option<ConnectionHealth> {
        Self::health_for(self, symbol)
    }
}

/// Rank states from healthy to terminal.
const fn severity(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Healthy => 0,
        ConnectionState::Init => 1,
        ConnectionState::Connecting => 2,
        ConnectionState::Degraded => 3,
        ConnectionState::Reconnecting => 4,
        ConnectionState::Closed => 5,
    }
}

fn worst(healths: impl Iterator<Item = ConnectionHealth>) -> Option<ConnectionHealth> {
    healths.max_by(|a, b| {
        severity(a.state)
            .cmp(&severity(b.state))
            .then_with(|| b.unhealthy_since.cmp(&a.unhealthy_since))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(connection: ConnectionId, state: ConnectionState) -> ConnectionHealth {
        let cell = HealthCell::new(connection, "bybit");
        match state {
            ConnectionState::Init => {}
            ConnectionState::Connecting => {
                cell.transition(ConnectionState::Connecting);
            }
            ConnectionState::Healthy => {
                cell.transition(ConnectionState::Connecting);
                cell.transition(ConnectionState::Healthy);
            }
            ConnectionState::Degraded => {
                cell.transition(ConnectionState::Connecting);
                cell.transition(ConnectionState::Healthy);
                cell.transition(ConnectionState::Degraded);
            }
            ConnectionState::Reconnecting => {
                cell.transition(ConnectionState::Connecting);
                cell.transition(ConnectionState::Reconnecting);
            }
            ConnectionState::Closed => {
                cell.transition(ConnectionState::Closed);
            }
        }
        cell.snapshot()
    }

    #[test]
    fn worst_prefers_most_severe_state() {
        let picked = worst(
            [
                health(1, ConnectionState::Healthy),
                health(2, ConnectionState::Reconnecting),
                health(3, ConnectionState::Degraded),
            ]
            .into_iter(),
        )
        .unwrap();
        assert_eq!(picked.connection, 2);
        assert_eq!(picked.state, ConnectionState::Reconnecting);
    }

    #[test]
    fn worst_of_nothing_is_none() {
        assert!(worst(std::iter::empty()).is_none());
    }

    #[test]
    fn auth_failure_is_fatal_for_worker() {
        assert!(WorkerError::Stream(StreamError::Auth("bad key".into())).is_fatal());
        assert!(!WorkerError::Stream(StreamError::Closed).is_fatal());
        assert!(!WorkerError::CallTimeout(Duration::from_secs(5)).is_fatal());
    }
}
