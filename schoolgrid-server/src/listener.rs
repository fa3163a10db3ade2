//! Registration listener - grows the connection registry at runtime.
//!
//! Subscribes to the provisioning channel and registers each announced
//! tenant database. The subscription is supervised: when it fails or the
//! stream is lost, the loop backs off exponentially and resubscribes, and
//! after every reconnect the active directory rows are re-registered to catch
//! announcements that went out while the channel was down.
//!
//! Every message is handled in isolation. A malformed payload, an unknown or
//! inactive tenant, a failed registration, even a panic in the handler, is
//! logged and counted, and the loop moves on to the next message.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use schoolgrid_core::config::ListenerSection;
use schoolgrid_core::{DbKey, TenantId};
use serde::Serialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::db::TenantDirectory;
use crate::registry::{ConnectionRegistry, Registration};

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("notification stream lost: {0}")]
    ConnectionLost(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// ============================================================================
// Sources
// ============================================================================

/// Where notifications come from.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, ListenerError>;
}

/// One live subscription. `next` fails once the stream is gone.
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Result<String, ListenerError>;
}

/// Postgres `LISTEN` on the control-plane database.
#[derive(Clone)]
pub struct PgNotificationSource {
    pool: PgPool,
}

impl PgNotificationSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, ListenerError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        Ok(Box::new(PgSubscription(listener)))
    }
}

struct PgSubscription(PgListener);

#[async_trait]
impl Subscription for PgSubscription {
    async fn next(&mut self) -> Result<String, ListenerError> {
        match self.0.try_recv().await? {
            Some(notification) => Ok(notification.payload().to_owned()),
            None => Err(ListenerError::ConnectionLost(
                "postgres connection closed".into(),
            )),
        }
    }
}

#[derive(Default)]
struct ChannelInner {
    subscribers: Vec<mpsc::UnboundedSender<String>>,
    failing_subscribes: u32,
}

/// In-process source; pair it with the [`ChannelPublisher`] from
/// [`ChannelSource::pair`].
#[derive(Clone)]
pub struct ChannelSource {
    inner: Arc<Mutex<ChannelInner>>,
}

#[derive(Clone)]
pub struct ChannelPublisher {
    inner: Arc<Mutex<ChannelInner>>,
}

impl ChannelSource {
    pub fn pair() -> (Self, ChannelPublisher) {
        let inner = Arc::new(Mutex::new(ChannelInner::default()));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            ChannelPublisher { inner },
        )
    }
}

fn lock(inner: &Mutex<ChannelInner>) -> std::sync::MutexGuard<'_, ChannelInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn subscribe(&self, _channel: &str) -> Result<Box<dyn Subscription>, ListenerError> {
        let mut inner = lock(&self.inner);
        if inner.failing_subscribes > 0 {
            inner.failing_subscribes -= 1;
            return Err(ListenerError::Subscribe("channel unavailable".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.push(tx);
        Ok(Box::new(ChannelSubscription(rx)))
    }
}

struct ChannelSubscription(mpsc::UnboundedReceiver<String>);

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn next(&mut self) -> Result<String, ListenerError> {
        self.0
            .recv()
            .await
            .ok_or_else(|| ListenerError::ConnectionLost("channel closed".into()))
    }
}

impl ChannelPublisher {
    /// Deliver to every live subscriber. Returns how many received it.
    pub fn publish(&self, payload: impl Into<String>) -> usize {
        let payload = payload.into();
        let mut inner = lock(&self.inner);
        inner.subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        inner.subscribers.len()
    }

    /// Drop every live subscription, as a lost connection would.
    pub fn disconnect(&self) {
        lock(&self.inner).subscribers.clear();
    }

    /// Make the next `n` subscribe attempts fail.
    pub fn fail_subscribes(&self, n: u32) {
        lock(&self.inner).failing_subscribes = n;
    }
}

// ============================================================================
// Health and stats
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ListenerHealth {
    Starting,
    Connected,
    Stalled { attempts: u32, last_error: String },
    Stopped,
}

impl ListenerHealth {
    pub fn is_connected(&self) -> bool {
        matches!(self, ListenerHealth::Connected)
    }
}

#[derive(Debug, Default)]
pub struct ListenerStats {
    processed: AtomicU64,
    registered: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub registered: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub reconnects: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            registered: self.registered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &MessageOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            MessageOutcome::Registered(_) => &self.registered,
            MessageOutcome::AlreadyRegistered(_) => &self.duplicates,
            MessageOutcome::Dropped(_) => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Exponential backoff, doubling up to a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ============================================================================
// Listener
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed(String),
    UnknownKey(DbKey),
    Inactive(TenantId),
    Failed(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Malformed(reason) => write!(f, "malformed payload: {}", reason),
            DropReason::UnknownKey(key) => write!(f, "no directory row for '{}'", key),
            DropReason::Inactive(tenant) => write!(f, "tenant {} is inactive", tenant),
            DropReason::Failed(reason) => write!(f, "handler failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Registered(TenantId),
    AlreadyRegistered(TenantId),
    Dropped(DropReason),
}

pub struct RegistrationListener {
    source: Arc<dyn NotificationSource>,
    directory: Arc<dyn TenantDirectory>,
    registry: Arc<ConnectionRegistry>,
    channel: String,
    initial_backoff: Duration,
    max_backoff: Duration,
    stats: Arc<ListenerStats>,
}

impl RegistrationListener {
    pub fn new(
        source: Arc<dyn NotificationSource>,
        directory: Arc<dyn TenantDirectory>,
        registry: Arc<ConnectionRegistry>,
        settings: &ListenerSection,
    ) -> Self {
        Self {
            source,
            directory,
            registry,
            channel: settings.channel.clone(),
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
            stats: Arc::new(ListenerStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    /// Handle one notification payload.
    pub async fn handle_payload(&self, payload: &str) -> MessageOutcome {
        let key = match DbKey::parse(payload) {
            Ok(key) => key,
            Err(err) => return MessageOutcome::Dropped(DropReason::Malformed(err.to_string())),
        };

        let descriptor = match self.directory.find_by_key(&key).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return MessageOutcome::Dropped(DropReason::UnknownKey(key)),
            Err(err) => return MessageOutcome::Dropped(DropReason::Failed(err.to_string())),
        };
        if !descriptor.is_active {
            return MessageOutcome::Dropped(DropReason::Inactive(descriptor.tenant_id));
        }

        match self.registry.register(&descriptor) {
            Ok(Registration::Added) => MessageOutcome::Registered(descriptor.tenant_id),
            Ok(Registration::AlreadyPresent) => {
                MessageOutcome::AlreadyRegistered(descriptor.tenant_id)
            }
            Err(err) => MessageOutcome::Dropped(DropReason::Failed(err.to_string())),
        }
    }

    /// Handle one message inside its own failure boundary.
    async fn process(&self, payload: &str) -> MessageOutcome {
        let outcome = AssertUnwindSafe(self.handle_payload(payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| MessageOutcome::Dropped(DropReason::Failed("handler panicked".into())));

        self.stats.record(&outcome);
        match &outcome {
            MessageOutcome::Registered(tenant) => {
                tracing::info!(%tenant, db_key = payload.trim(), "tenant registered from notification");
            }
            MessageOutcome::AlreadyRegistered(tenant) => {
                tracing::debug!(%tenant, "duplicate registration notification");
            }
            MessageOutcome::Dropped(reason) => {
                tracing::warn!(%reason, payload, "registration notification dropped");
            }
        }
        outcome
    }

    /// Register every active directory row. Used after a reconnect.
    async fn resync(&self) {
        let descriptors = match self.directory.active_descriptors().await {
            Ok(descriptors) => descriptors,
            Err(err) => {
                tracing::warn!(error = %err, "resync after reconnect failed");
                return;
            }
        };
        let mut added = 0;
        for descriptor in &descriptors {
            match self.registry.register(descriptor) {
                Ok(Registration::Added) => added += 1,
                Ok(Registration::AlreadyPresent) => {}
                Err(err) => {
                    tracing::warn!(tenant = %descriptor.tenant_id, error = %err, "resync registration failed")
                }
            }
        }
        tracing::info!(active = descriptors.len(), added, "registry resynced after reconnect");
    }

    /// Start the supervised loop on its own task.
    pub fn spawn(self) -> ListenerHandle {
        let (health_tx, health_rx) = watch::channel(ListenerHealth::Starting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(self.run(health_tx, shutdown_rx));
        ListenerHandle {
            status: ListenerStatus {
                health: health_rx,
                stats,
            },
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, health: watch::Sender<ListenerHealth>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.initial_backoff, self.max_backoff);
        let mut attempts = 0u32;
        let mut connected_before = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let subscribed = tokio::select! {
                result = self.source.subscribe(&self.channel) => result,
                _ = shutdown.changed() => break,
            };

            let err = match subscribed {
                Ok(mut subscription) => {
                    attempts = 0;
                    backoff.reset();
                    if connected_before {
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        self.resync().await;
                    }
                    connected_before = true;

                    health.send_replace(ListenerHealth::Connected);
                    tracing::info!(channel = %self.channel, "listening for tenant registrations");

                    match self.pump(subscription.as_mut(), &mut shutdown).await {
                        Some(err) => err,
                        None => break,
                    }
                }
                Err(err) => err,
            };

            attempts += 1;
            let delay = backoff.next_delay();
            tracing::warn!(
                channel = %self.channel,
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "registration listener stalled"
            );
            health.send_replace(ListenerHealth::Stalled {
                attempts,
                last_error: err.to_string(),
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        health.send_replace(ListenerHealth::Stopped);
        tracing::info!(channel = %self.channel, "registration listener stopped");
    }

    /// Drain one subscription. `None` means shutdown was requested.
    async fn pump(
        &self,
        subscription: &mut dyn Subscription,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<ListenerError> {
        loop {
            tokio::select! {
                next = subscription.next() => match next {
                    Ok(payload) => {
                        self.process(&payload).await;
                    }
                    Err(err) => return Some(err),
                },
                _ = shutdown.changed() => return None,
            }
        }
    }
}

/// Read-only view of a running listener.
#[derive(Clone)]
pub struct ListenerStatus {
    health: watch::Receiver<ListenerHealth>,
    stats: Arc<ListenerStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerReport {
    pub health: ListenerHealth,
    pub stats: StatsSnapshot,
}

impl ListenerStatus {
    pub fn health(&self) -> ListenerHealth {
        self.health.borrow().clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn report(&self) -> ListenerReport {
        ListenerReport {
            health: self.health(),
            stats: self.stats(),
        }
    }

    pub fn watch(&self) -> watch::Receiver<ListenerHealth> {
        self.health.clone()
    }
}

/// Owner of a running listener. Dropping it stops the loop.
pub struct ListenerHandle {
    status: ListenerStatus,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn status(&self) -> ListenerStatus {
        self.status.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "registration listener task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DirectoryError, MemoryDirectory};
    use crate::registry::tests::{descriptor, CountingFactory};
    use schoolgrid_core::ConnectionDescriptor;

    fn settings() -> ListenerSection {
        ListenerSection {
            channel: "new_db_created".into(),
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        }
    }

    struct Fixture {
        directory: Arc<MemoryDirectory>,
        registry: Arc<ConnectionRegistry>,
        publisher: ChannelPublisher,
        handle: ListenerHandle,
    }

    async fn start(rows: Vec<ConnectionDescriptor>) -> Fixture {
        let directory = Arc::new(MemoryDirectory::with_rows(rows));
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(CountingFactory::default())));
        let (source, publisher) = ChannelSource::pair();
        let handle = RegistrationListener::new(
            Arc::new(source),
            directory.clone(),
            Arc::clone(&registry),
            &settings(),
        )
        .spawn();
        wait_connected(&handle).await;
        Fixture {
            directory,
            registry,
            publisher,
            handle,
        }
    }

    async fn wait_connected(handle: &ListenerHandle) {
        let mut health = handle.status().watch();
        tokio::time::timeout(Duration::from_secs(2), health.wait_for(|h| h.is_connected()))
            .await
            .expect("listener never connected")
            .unwrap();
    }

    async fn wait_processed(handle: &ListenerHandle, n: u64) {
        let status = handle.status();
        tokio::time::timeout(Duration::from_secs(2), async {
            while status.stats().processed < n {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("messages not processed in time");
    }

    #[test]
    fn backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn new_tenant_becomes_resolvable_without_restart() {
        let fx = start(vec![descriptor(1)]).await;
        assert!(!fx.registry.contains(TenantId(3)));

        fx.directory.upsert(descriptor(3));
        fx.publisher.publish("school_3_db");
        wait_processed(&fx.handle, 1).await;

        assert!(fx.registry.resolve(TenantId(3)).is_ok());
        assert_eq!(fx.handle.status().stats().registered, 1);
        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_notification_is_a_noop() {
        let fx = start(vec![descriptor(1)]).await;
        fx.publisher.publish("school_1_db");
        fx.publisher.publish("school_1_db");
        wait_processed(&fx.handle, 2).await;

        assert_eq!(fx.registry.len(), 1);
        let stats = fx.handle.status().stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.duplicates, 1);
        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn inactive_tenant_is_not_registered() {
        let fx = start(vec![descriptor(4).inactive()]).await;
        fx.publisher.publish("school_4_db");
        wait_processed(&fx.handle, 1).await;

        assert!(fx.registry.is_empty());
        assert_eq!(fx.handle.status().stats().dropped, 1);
        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_and_loop_continues() {
        let fx = start(vec![descriptor(2)]).await;
        fx.publisher.publish("DROP TABLE school;");
        fx.publisher.publish("");
        fx.publisher.publish("unknown_db");
        fx.publisher.publish(" school_2_db\n");
        wait_processed(&fx.handle, 4).await;

        assert!(fx.registry.contains(TenantId(2)));
        let stats = fx.handle.status().stats();
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.registered, 1);
        assert!(fx.handle.status().health().is_connected());
        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn reconnects_after_loss_and_resyncs_missed_tenants() {
        let fx = start(vec![descriptor(1)]).await;
        let mut health = fx.handle.status().watch();

        fx.publisher.fail_subscribes(2);
        fx.publisher.disconnect();
        // announced while nobody is listening
        fx.directory.upsert(descriptor(5));
        assert_eq!(fx.publisher.publish("school_5_db"), 0);

        tokio::time::timeout(
            Duration::from_secs(2),
            health.wait_for(|h| matches!(h, ListenerHealth::Stalled { attempts, .. } if *attempts >= 2)),
        )
        .await
        .unwrap()
        .unwrap();
        wait_connected(&fx.handle).await;

        assert!(fx.registry.contains(TenantId(1)));
        assert!(fx.registry.contains(TenantId(5)));
        assert_eq!(fx.handle.status().stats().reconnects, 1);

        // and live traffic flows again
        fx.directory.upsert(descriptor(6));
        fx.publisher.publish("school_6_db");
        wait_processed(&fx.handle, 1).await;
        assert!(fx.registry.contains(TenantId(6)));
        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_reports_stopped() {
        let fx = start(vec![]).await;
        let status = fx.handle.status();
        fx.handle.shutdown().await;
        assert_eq!(status.health(), ListenerHealth::Stopped);
    }

    /// Directory whose lookups panic.
    struct PanickingDirectory;

    #[async_trait]
    impl TenantDirectory for PanickingDirectory {
        async fn active_descriptors(&self) -> Result<Vec<ConnectionDescriptor>, DirectoryError> {
            Ok(Vec::new())
        }
        async fn find_by_key(&self, _key: &DbKey) -> Result<Option<ConnectionDescriptor>, DirectoryError> {
            panic!("lookup exploded")
        }
        async fn find_by_tenant(&self, _t: TenantId) -> Result<Option<ConnectionDescriptor>, DirectoryError> {
            Ok(None)
        }
        async fn find_school(&self, _t: TenantId) -> Result<Option<schoolgrid_core::Tenant>, DirectoryError> {
            Ok(None)
        }
        async fn insert(&self, _d: &ConnectionDescriptor) -> Result<(), DirectoryError> {
            Ok(())
        }
        async fn set_active(&self, _t: TenantId, _a: bool) -> Result<bool, DirectoryError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_the_loop() {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(CountingFactory::default())));
        let (source, publisher) = ChannelSource::pair();
        let handle = RegistrationListener::new(
            Arc::new(source),
            Arc::new(PanickingDirectory),
            registry,
            &settings(),
        )
        .spawn();
        wait_connected(&handle).await;

        publisher.publish("school_1_db");
        publisher.publish("school_2_db");
        wait_processed(&handle, 2).await;

        assert_eq!(handle.status().stats().dropped, 2);
        assert!(handle.status().health().is_connected());
        handle.shutdown().await;
    }
}
