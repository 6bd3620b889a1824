//! Client-side subscription state and lifecycle.

mod items;
pub(crate) mod processor;

pub use items::MonitoredItem;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ack::AckQueue;
use crate::error::{Error, Result};
use crate::service::{
    CreateSubscriptionRequest, ModifySubscriptionRequest, SubscriptionServices,
};
use crate::types::{
    DataChangeNotification, EventNotificationList, MonitoredItemOptions, MonitoringMode,
    NotificationMessage, PublishState, StatusCode, SubscriptionChange, SubscriptionOptions,
};

use items::MonitoredItemSet;
use processor::{Ingest, Processor};

const DEFAULT_KEEP_ALIVE_COUNT: u32 = 10;
const DEFAULT_LIFETIME_COUNT: u32 = 1000;
/// Slack added to the keep-alive window before publishing counts as
/// stopped.
const PUBLISH_STOPPED_MARGIN: Duration = Duration::from_secs(1);

/// Context passed with every notification callback.
pub struct NotificationContext<'a> {
    pub subscription_id: u32,
    pub sequence_number: u32,
    pub publish_time: DateTime<Utc>,
    /// How the message reached the client (republish, transfer, ...).
    pub state: PublishState,
    pub string_table: &'a [String],
}

/// Receiver of subscription traffic. Implement the callbacks the
/// application cares about; the defaults ignore everything.
#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn on_data_change(
        &self,
        ctx: &NotificationContext<'_>,
        notification: DataChangeNotification,
    ) -> anyhow::Result<()> {
        let _ = (ctx, notification);
        Ok(())
    }

    async fn on_event(
        &self,
        ctx: &NotificationContext<'_>,
        notification: EventNotificationList,
    ) -> anyhow::Result<()> {
        let _ = (ctx, notification);
        Ok(())
    }

    async fn on_keep_alive(&self, ctx: &NotificationContext<'_>) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Publishing stalled, recovered, transferred or timed out.
    fn on_publish_state_change(&self, subscription_id: u32, state: PublishState) {
        let _ = (subscription_id, state);
    }

    /// Subscription or monitored item bookkeeping changed.
    fn on_subscription_change(&self, subscription_id: u32, change: SubscriptionChange) {
        let _ = (subscription_id, change);
    }
}

/// Server-revised subscription parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RevisedParameters {
    pub publishing_interval: Duration,
    pub keep_alive_count: u32,
    pub lifetime_count: u32,
}

/// State shared between the subscription facade and its processor task.
pub(crate) struct SubscriptionCore {
    id: AtomicU32,
    options: StdMutex<SubscriptionOptions>,
    current: StdMutex<RevisedParameters>,
    last_notification_ms: AtomicU64,
    stopped: AtomicBool,
    notification_count: AtomicU64,
}

impl SubscriptionCore {
    fn new(options: SubscriptionOptions) -> Self {
        Self {
            id: AtomicU32::new(0),
            options: StdMutex::new(options),
            current: StdMutex::new(RevisedParameters::default()),
            last_notification_ms: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            notification_count: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }

    pub(crate) fn concurrent_dispatch(&self) -> bool {
        self.options_lock().concurrent_dispatch
    }

    pub(crate) fn count_notification(&self) {
        self.notification_count.fetch_add(1, Ordering::Relaxed);
    }

    fn options_lock(&self) -> std::sync::MutexGuard<'_, SubscriptionOptions> {
        match self.options.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn current_lock(&self) -> std::sync::MutexGuard<'_, RevisedParameters> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Window within which the server must produce at least a keep-alive.
    fn keep_alive_window(&self) -> Duration {
        let current = *self.current_lock();
        let (interval, count) = if current.keep_alive_count > 0 {
            (current.publishing_interval, current.keep_alive_count)
        } else {
            let options = self.options_lock();
            (options.publishing_interval(), DEFAULT_KEEP_ALIVE_COUNT)
        };
        let window = interval.saturating_mul(count.saturating_add(1));
        window.max(Duration::from_secs(1))
    }

    fn touch(&self) {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_notification_ms.store(now, Ordering::Release);
    }

    fn publishing_stopped(&self) -> bool {
        let last = self.last_notification_ms.load(Ordering::Acquire);
        if last == 0 {
            return false;
        }
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let window = self.keep_alive_window() + PUBLISH_STOPPED_MARGIN;
        now.saturating_sub(last) > window.as_millis() as u64
    }
}

/// Raise zero counts to their defaults and keep the lifetime at least
/// three keep-alive cycles, long enough to cover the minimum lifetime
/// interval.
fn adjust_counts(options: &SubscriptionOptions) -> (u32, u32) {
    let keep_alive = if options.keep_alive_count == 0 {
        DEFAULT_KEEP_ALIVE_COUNT
    } else {
        options.keep_alive_count
    };
    let mut lifetime = options.lifetime_count;
    if lifetime == 0 {
        if options.min_lifetime_interval_ms > 0 && options.publishing_interval_ms > 0 {
            lifetime = options
                .min_lifetime_interval_ms
                .div_ceil(options.publishing_interval_ms) as u32;
        } else {
            lifetime = DEFAULT_LIFETIME_COUNT;
        }
    }
    lifetime = lifetime.max(keep_alive.saturating_mul(3));
    (keep_alive, lifetime)
}

/// Point-in-time counters for one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionDiagnostics {
    pub subscription_id: u32,
    pub created: bool,
    pub monitored_item_count: usize,
    pub notification_count: u64,
    pub publishing_stopped: bool,
}

pub struct Subscription {
    core: Arc<SubscriptionCore>,
    items: MonitoredItemSet,
    services: Arc<dyn SubscriptionServices>,
    handler: Arc<dyn NotificationHandler>,
    ingest_tx: mpsc::UnboundedSender<Ingest>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Subscription {
    pub(crate) fn spawn(
        services: Arc<dyn SubscriptionServices>,
        acks: Arc<AckQueue>,
        options: SubscriptionOptions,
        handler: Arc<dyn NotificationHandler>,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        let core = Arc::new(SubscriptionCore::new(options));
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let cancel = parent_cancel.child_token();
        let processor = Processor::new(
            core.clone(),
            services.clone(),
            acks,
            handler.clone(),
            ingest_rx,
            cancel.clone(),
        );
        tokio::spawn(processor.run());
        Arc::new(Self {
            core,
            items: MonitoredItemSet::new(),
            services,
            handler,
            ingest_tx,
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    /// Server-assigned id, 0 while not created.
    pub fn id(&self) -> u32 {
        self.core.id()
    }

    pub fn created(&self) -> bool {
        self.core.id() != 0
    }

    pub fn options(&self) -> SubscriptionOptions {
        self.core.options_lock().clone()
    }

    /// Parameters as revised by the server on the last create or modify.
    pub fn current_parameters(&self) -> RevisedParameters {
        *self.core.current_lock()
    }

    pub fn diagnostics(&self) -> SubscriptionDiagnostics {
        SubscriptionDiagnostics {
            subscription_id: self.core.id(),
            created: self.created(),
            monitored_item_count: self.items.len(),
            notification_count: self.core.notification_count.load(Ordering::Relaxed),
            publishing_stopped: self.core.stopped.load(Ordering::Acquire),
        }
    }

    /// Register a monitored item locally; created on the server by the
    /// next [`apply_item_changes`](Self::apply_item_changes). Returns the
    /// client handle notifications will carry.
    pub fn add_item(&self, options: MonitoredItemOptions) -> u32 {
        self.items.add(options)
    }

    pub fn remove_item(&self, client_handle: u32) -> bool {
        self.items.remove(client_handle)
    }

    pub fn modify_item<F>(&self, client_handle: u32, f: F) -> bool
    where
        F: FnOnce(&mut MonitoredItemOptions),
    {
        self.items.modify(client_handle, f)
    }

    pub fn item(&self, client_handle: u32) -> Option<MonitoredItem> {
        self.items.get(client_handle)
    }

    pub fn monitored_items(&self) -> Vec<MonitoredItem> {
        self.items.snapshot()
    }

    /// Create the subscription on the server and push pending item
    /// changes.
    pub async fn create(&self) -> Result<()> {
        if self.created() {
            return Err(Error::InvalidState {
                operation: "create subscription",
                state: "already created".to_string(),
            });
        }
        let options = self.options();
        let (keep_alive_count, lifetime_count) = adjust_counts(&options);
        let result = self
            .services
            .create_subscription(CreateSubscriptionRequest {
                publishing_interval: options.publishing_interval(),
                lifetime_count,
                keep_alive_count,
                max_notifications_per_publish: options.max_notifications_per_publish,
                publishing_enabled: options.publishing_enabled,
                priority: options.priority,
            })
            .await?;
        self.core.set_id(result.subscription_id);
        *self.core.current_lock() = RevisedParameters {
            publishing_interval: result.revised_publishing_interval,
            keep_alive_count: result.revised_keep_alive_count,
            lifetime_count: result.revised_lifetime_count,
        };
        self.core.touch();
        info!(
            subscription_id = result.subscription_id,
            publishing_interval_ms = result.revised_publishing_interval.as_millis() as u64,
            keep_alive_count = result.revised_keep_alive_count,
            "subscription created"
        );
        self.handler
            .on_subscription_change(result.subscription_id, SubscriptionChange::CREATED);
        self.apply_item_changes().await
    }

    /// Push the desired parameters to the server.
    pub async fn modify(&self) -> Result<()> {
        let id = self.require_created()?;
        let options = self.options();
        let (keep_alive_count, lifetime_count) = adjust_counts(&options);
        let result = self
            .services
            .modify_subscription(ModifySubscriptionRequest {
                subscription_id: id,
                publishing_interval: options.publishing_interval(),
                lifetime_count,
                keep_alive_count,
                max_notifications_per_publish: options.max_notifications_per_publish,
                priority: options.priority,
            })
            .await?;
        *self.core.current_lock() = RevisedParameters {
            publishing_interval: result.revised_publishing_interval,
            keep_alive_count: result.revised_keep_alive_count,
            lifetime_count: result.revised_lifetime_count,
        };
        self.handler
            .on_subscription_change(id, SubscriptionChange::MODIFIED);
        Ok(())
    }

    pub fn update_options<F>(&self, f: F)
    where
        F: FnOnce(&mut SubscriptionOptions),
    {
        f(&mut self.core.options_lock());
    }

    pub async fn set_publishing_enabled(&self, enabled: bool) -> Result<()> {
        let id = self.require_created()?;
        let results = self.services.set_publishing_mode(enabled, &[id]).await?;
        match results.first() {
            Some(status) if status.is_bad() => return Err(Error::Service(*status)),
            Some(_) => {}
            None => {
                return Err(Error::ResultCountMismatch {
                    expected: 1,
                    actual: 0,
                })
            }
        }
        self.core.options_lock().publishing_enabled = enabled;
        self.handler
            .on_subscription_change(id, SubscriptionChange::MODIFIED);
        Ok(())
    }

    pub async fn set_monitoring_mode(
        &self,
        mode: MonitoringMode,
        client_handles: &[u32],
    ) -> Result<Vec<StatusCode>> {
        let id = self.require_created()?;
        let server_ids = self.items.server_ids(client_handles);
        if server_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.services
            .set_monitoring_mode(id, mode, &server_ids)
            .await
    }

    /// Push pending monitored item deletes, modifies and creates.
    pub async fn apply_item_changes(&self) -> Result<()> {
        let id = self.require_created()?;
        let change = self.items.apply_changes(self.services.as_ref(), id).await?;
        if !change.is_empty() {
            self.handler.on_subscription_change(id, change);
        }
        Ok(())
    }

    /// Delete the subscription on the server and stop its processor.
    /// Safe to call more than once; later calls are no-ops.
    pub async fn delete(&self, silent: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let id = self.core.id();
        self.cancel.cancel();
        if id != 0 {
            match self.services.delete_subscriptions(&[id]).await {
                Ok(results) => {
                    if let Some(status) = results.first().filter(|s| s.is_bad()) {
                        warn!(subscription_id = id, %status, "subscription delete returned bad status");
                    }
                }
                Err(e) if silent => {
                    warn!(subscription_id = id, error = %e, "subscription delete failed");
                }
                Err(e) => return Err(e),
            }
            self.core.set_id(0);
            self.handler
                .on_subscription_change(id, SubscriptionChange::DELETED);
        }
        debug!(subscription_id = id, "subscription closed");
        Ok(())
    }

    /// Forget server state and create the subscription anew. Used when a
    /// recreated session could not transfer it.
    pub(crate) async fn recreate(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let old_id = self.core.id();
        self.core.set_id(0);
        self.items.reset_for_recreate();
        let _ = self.ingest_tx.send(Ingest::ResetCursor {
            available: Vec::new(),
            republish: false,
            transferred: false,
        });
        info!(old_subscription_id = old_id, "recreating subscription");
        self.create().await
    }

    /// Finish a successful server-side transfer: resynchronize handles,
    /// reset the sequence cursor and recover or flush the transferred
    /// retransmission queue.
    pub(crate) async fn complete_transfer(&self, available: Vec<u32>) -> Result<bool> {
        let id = self.require_created()?;
        let synced = self
            .items
            .sync_server_handles(self.services.as_ref(), id)
            .await?;
        let republish = self.options().republish_after_transfer;
        let _ = self.ingest_tx.send(Ingest::ResetCursor {
            available,
            republish,
            transferred: true,
        });
        self.core.touch();
        self.apply_item_changes().await?;
        self.handler
            .on_subscription_change(id, SubscriptionChange::TRANSFERRED);
        Ok(synced)
    }

    /// Hand one received message to the processor. Never blocks the
    /// publish worker.
    pub(crate) fn on_publish_received(
        &self,
        message: NotificationMessage,
        available: Option<Vec<u32>>,
        string_table: Vec<String>,
    ) {
        self.core.touch();
        if self.core.stopped.swap(false, Ordering::AcqRel) {
            self.handler
                .on_publish_state_change(self.core.id(), PublishState::RECOVERED);
        }
        let _ = self.ingest_tx.send(Ingest::Message {
            message,
            available,
            string_table,
        });
    }

    /// Watchdog probe: flags the subscription as stopped when the
    /// keep-alive window elapsed without traffic. Returns the current
    /// stopped state.
    pub(crate) fn check_publishing_stopped(&self) -> bool {
        if !self.created() {
            return false;
        }
        if self.core.publishing_stopped() {
            if !self.core.stopped.swap(true, Ordering::AcqRel) {
                warn!(
                    subscription_id = self.core.id(),
                    "publishing stopped, no notification within the keep-alive window"
                );
                self.handler
                    .on_publish_state_change(self.core.id(), PublishState::STOPPED);
            }
            true
        } else {
            false
        }
    }

    fn require_created(&self) -> Result<u32> {
        let id = self.core.id();
        if id == 0 {
            return Err(Error::NotCreated);
        }
        Ok(id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
