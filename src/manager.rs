//! Subscription registry and the elastic publish worker pool.
//!
//! A controller task keeps between `min_publish_worker_count` and
//! `max_publish_worker_count` workers alive while created subscriptions
//! exist (none otherwise). Each worker issues one publish request at a
//! time, piggybacking its fair share of queued acknowledgements, and
//! routes the response to the owning subscription by id.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ack::AckQueue;
use crate::error::Result;
use crate::service::{PublishResponse, SubscriptionServices};
use crate::subscription::{NotificationHandler, Subscription};
use crate::types::{SessionOptions, StatusCode, SubscriptionOptions};

/// How many removed subscription ids are remembered so stale publish
/// responses for them are dropped instead of re-deleted.
const MAX_REMOVED_IDS: usize = 10;
const MIN_PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const TIMEOUT_HINT_INCREMENT: Duration = Duration::from_secs(1);
/// Backoff applied when the server reports overload or a publish fails
/// for an unexpected reason.
const PUBLISH_BACKOFF: Duration = Duration::from_millis(500);
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(250);

/// Point-in-time counters of the manager.
#[derive(Debug, Clone)]
pub struct ManagerDiagnostics {
    pub subscription_count: usize,
    pub created_count: usize,
    pub publish_worker_count: usize,
    pub max_publish_workers: usize,
    pub good_publish_requests: u64,
    pub bad_publish_requests: u64,
    pub queued_acknowledgements: usize,
}

struct ManagerInner {
    services: Arc<dyn SubscriptionServices>,
    acks: Arc<AckQueue>,
    subscriptions: StdMutex<Vec<Arc<Subscription>>>,
    removed_ids: StdMutex<VecDeque<u32>>,
    min_workers: usize,
    max_workers: AtomicUsize,
    worker_count: AtomicUsize,
    good_publish: AtomicU64,
    bad_publish: AtomicU64,
    too_many_requests: AtomicBool,
    transfer_on_recreate: AtomicBool,
    running_tx: watch::Sender<bool>,
    update: Notify,
    cancel: CancellationToken,
    closed: AtomicBool,
    last_activity_ms: AtomicU64,
}

impl ManagerInner {
    fn subscriptions_lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Subscription>>> {
        match self.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn removed_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<u32>> {
        match self.removed_ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn created_subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions_lock()
            .iter()
            .filter(|s| s.created())
            .cloned()
            .collect()
    }

    fn desired_workers(&self) -> usize {
        let created = self
            .subscriptions_lock()
            .iter()
            .filter(|s| s.created())
            .count();
        if created == 0 {
            0
        } else {
            // the server may have pushed the limit below the configured
            // minimum
            let max = self.max_workers.load(Ordering::Acquire).max(1);
            let min = self.min_workers.min(max);
            created.clamp(min, max)
        }
    }

    /// Publish request timeout: twice the longest keep-alive window of
    /// any created subscription, clamped to a sane range.
    fn publish_timeout_hint(&self) -> Duration {
        let mut hint = Duration::ZERO;
        for subscription in self.created_subscriptions() {
            let current = subscription.current_parameters();
            let interval = if current.publishing_interval.is_zero() {
                subscription.options().publishing_interval()
            } else {
                current.publishing_interval
            };
            let count = current.keep_alive_count.max(1);
            hint = hint.max(interval.saturating_mul(count).saturating_mul(2));
        }
        hint.clamp(MIN_PUBLISH_TIMEOUT, MAX_PUBLISH_TIMEOUT)
    }

    /// How long an idle worker waits for acknowledgements before issuing
    /// an empty publish: the smallest publishing interval in use.
    fn ack_wait(&self) -> Duration {
        let mut wait = Duration::from_secs(1);
        for subscription in self.created_subscriptions() {
            let current = subscription.current_parameters();
            let interval = if current.publishing_interval.is_zero() {
                subscription.options().publishing_interval()
            } else {
                current.publishing_interval
            };
            if !interval.is_zero() {
                wait = wait.min(interval);
            }
        }
        wait.max(Duration::from_millis(10))
    }

    fn recently_removed(&self, subscription_id: u32) -> bool {
        self.removed_lock().contains(&subscription_id)
    }

    fn record_removed(&self, subscription_id: u32) {
        let mut removed = self.removed_lock();
        removed.push_back(subscription_id);
        while removed.len() > MAX_REMOVED_IDS {
            removed.pop_front();
        }
    }

    fn record_activity(&self) {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_activity_ms.store(now, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(services: Arc<dyn SubscriptionServices>, options: &SessionOptions) -> Self {
        let (running_tx, _) = watch::channel(false);
        let min_workers = options.min_publish_worker_count.max(1);
        let max_workers = options.max_publish_worker_count.max(min_workers);
        let inner = Arc::new(ManagerInner {
            services,
            acks: Arc::new(AckQueue::new()),
            subscriptions: StdMutex::new(Vec::new()),
            removed_ids: StdMutex::new(VecDeque::new()),
            min_workers,
            max_workers: AtomicUsize::new(max_workers),
            worker_count: AtomicUsize::new(0),
            good_publish: AtomicU64::new(0),
            bad_publish: AtomicU64::new(0),
            too_many_requests: AtomicBool::new(false),
            transfer_on_recreate: AtomicBool::new(options.transfer_subscriptions_on_recreate),
            running_tx,
            update: Notify::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(0),
        });
        tokio::spawn(run_controller(inner.clone()));
        Self { inner }
    }

    /// Register a subscription and start its processor. The subscription
    /// is created on the server by [`Subscription::create`].
    pub fn add(
        &self,
        options: SubscriptionOptions,
        handler: Arc<dyn NotificationHandler>,
    ) -> Arc<Subscription> {
        let subscription = Subscription::spawn(
            self.inner.services.clone(),
            self.inner.acks.clone(),
            options,
            handler,
            &self.inner.cancel,
        );
        self.inner
            .subscriptions_lock()
            .push(subscription.clone());
        self.inner.update.notify_one();
        subscription
    }

    /// Delete the subscription on the server and unregister it.
    pub async fn remove(&self, subscription: &Arc<Subscription>) -> Result<()> {
        let id = subscription.id();
        let result = subscription.delete(false).await;
        self.detach(subscription, id);
        result
    }

    fn detach(&self, subscription: &Arc<Subscription>, id: u32) {
        self.inner
            .subscriptions_lock()
            .retain(|s| !Arc::ptr_eq(s, subscription));
        if id != 0 {
            self.inner.record_removed(id);
        }
        self.inner.update.notify_one();
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.inner.subscriptions_lock().clone()
    }

    pub fn created_count(&self) -> usize {
        self.inner
            .subscriptions_lock()
            .iter()
            .filter(|s| s.created())
            .count()
    }

    /// Stop issuing publish requests, keeping queued work intact.
    pub fn pause(&self) {
        if self.inner.running_tx.send_replace(false) {
            debug!("publish pipeline paused");
        }
    }

    /// Resume publish requests; the controller tops the pool back up.
    pub fn resume(&self) {
        self.inner.record_activity();
        if !self.inner.running_tx.send_replace(true) {
            debug!("publish pipeline resumed");
        }
        self.inner.update.notify_one();
    }

    /// Signal the controller to re-evaluate the pool size.
    pub(crate) fn poke(&self) {
        self.inner.update.notify_one();
    }

    /// No good publish response within `window` while created
    /// subscriptions exist.
    pub(crate) fn publish_stalled(&self, window: Duration) -> bool {
        if self.created_count() == 0 {
            return false;
        }
        let last = self.inner.last_activity_ms.load(Ordering::Acquire);
        if last == 0 {
            return false;
        }
        let now = Utc::now().timestamp_millis().max(0) as u64;
        now.saturating_sub(last) > window.as_millis() as u64
    }

    /// Run the per-subscription keep-alive watchdogs.
    pub(crate) fn check_watchdogs(&self) {
        for subscription in self.subscriptions() {
            subscription.check_publishing_stopped();
        }
    }

    /// Re-establish all created subscriptions on a recreated session,
    /// transferring them when enabled and falling back to recreation.
    /// Runs while the pipeline is paused.
    pub(crate) async fn recreate_subscriptions(&self) {
        let created = self.inner.created_subscriptions();
        if created.is_empty() {
            return;
        }
        let mut to_recreate: Vec<Arc<Subscription>> = Vec::new();
        if self.inner.transfer_on_recreate.load(Ordering::Acquire) {
            let ids: Vec<u32> = created.iter().map(|s| s.id()).collect();
            match self
                .inner
                .services
                .transfer_subscriptions(&ids, false)
                .await
            {
                Ok(results) if results.len() == created.len() => {
                    for (subscription, result) in created.iter().zip(results) {
                        if result.status.is_good() {
                            match subscription
                                .complete_transfer(result.available_sequence_numbers)
                                .await
                            {
                                Ok(_) => info!(
                                    subscription_id = subscription.id(),
                                    "subscription transferred"
                                ),
                                Err(e) => {
                                    warn!(
                                        subscription_id = subscription.id(),
                                        error = %e,
                                        "transfer completion failed, recreating"
                                    );
                                    to_recreate.push(subscription.clone());
                                }
                            }
                        } else if result.status == StatusCode::BAD_NOTHING_TO_DO {
                            debug!(
                                subscription_id = subscription.id(),
                                "nothing to transfer"
                            );
                        } else {
                            if result.status == StatusCode::BAD_SERVICE_UNSUPPORTED {
                                self.inner
                                    .transfer_on_recreate
                                    .store(false, Ordering::Release);
                            }
                            debug!(
                                subscription_id = subscription.id(),
                                status = %result.status,
                                "transfer rejected, recreating"
                            );
                            to_recreate.push(subscription.clone());
                        }
                    }
                }
                Ok(results) => {
                    warn!(
                        expected = created.len(),
                        actual = results.len(),
                        "transfer result count mismatch, recreating all subscriptions"
                    );
                    to_recreate = created;
                }
                Err(e) => {
                    if e.status() == Some(StatusCode::BAD_SERVICE_UNSUPPORTED) {
                        self.inner
                            .transfer_on_recreate
                            .store(false, Ordering::Release);
                    }
                    warn!(error = %e, "subscription transfer failed, recreating all");
                    to_recreate = created;
                }
            }
        } else {
            to_recreate = created;
        }
        for subscription in to_recreate {
            if let Err(e) = subscription.recreate().await {
                warn!(
                    subscription_id = subscription.id(),
                    error = %e,
                    "subscription recreate failed"
                );
            }
        }
        self.inner.update.notify_one();
    }

    pub fn diagnostics(&self) -> ManagerDiagnostics {
        let subscriptions = self.inner.subscriptions_lock();
        ManagerDiagnostics {
            subscription_count: subscriptions.len(),
            created_count: subscriptions.iter().filter(|s| s.created()).count(),
            publish_worker_count: self.inner.worker_count.load(Ordering::Acquire),
            max_publish_workers: self.inner.max_workers.load(Ordering::Acquire),
            good_publish_requests: self.inner.good_publish.load(Ordering::Relaxed),
            bad_publish_requests: self.inner.bad_publish.load(Ordering::Relaxed),
            queued_acknowledgements: self.inner.acks.len(),
        }
    }

    /// Stop workers, the controller and all subscriptions. Safe to call
    /// more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.running_tx.send_replace(false);
        let subscriptions: Vec<Arc<Subscription>> =
            std::mem::take(&mut *self.inner.subscriptions_lock());
        for subscription in &subscriptions {
            let id = subscription.id();
            if let Err(e) = subscription.delete(true).await {
                debug!(subscription_id = id, error = %e, "subscription delete on close failed");
            }
            if id != 0 {
                self.inner.record_removed(id);
            }
        }
        self.inner.cancel.cancel();
        debug!("subscription manager closed");
    }
}

struct WorkerHandle {
    retire: CancellationToken,
    task: JoinHandle<()>,
    in_flight: Arc<AtomicBool>,
}

/// Retirement drains from the end of the pool, so idle workers sort last
/// and a worker holding a publish request is cancelled only when there is
/// no idle one left to retire.
fn order_for_retirement(workers: &mut [WorkerHandle]) {
    workers.sort_by_key(|w| !w.in_flight.load(Ordering::Acquire));
}

async fn run_controller(inner: Arc<ManagerInner>) {
    let mut workers: Vec<WorkerHandle> = Vec::new();
    let mut next_worker_id: usize = 0;
    let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = inner.update.notified() => {}
            _ = tick.tick() => {}
        }
        workers.retain(|w| !w.task.is_finished());
        if inner.too_many_requests.swap(false, Ordering::AcqRel) {
            let current = inner.max_workers.load(Ordering::Acquire);
            if current > 1 {
                inner.max_workers.store(current - 1, Ordering::Release);
                info!(
                    max_publish_workers = current - 1,
                    "server reported too many publish requests, lowering worker limit"
                );
            }
        }
        let desired = inner.desired_workers();
        while workers.len() < desired {
            next_worker_id += 1;
            let retire = CancellationToken::new();
            let in_flight = Arc::new(AtomicBool::new(false));
            let task = tokio::spawn(publish_worker(
                inner.clone(),
                next_worker_id,
                retire.clone(),
                in_flight.clone(),
            ));
            debug!(worker = next_worker_id, "publish worker started");
            workers.push(WorkerHandle {
                retire,
                task,
                in_flight,
            });
        }
        if workers.len() > desired {
            order_for_retirement(&mut workers);
            for worker in workers.drain(desired..) {
                worker.retire.cancel();
            }
        }
        inner.worker_count.store(workers.len(), Ordering::Release);
    }
    for worker in workers {
        worker.retire.cancel();
    }
    inner.worker_count.store(0, Ordering::Release);
    debug!("publish controller stopped");
}

async fn publish_worker(
    inner: Arc<ManagerInner>,
    worker_id: usize,
    retire: CancellationToken,
    in_flight: Arc<AtomicBool>,
) {
    let mut running = inner.running_tx.subscribe();
    let mut timeout_hint = inner.publish_timeout_hint();
    loop {
        if retire.is_cancelled() || inner.cancel.is_cancelled() {
            break;
        }
        if !*running.borrow() {
            let resumed = tokio::select! {
                _ = inner.cancel.cancelled() => false,
                _ = retire.cancelled() => false,
                r = running.wait_for(|r| *r) => r.is_ok(),
            };
            if !resumed {
                break;
            }
            continue;
        }

        let worker_count = inner.worker_count.load(Ordering::Acquire).max(1);
        let queued = inner.acks.len();
        let share = if queued == 0 {
            0
        } else {
            (queued / worker_count).max(1)
        };
        let mut acks = inner.acks.take_ready(share);
        if acks.is_empty() {
            acks = inner.acks.wait_ready(1, inner.ack_wait()).await;
            if retire.is_cancelled() || inner.cancel.is_cancelled() {
                inner.acks.requeue(acks);
                break;
            }
            if !*running.borrow() {
                inner.acks.requeue(acks);
                continue;
            }
        }

        timeout_hint = timeout_hint.max(inner.publish_timeout_hint());
        let sent = acks.clone();
        // a retired or cancelled worker abandons a held long-poll; its
        // acks go back to the queue for the remaining workers
        in_flight.store(true, Ordering::Release);
        let response = tokio::select! {
            _ = inner.cancel.cancelled() => None,
            _ = retire.cancelled() => None,
            r = inner.services.publish(timeout_hint, acks) => Some(r),
        };
        in_flight.store(false, Ordering::Release);
        let Some(response) = response else {
            inner.acks.requeue(sent);
            break;
        };
        match response {
            Ok(response) => {
                inner.record_activity();
                route_response(&inner, response);
            }
            Err(e) => {
                inner.bad_publish.fetch_add(1, Ordering::Relaxed);
                inner.acks.requeue(sent);
                handle_publish_error(&inner, worker_id, &e, &mut timeout_hint).await;
            }
        }
    }
    debug!(worker = worker_id, "publish worker stopped");
}

fn route_response(inner: &Arc<ManagerInner>, response: PublishResponse) {
    for status in &response.results {
        if status.is_bad() && *status != StatusCode::BAD_SEQUENCE_NUMBER_UNKNOWN {
            debug!(%status, "acknowledgement rejected by server");
        }
    }
    let subscription_id = response.subscription_id;
    let subscription = inner
        .subscriptions_lock()
        .iter()
        .find(|s| s.id() == subscription_id)
        .cloned();
    match subscription {
        Some(subscription) => {
            inner.good_publish.fetch_add(1, Ordering::Relaxed);
            subscription.on_publish_received(
                response.notification_message,
                Some(response.available_sequence_numbers),
                response.string_table,
            );
        }
        None if inner.recently_removed(subscription_id) => {
            inner.good_publish.fetch_add(1, Ordering::Relaxed);
            debug!(
                subscription_id,
                "dropping publish response for removed subscription"
            );
        }
        None => {
            inner.bad_publish.fetch_add(1, Ordering::Relaxed);
            warn!(
                subscription_id,
                "publish response for unknown subscription, deleting it"
            );
            let services = inner.services.clone();
            tokio::spawn(async move {
                if let Err(e) = services.delete_subscriptions(&[subscription_id]).await {
                    debug!(subscription_id, error = %e, "delete of unknown subscription failed");
                }
            });
        }
    }
}

async fn handle_publish_error(
    inner: &Arc<ManagerInner>,
    worker_id: usize,
    error: &crate::error::Error,
    timeout_hint: &mut Duration,
) {
    let status = error.status().unwrap_or(StatusCode::BAD_UNEXPECTED_ERROR);
    match status {
        StatusCode::BAD_TOO_MANY_PUBLISH_REQUESTS => {
            inner.too_many_requests.store(true, Ordering::Release);
            inner.update.notify_one();
        }
        StatusCode::BAD_NO_SUBSCRIPTION
        | StatusCode::BAD_SESSION_CLOSED
        | StatusCode::BAD_SESSION_ID_INVALID
        | StatusCode::BAD_SECURE_CHANNEL_CLOSED => {
            debug!(worker = worker_id, %status, "publish rejected, session inactive");
            tokio::time::sleep(PUBLISH_BACKOFF).await;
        }
        StatusCode::BAD_TOO_MANY_OPERATIONS | StatusCode::BAD_TCP_SERVER_TOO_BUSY => {
            warn!(worker = worker_id, %status, "server busy, throttling publish");
            tokio::time::sleep(PUBLISH_BACKOFF).await;
        }
        StatusCode::BAD_TIMEOUT | StatusCode::BAD_REQUEST_TIMEOUT => {
            *timeout_hint = (*timeout_hint + TIMEOUT_HINT_INCREMENT).min(MAX_PUBLISH_TIMEOUT);
            warn!(
                worker = worker_id,
                timeout_hint_ms = timeout_hint.as_millis() as u64,
                "publish timed out, raising timeout hint"
            );
        }
        _ => {
            warn!(worker = worker_id, error = %error, "publish failed");
            tokio::time::sleep(PUBLISH_BACKOFF).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(in_flight: bool) -> WorkerHandle {
        WorkerHandle {
            retire: CancellationToken::new(),
            task: tokio::spawn(async {}),
            in_flight: Arc::new(AtomicBool::new(in_flight)),
        }
    }

    #[tokio::test]
    async fn idle_workers_are_retired_before_in_flight_ones() {
        let mut workers = vec![worker(false), worker(true), worker(false), worker(true)];
        order_for_retirement(&mut workers);
        let flags: Vec<bool> = workers
            .iter()
            .map(|w| w.in_flight.load(Ordering::Acquire))
            .collect();
        // drained from the end: the idle workers go first
        assert_eq!(flags, vec![true, true, false, false]);
    }
}
