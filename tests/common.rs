//! Shared test doubles for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Notify;

use ua_client::error::{Error, Result};
use ua_client::service::{
    CreateSubscriptionRequest, ModifySubscriptionRequest, MonitoredItemCreateRequest,
    MonitoredItemModifyRequest, MonitoredItemResult, PublishResponse, ServerMonitoredItem,
    SessionHandle, SessionTransport, SubscriptionCreateResult, SubscriptionModifyResult,
    SubscriptionServices, TransferResult, UserIdentity,
};
use ua_client::subscription::{NotificationContext, NotificationHandler};
use ua_client::types::{
    DataChangeNotification, MonitoredItemValue, MonitoringMode, NotificationData,
    NotificationMessage, PublishState, SessionOptions, StatusCode, SubscriptionAcknowledgement,
    SubscriptionChange,
};

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn data_message(sequence_number: u32) -> NotificationMessage {
    NotificationMessage {
        sequence_number,
        publish_time: Utc::now(),
        notifications: vec![NotificationData::DataChange(DataChangeNotification {
            values: vec![MonitoredItemValue {
                client_handle: 1,
                ..Default::default()
            }],
        })],
    }
}

pub fn publish_response(
    subscription_id: u32,
    message: NotificationMessage,
    available: &[u32],
) -> PublishResponse {
    PublishResponse {
        subscription_id,
        available_sequence_numbers: available.to_vec(),
        more_notifications: false,
        notification_message: message,
        results: Vec::new(),
        string_table: Vec::new(),
    }
}

pub fn keep_alive_response(
    subscription_id: u32,
    sequence_number: u32,
    available: &[u32],
) -> PublishResponse {
    publish_response(
        subscription_id,
        NotificationMessage::keep_alive(sequence_number, Utc::now()),
        available,
    )
}

/// Scripted in-process stand-in for the server's subscription services.
pub struct MockServices {
    publish_queue: Mutex<VecDeque<Result<PublishResponse>>>,
    publish_notify: Notify,
    pub acks_seen: Mutex<Vec<SubscriptionAcknowledgement>>,
    pub republish_store: Mutex<HashMap<(u32, u32), NotificationMessage>>,
    pub republish_calls: Mutex<Vec<(u32, u32)>>,
    pub created_ids: Mutex<Vec<u32>>,
    pub deleted_ids: Mutex<Vec<u32>>,
    pub transfer_results: Mutex<HashMap<u32, TransferResult>>,
    pub server_items: Mutex<HashMap<u32, Vec<ServerMonitoredItem>>>,
    next_subscription_id: AtomicU32,
    next_item_id: AtomicU32,
}

impl MockServices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            publish_queue: Mutex::new(VecDeque::new()),
            publish_notify: Notify::new(),
            acks_seen: Mutex::new(Vec::new()),
            republish_store: Mutex::new(HashMap::new()),
            republish_calls: Mutex::new(Vec::new()),
            created_ids: Mutex::new(Vec::new()),
            deleted_ids: Mutex::new(Vec::new()),
            transfer_results: Mutex::new(HashMap::new()),
            server_items: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU32::new(100),
            next_item_id: AtomicU32::new(1000),
        })
    }

    pub fn queue_publish(&self, response: Result<PublishResponse>) {
        self.publish_queue.lock().unwrap().push_back(response);
        self.publish_notify.notify_waiters();
    }

    pub fn store_republish(&self, subscription_id: u32, message: NotificationMessage) {
        self.republish_store
            .lock()
            .unwrap()
            .insert((subscription_id, message.sequence_number), message);
    }

    pub fn acked_sequence_numbers(&self, subscription_id: u32) -> Vec<u32> {
        self.acks_seen
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.subscription_id == subscription_id)
            .map(|a| a.sequence_number)
            .collect()
    }
}

#[async_trait]
impl SubscriptionServices for MockServices {
    async fn publish(
        &self,
        _timeout_hint: Duration,
        acknowledgements: Vec<SubscriptionAcknowledgement>,
    ) -> Result<PublishResponse> {
        self.acks_seen.lock().unwrap().extend(acknowledgements);
        loop {
            let notified = self.publish_notify.notified();
            if let Some(response) = self.publish_queue.lock().unwrap().pop_front() {
                return response;
            }
            // the server holds the request until it has something to say
            notified.await;
        }
    }

    async fn republish(
        &self,
        subscription_id: u32,
        retransmit_sequence_number: u32,
    ) -> Result<NotificationMessage> {
        self.republish_calls
            .lock()
            .unwrap()
            .push((subscription_id, retransmit_sequence_number));
        self.republish_store
            .lock()
            .unwrap()
            .get(&(subscription_id, retransmit_sequence_number))
            .cloned()
            .ok_or(Error::Service(StatusCode::BAD_MESSAGE_NOT_AVAILABLE))
    }

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<SubscriptionCreateResult> {
        let subscription_id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.created_ids.lock().unwrap().push(subscription_id);
        Ok(SubscriptionCreateResult {
            subscription_id,
            revised_publishing_interval: request.publishing_interval,
            revised_lifetime_count: request.lifetime_count,
            revised_keep_alive_count: request.keep_alive_count,
        })
    }

    async fn modify_subscription(
        &self,
        request: ModifySubscriptionRequest,
    ) -> Result<SubscriptionModifyResult> {
        Ok(SubscriptionModifyResult {
            revised_publishing_interval: request.publishing_interval,
            revised_lifetime_count: request.lifetime_count,
            revised_keep_alive_count: request.keep_alive_count,
        })
    }

    async fn set_publishing_mode(
        &self,
        _publishing_enabled: bool,
        subscription_ids: &[u32],
    ) -> Result<Vec<StatusCode>> {
        Ok(vec![StatusCode::GOOD; subscription_ids.len()])
    }

    async fn transfer_subscriptions(
        &self,
        subscription_ids: &[u32],
        _send_initial_values: bool,
    ) -> Result<Vec<TransferResult>> {
        let scripted = self.transfer_results.lock().unwrap();
        Ok(subscription_ids
            .iter()
            .map(|id| {
                scripted.get(id).cloned().unwrap_or(TransferResult {
                    status: StatusCode::GOOD,
                    available_sequence_numbers: Vec::new(),
                })
            })
            .collect())
    }

    async fn delete_subscriptions(&self, subscription_ids: &[u32]) -> Result<Vec<StatusCode>> {
        self.deleted_ids
            .lock()
            .unwrap()
            .extend_from_slice(subscription_ids);
        Ok(vec![StatusCode::GOOD; subscription_ids.len()])
    }

    async fn create_monitored_items(
        &self,
        _subscription_id: u32,
        requests: Vec<MonitoredItemCreateRequest>,
    ) -> Result<Vec<MonitoredItemResult>> {
        Ok(requests
            .iter()
            .map(|request| MonitoredItemResult {
                status: StatusCode::GOOD,
                monitored_item_id: self.next_item_id.fetch_add(1, Ordering::Relaxed),
                revised_sampling_interval: Duration::from_millis(
                    request.options.sampling_interval_ms,
                ),
                revised_queue_size: request.options.queue_size,
            })
            .collect())
    }

    async fn modify_monitored_items(
        &self,
        _subscription_id: u32,
        requests: Vec<MonitoredItemModifyRequest>,
    ) -> Result<Vec<MonitoredItemResult>> {
        Ok(requests
            .iter()
            .map(|request| MonitoredItemResult {
                status: StatusCode::GOOD,
                monitored_item_id: request.monitored_item_id,
                revised_sampling_interval: request.sampling_interval,
                revised_queue_size: request.queue_size,
            })
            .collect())
    }

    async fn delete_monitored_items(
        &self,
        _subscription_id: u32,
        monitored_item_ids: &[u32],
    ) -> Result<Vec<StatusCode>> {
        Ok(vec![StatusCode::GOOD; monitored_item_ids.len()])
    }

    async fn set_monitoring_mode(
        &self,
        _subscription_id: u32,
        _mode: MonitoringMode,
        monitored_item_ids: &[u32],
    ) -> Result<Vec<StatusCode>> {
        Ok(vec![StatusCode::GOOD; monitored_item_ids.len()])
    }

    async fn get_monitored_items(&self, subscription_id: u32) -> Result<Vec<ServerMonitoredItem>> {
        Ok(self
            .server_items
            .lock()
            .unwrap()
            .get(&subscription_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Scripted stand-in for session establishment.
pub struct MockTransport {
    pub create_results: Mutex<VecDeque<Result<()>>>,
    pub activate_results: Mutex<VecDeque<Result<()>>>,
    pub recreate_results: Mutex<VecDeque<Result<()>>>,
    pub create_count: AtomicU32,
    pub activate_count: AtomicU32,
    pub recreate_count: AtomicU32,
    pub close_count: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            create_results: Mutex::new(VecDeque::new()),
            activate_results: Mutex::new(VecDeque::new()),
            recreate_results: Mutex::new(VecDeque::new()),
            create_count: AtomicU32::new(0),
            activate_count: AtomicU32::new(0),
            recreate_count: AtomicU32::new(0),
            close_count: AtomicU32::new(0),
        })
    }

    pub fn fail_next_create(&self, error: Error) {
        self.create_results.lock().unwrap().push_back(Err(error));
    }

    pub fn fail_next_activate(&self, error: Error) {
        self.activate_results.lock().unwrap().push_back(Err(error));
    }

    pub fn fail_next_recreate(&self, error: Error) {
        self.recreate_results.lock().unwrap().push_back(Err(error));
    }

    fn scripted(queue: &Mutex<VecDeque<Result<()>>>) -> Result<()> {
        queue.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl SessionTransport for MockTransport {
    async fn create_session(
        &self,
        options: &SessionOptions,
        _identity: &UserIdentity,
    ) -> Result<SessionHandle> {
        let attempt = self.create_count.fetch_add(1, Ordering::Relaxed) + 1;
        Self::scripted(&self.create_results)?;
        Ok(SessionHandle {
            session_id: format!("ns=1;i={attempt}"),
            authentication_token: Bytes::from_static(b"token"),
            revised_timeout_ms: options.session_timeout_ms,
        })
    }

    async fn activate_session(&self, _identity: &UserIdentity) -> Result<()> {
        self.activate_count.fetch_add(1, Ordering::Relaxed);
        Self::scripted(&self.activate_results)
    }

    async fn recreate_channel(&self) -> Result<()> {
        self.recreate_count.fetch_add(1, Ordering::Relaxed);
        Self::scripted(&self.recreate_results)
    }

    async fn close_session(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Records everything a subscription delivers.
#[derive(Default)]
pub struct RecordingHandler {
    pub dispatched: Mutex<Vec<(u32, u32, PublishState)>>,
    pub keep_alives: Mutex<Vec<(u32, u32)>>,
    pub state_changes: Mutex<Vec<(u32, PublishState)>>,
    pub subscription_changes: Mutex<Vec<(u32, SubscriptionChange)>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dispatched_sequence_numbers(&self) -> Vec<u32> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|(_, seq, _)| *seq)
            .collect()
    }

    pub fn dispatched_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    pub async fn wait_dispatched(&self, count: usize, timeout: Duration) -> bool {
        wait_until(|| self.dispatched_count() >= count, timeout).await
    }
}

#[async_trait]
impl NotificationHandler for RecordingHandler {
    async fn on_data_change(
        &self,
        ctx: &NotificationContext<'_>,
        _notification: DataChangeNotification,
    ) -> anyhow::Result<()> {
        self.dispatched.lock().unwrap().push((
            ctx.subscription_id,
            ctx.sequence_number,
            ctx.state,
        ));
        Ok(())
    }

    async fn on_keep_alive(&self, ctx: &NotificationContext<'_>) -> anyhow::Result<()> {
        self.keep_alives
            .lock()
            .unwrap()
            .push((ctx.subscription_id, ctx.sequence_number));
        Ok(())
    }

    fn on_publish_state_change(&self, subscription_id: u32, state: PublishState) {
        self.state_changes
            .lock()
            .unwrap()
            .push((subscription_id, state));
    }

    fn on_subscription_change(&self, subscription_id: u32, change: SubscriptionChange) {
        self.subscription_changes
            .lock()
            .unwrap()
            .push((subscription_id, change));
    }
}
