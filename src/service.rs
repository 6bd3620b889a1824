//! Seams to the wire layer.
//!
//! The pipeline never talks to a socket directly. Everything it needs from
//! the server goes through [`SubscriptionServices`] and [`SessionTransport`],
//! which a transport crate (or a test double) implements.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::{
    EncodedBody, MonitoredItemOptions, MonitoringMode, NotificationMessage, SessionOptions,
    StatusCode, SubscriptionAcknowledgement,
};

/// Identity presented when creating or reactivating a session.
#[derive(Debug, Clone)]
pub enum UserIdentity {
    Anonymous,
    UserName { user: String, password: String },
    IssuedToken(Bytes),
}

impl Default for UserIdentity {
    fn default() -> Self {
        UserIdentity::Anonymous
    }
}

/// Server-assigned session state returned by a successful create.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub authentication_token: Bytes,
    /// Revised session timeout in milliseconds.
    pub revised_timeout_ms: u64,
}

/// Response to a publish request.
#[derive(Debug, Clone)]
pub struct PublishResponse {
    pub subscription_id: u32,
    /// Sequence numbers currently held in the server's retransmission
    /// queue for this subscription.
    pub available_sequence_numbers: Vec<u32>,
    pub more_notifications: bool,
    pub notification_message: NotificationMessage,
    /// Per-acknowledgement results, index-aligned with the request.
    pub results: Vec<StatusCode>,
    pub string_table: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub publishing_interval: Duration,
    pub lifetime_count: u32,
    pub keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub publishing_enabled: bool,
    pub priority: u8,
}

#[derive(Debug, Clone)]
pub struct SubscriptionCreateResult {
    pub subscription_id: u32,
    pub revised_publishing_interval: Duration,
    pub revised_lifetime_count: u32,
    pub revised_keep_alive_count: u32,
}

#[derive(Debug, Clone)]
pub struct ModifySubscriptionRequest {
    pub subscription_id: u32,
    pub publishing_interval: Duration,
    pub lifetime_count: u32,
    pub keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
}

#[derive(Debug, Clone)]
pub struct SubscriptionModifyResult {
    pub revised_publishing_interval: Duration,
    pub revised_lifetime_count: u32,
    pub revised_keep_alive_count: u32,
}

/// Per-subscription result of a transfer call.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub status: StatusCode,
    pub available_sequence_numbers: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct MonitoredItemCreateRequest {
    pub options: MonitoredItemOptions,
    pub client_handle: u32,
}

#[derive(Debug, Clone)]
pub struct MonitoredItemModifyRequest {
    pub monitored_item_id: u32,
    pub client_handle: u32,
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
    pub filter: Option<EncodedBody>,
}

/// Per-item result of a create or modify call.
#[derive(Debug, Clone)]
pub struct MonitoredItemResult {
    pub status: StatusCode,
    pub monitored_item_id: u32,
    pub revised_sampling_interval: Duration,
    pub revised_queue_size: u32,
}

/// Server-side view of one monitored item, as reported by the
/// GetMonitoredItems call.
#[derive(Debug, Clone, Copy)]
pub struct ServerMonitoredItem {
    pub server_id: u32,
    pub client_handle: u32,
}

/// Subscription-related services of the server.
#[async_trait]
pub trait SubscriptionServices: Send + Sync + 'static {
    async fn publish(
        &self,
        timeout_hint: Duration,
        acknowledgements: Vec<SubscriptionAcknowledgement>,
    ) -> Result<PublishResponse>;

    /// Retrieve one message from a subscription's retransmission queue.
    async fn republish(
        &self,
        subscription_id: u32,
        retransmit_sequence_number: u32,
    ) -> Result<NotificationMessage>;

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<SubscriptionCreateResult>;

    async fn modify_subscription(
        &self,
        request: ModifySubscriptionRequest,
    ) -> Result<SubscriptionModifyResult>;

    async fn set_publishing_mode(
        &self,
        publishing_enabled: bool,
        subscription_ids: &[u32],
    ) -> Result<Vec<StatusCode>>;

    async fn transfer_subscriptions(
        &self,
        subscription_ids: &[u32],
        send_initial_values: bool,
    ) -> Result<Vec<TransferResult>>;

    async fn delete_subscriptions(&self, subscription_ids: &[u32]) -> Result<Vec<StatusCode>>;

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        requests: Vec<MonitoredItemCreateRequest>,
    ) -> Result<Vec<MonitoredItemResult>>;

    async fn modify_monitored_items(
        &self,
        subscription_id: u32,
        requests: Vec<MonitoredItemModifyRequest>,
    ) -> Result<Vec<MonitoredItemResult>>;

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        monitored_item_ids: &[u32],
    ) -> Result<Vec<StatusCode>>;

    async fn set_monitoring_mode(
        &self,
        subscription_id: u32,
        mode: MonitoringMode,
        monitored_item_ids: &[u32],
    ) -> Result<Vec<StatusCode>>;

    /// Server view of the subscription's items, used to resynchronize
    /// handles after a transfer.
    async fn get_monitored_items(&self, subscription_id: u32) -> Result<Vec<ServerMonitoredItem>>;
}

/// Session establishment services of the server.
#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    async fn create_session(
        &self,
        options: &SessionOptions,
        identity: &UserIdentity,
    ) -> Result<SessionHandle>;

    /// Activate the current session, possibly with a new identity.
    async fn activate_session(&self, identity: &UserIdentity) -> Result<()>;

    /// Re-establish the secure channel after a connection loss, keeping
    /// the session alive on the server.
    async fn recreate_channel(&self) -> Result<()>;

    async fn close_session(&self) -> Result<()>;
}
