//! Data contracts shared across the publish pipeline.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OPC UA service result code.
///
/// Only the codes the pipeline routes on are named; everything else is
/// carried through as an opaque value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    pub const GOOD_SUBSCRIPTION_TRANSFERRED: StatusCode = StatusCode(0x002D_0000);

    pub const BAD_UNEXPECTED_ERROR: StatusCode = StatusCode(0x8001_0000);
    pub const BAD_INTERNAL_ERROR: StatusCode = StatusCode(0x8002_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_SERVICE_UNSUPPORTED: StatusCode = StatusCode(0x800B_0000);
    pub const BAD_NOTHING_TO_DO: StatusCode = StatusCode(0x800F_0000);
    pub const BAD_TOO_MANY_OPERATIONS: StatusCode = StatusCode(0x8010_0000);
    pub const BAD_SESSION_ID_INVALID: StatusCode = StatusCode(0x8025_0000);
    pub const BAD_SESSION_CLOSED: StatusCode = StatusCode(0x8026_0000);
    pub const BAD_SUBSCRIPTION_ID_INVALID: StatusCode = StatusCode(0x8028_0000);
    pub const BAD_MONITORED_ITEM_ID_INVALID: StatusCode = StatusCode(0x8042_0000);
    pub const BAD_TOO_MANY_PUBLISH_REQUESTS: StatusCode = StatusCode(0x806D_0000);
    pub const BAD_NO_SUBSCRIPTION: StatusCode = StatusCode(0x8079_0000);
    pub const BAD_SEQUENCE_NUMBER_UNKNOWN: StatusCode = StatusCode(0x807A_0000);
    pub const BAD_MESSAGE_NOT_AVAILABLE: StatusCode = StatusCode(0x8078_0000);
    pub const BAD_TCP_SERVER_TOO_BUSY: StatusCode = StatusCode(0x807D_0000);
    pub const BAD_SECURE_CHANNEL_CLOSED: StatusCode = StatusCode(0x8086_0000);
    pub const BAD_REQUEST_TIMEOUT: StatusCode = StatusCode(0x80AC_0000);
    pub const BAD_INVALID_STATE: StatusCode = StatusCode(0x80AF_0000);

    pub fn is_good(self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    pub fn is_bad(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::GOOD
    }
}

/// Opaque encoded payload body. The wire codec owns the concrete layout,
/// the pipeline only forwards it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedBody(pub Bytes);

/// A sampled value for one monitored item, identified by the client handle
/// the item was created with.
#[derive(Debug, Clone, Default)]
pub struct MonitoredItemValue {
    pub client_handle: u32,
    pub status: StatusCode,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Option<DateTime<Utc>>,
    pub body: EncodedBody,
}

#[derive(Debug, Clone, Default)]
pub struct DataChangeNotification {
    pub values: Vec<MonitoredItemValue>,
}

/// One event occurrence for an event monitored item.
#[derive(Debug, Clone, Default)]
pub struct EventFieldList {
    pub client_handle: u32,
    pub event_fields: Vec<EncodedBody>,
}

#[derive(Debug, Clone, Default)]
pub struct EventNotificationList {
    pub events: Vec<EventFieldList>,
}

#[derive(Debug, Clone, Copy)]
pub struct StatusChangeNotification {
    pub status: StatusCode,
}

/// Decoded notification payload variants. Unknown kinds are carried so the
/// processor can count and skip them.
#[derive(Debug, Clone)]
pub enum NotificationData {
    DataChange(DataChangeNotification),
    Events(EventNotificationList),
    StatusChange(StatusChangeNotification),
    Other(EncodedBody),
}

/// One notification message as delivered in a publish or republish
/// response. An empty `notifications` list is a keep-alive.
#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub sequence_number: u32,
    pub publish_time: DateTime<Utc>,
    pub notifications: Vec<NotificationData>,
}

impl NotificationMessage {
    pub fn keep_alive(sequence_number: u32, publish_time: DateTime<Utc>) -> Self {
        Self {
            sequence_number,
            publish_time,
            notifications: Vec::new(),
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        self.notifications.is_empty()
    }
}

/// Acknowledgement for one processed notification message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionAcknowledgement {
    pub subscription_id: u32,
    pub sequence_number: u32,
}

/// Flags describing how a notification reached the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishState(u16);

impl PublishState {
    pub const NONE: PublishState = PublishState(0);
    /// Publishing has stalled, no message within the keep-alive window.
    pub const STOPPED: PublishState = PublishState(1 << 0);
    /// Publishing resumed after a stall.
    pub const RECOVERED: PublishState = PublishState(1 << 1);
    /// The message was recovered through a republish call.
    pub const REPUBLISH: PublishState = PublishState(1 << 2);
    /// The subscription was transferred to this session.
    pub const TRANSFERRED: PublishState = PublishState(1 << 3);
    /// The subscription timed out on the server.
    pub const TIMEOUT: PublishState = PublishState(1 << 4);
    /// A keep-alive message.
    pub const KEEP_ALIVE: PublishState = PublishState(1 << 5);

    pub fn contains(self, other: PublishState) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PublishState {
    type Output = PublishState;
    fn bitor(self, rhs: PublishState) -> PublishState {
        PublishState(self.0 | rhs.0)
    }
}

impl BitOrAssign for PublishState {
    fn bitor_assign(&mut self, rhs: PublishState) {
        self.0 |= rhs.0;
    }
}

/// Flags describing a change to subscription state, delivered to the
/// change callback after the corresponding operation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionChange(u16);

impl SubscriptionChange {
    pub const NONE: SubscriptionChange = SubscriptionChange(0);
    pub const CREATED: SubscriptionChange = SubscriptionChange(1 << 0);
    pub const DELETED: SubscriptionChange = SubscriptionChange(1 << 1);
    pub const MODIFIED: SubscriptionChange = SubscriptionChange(1 << 2);
    pub const TRANSFERRED: SubscriptionChange = SubscriptionChange(1 << 3);
    pub const ITEMS_CREATED: SubscriptionChange = SubscriptionChange(1 << 4);
    pub const ITEMS_MODIFIED: SubscriptionChange = SubscriptionChange(1 << 5);
    pub const ITEMS_DELETED: SubscriptionChange = SubscriptionChange(1 << 6);

    pub fn contains(self, other: SubscriptionChange) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SubscriptionChange {
    type Output = SubscriptionChange;
    fn bitor(self, rhs: SubscriptionChange) -> SubscriptionChange {
        SubscriptionChange(self.0 | rhs.0)
    }
}

impl BitOrAssign for SubscriptionChange {
    fn bitor_assign(&mut self, rhs: SubscriptionChange) {
        self.0 |= rhs.0;
    }
}

/// Monitoring mode of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MonitoringMode {
    Disabled,
    Sampling,
    Reporting,
}

impl Default for MonitoringMode {
    fn default() -> Self {
        MonitoringMode::Reporting
    }
}

/// Desired subscription parameters. The server may revise the interval and
/// counts on create/modify.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionOptions {
    /// Requested publishing interval in milliseconds.
    pub publishing_interval_ms: u64,
    /// Keep-alive count, 0 selects the default of 10 cycles.
    pub keep_alive_count: u32,
    /// Lifetime count, raised to at least three times the keep-alive count.
    pub lifetime_count: u32,
    /// Smallest lifetime the subscription must survive, used to derive the
    /// lifetime count when none is given.
    pub min_lifetime_interval_ms: u64,
    /// 0 means no server-side limit per publish response.
    pub max_notifications_per_publish: u32,
    pub publishing_enabled: bool,
    pub priority: u8,
    /// Recover the transferred retransmission queue by republish instead
    /// of acknowledging it away.
    pub republish_after_transfer: bool,
    /// Dispatch the payloads of one message concurrently instead of in
    /// payload order.
    pub concurrent_dispatch: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            publishing_interval_ms: 1000,
            keep_alive_count: 0,
            lifetime_count: 0,
            min_lifetime_interval_ms: 10_000,
            max_notifications_per_publish: 0,
            publishing_enabled: true,
            priority: 0,
            republish_after_transfer: false,
            concurrent_dispatch: false,
        }
    }
}

impl SubscriptionOptions {
    pub fn publishing_interval(&self) -> Duration {
        Duration::from_millis(self.publishing_interval_ms)
    }
}

/// Desired monitored item parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredItemOptions {
    /// Node to monitor, in the notation the service layer understands.
    pub node_id: String,
    #[serde(default = "MonitoredItemOptions::default_attribute_id")]
    pub attribute_id: u32,
    #[serde(default = "MonitoredItemOptions::default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,
    #[serde(default = "MonitoredItemOptions::default_queue_size")]
    pub queue_size: u32,
    #[serde(default = "MonitoredItemOptions::default_discard_oldest")]
    pub discard_oldest: bool,
    #[serde(default)]
    pub monitoring_mode: MonitoringMode,
    #[serde(skip)]
    pub filter: Option<EncodedBody>,
}

impl MonitoredItemOptions {
    pub fn value(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            attribute_id: Self::default_attribute_id(),
            sampling_interval_ms: Self::default_sampling_interval_ms(),
            queue_size: Self::default_queue_size(),
            discard_oldest: Self::default_discard_oldest(),
            monitoring_mode: MonitoringMode::default(),
            filter: None,
        }
    }

    fn default_attribute_id() -> u32 {
        // Value attribute
        13
    }

    fn default_sampling_interval_ms() -> u64 {
        1000
    }

    fn default_queue_size() -> u32 {
        1
    }

    fn default_discard_oldest() -> bool {
        true
    }
}

/// Session level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    #[serde(default = "SessionOptions::default_session_name")]
    pub session_name: String,
    /// Requested session timeout in milliseconds, revised by the server.
    #[serde(default = "SessionOptions::default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Keep-alive probe interval for the session monitor.
    #[serde(default = "SessionOptions::default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    #[serde(default = "SessionOptions::default_min_publish_workers")]
    pub min_publish_worker_count: usize,
    #[serde(default = "SessionOptions::default_max_publish_workers")]
    pub max_publish_worker_count: usize,
    /// Transfer created subscriptions to the recreated session instead of
    /// rebuilding them from scratch.
    #[serde(default)]
    pub transfer_subscriptions_on_recreate: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            session_name: Self::default_session_name(),
            session_timeout_ms: Self::default_session_timeout_ms(),
            keep_alive_interval_ms: Self::default_keep_alive_interval_ms(),
            min_publish_worker_count: Self::default_min_publish_workers(),
            max_publish_worker_count: Self::default_max_publish_workers(),
            transfer_subscriptions_on_recreate: false,
        }
    }
}

impl SessionOptions {
    fn default_session_name() -> String {
        "ua-client".to_string()
    }

    fn default_session_timeout_ms() -> u64 {
        30_000
    }

    fn default_keep_alive_interval_ms() -> u64 {
        10_000
    }

    fn default_min_publish_workers() -> usize {
        2
    }

    fn default_max_publish_workers() -> usize {
        15
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_severity() {
        assert!(StatusCode::GOOD.is_good());
        assert!(StatusCode::GOOD_SUBSCRIPTION_TRANSFERRED.is_good());
        assert!(StatusCode::BAD_TIMEOUT.is_bad());
        assert!(!StatusCode::BAD_NO_SUBSCRIPTION.is_good());
    }

    #[test]
    fn publish_state_flags_combine() {
        let mut state = PublishState::REPUBLISH;
        state |= PublishState::TRANSFERRED;
        assert!(state.contains(PublishState::REPUBLISH));
        assert!(state.contains(PublishState::TRANSFERRED));
        assert!(!state.contains(PublishState::STOPPED));
    }

    #[test]
    fn subscription_options_deserialize_with_defaults() {
        let options: SubscriptionOptions =
            serde_json::from_str(r#"{"publishingIntervalMs": 250}"#).unwrap();
        assert_eq!(options.publishing_interval_ms, 250);
        assert_eq!(options.min_lifetime_interval_ms, 10_000);
        assert!(options.publishing_enabled);
    }

    #[test]
    fn keep_alive_message_has_no_payload() {
        let msg = NotificationMessage::keep_alive(7, Utc::now());
        assert!(msg.is_keep_alive());
        assert_eq!(msg.sequence_number, 7);
    }
}
