//! OPC UA client session and subscription publish pipeline.
//!
//! The crate keeps a long-lived session alive, maintains subscriptions
//! and their monitored items, and turns the out-of-order publish service
//! into an ordered, gap-free, at-most-once notification stream:
//!
//! - a [`Session`](session::Session) drives connectivity through an
//!   explicit state machine and supervises keep-alives,
//! - a [`SubscriptionManager`](manager::SubscriptionManager) runs an
//!   elastic pool of publish workers and routes responses by
//!   subscription id,
//! - each [`Subscription`](subscription::Subscription) orders its
//!   notifications by sequence number, recovers gaps through republish
//!   and acknowledges every dispatched message exactly once.
//!
//! The wire protocol itself is not part of this crate; it is consumed
//! through the [`service`] traits.

pub mod ack;
pub mod error;
pub mod manager;
pub mod service;
pub mod session;
pub mod subscription;
pub mod types;

pub use error::{Error, Result};
pub use manager::{ManagerDiagnostics, SubscriptionManager};
pub use service::{
    PublishResponse, SessionHandle, SessionTransport, SubscriptionServices, UserIdentity,
};
pub use session::state::{ConnectivityState, ConnectivityTrigger};
pub use session::{Session, SessionDiagnostics};
pub use subscription::{
    MonitoredItem, NotificationContext, NotificationHandler, Subscription,
    SubscriptionDiagnostics,
};
pub use types::{
    MonitoredItemOptions, MonitoringMode, NotificationData, NotificationMessage, PublishState,
    SessionOptions, StatusCode, SubscriptionAcknowledgement, SubscriptionChange,
    SubscriptionOptions,
};
