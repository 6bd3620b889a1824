//! Ordered notification delivery for one subscription.
//!
//! Publish workers push received messages into an unbounded channel, so
//! the receive path never blocks. A single consumer task pulls them into
//! a min-heap keyed by sequence number (arrival order breaks ties) and
//! dispatches in strictly increasing order. Gaps are recovered through
//! republish calls when the missing number is still held in the server's
//! retransmission queue; anything else is a permanent, logged loss.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ack::AckQueue;
use crate::service::SubscriptionServices;
use crate::types::{
    NotificationData, NotificationMessage, PublishState, StatusCode, SubscriptionAcknowledgement,
};

use super::{NotificationContext, NotificationHandler, SubscriptionCore};

/// Input to the processor task.
pub(crate) enum Ingest {
    Message {
        message: NotificationMessage,
        /// Retransmission queue advertised by the publish response, if the
        /// message came from one.
        available: Option<Vec<u32>>,
        string_table: Vec<String>,
    },
    /// Reset the sequence cursor after a transfer or recreate. Pending
    /// queued messages belong to the previous incarnation and are dropped.
    ResetCursor {
        available: Vec<u32>,
        republish: bool,
        transferred: bool,
    },
}

struct OrderedMessage {
    sequence: u32,
    arrival: u64,
    message: NotificationMessage,
    string_table: Vec<String>,
}

impl PartialEq for OrderedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence && self.arrival == other.arrival
    }
}

impl Eq for OrderedMessage {}

impl Ord for OrderedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.arrival.cmp(&other.arrival))
    }
}

impl PartialOrd for OrderedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Successor in the sequence number space; 0 is never used, the space
/// wraps from `u32::MAX` to 1.
pub(crate) fn next_sequence(sequence: u32) -> u32 {
    if sequence == u32::MAX {
        1
    } else {
        sequence + 1
    }
}

/// Whether `cur` comes after `prev` in wrapped sequence order. `prev == 0`
/// means no message was dispatched yet and everything is new.
pub(crate) fn newer_than(cur: u32, prev: u32) -> bool {
    if prev == 0 {
        cur != 0
    } else {
        let diff = cur.wrapping_sub(prev);
        diff != 0 && diff < u32::MAX / 2
    }
}

/// Whether `seq` lies in the half-open wrapped window `[start, end)`.
fn in_window(start: u32, end: u32, seq: u32) -> bool {
    if seq == 0 {
        return false;
    }
    if start <= end {
        seq >= start && seq < end
    } else {
        seq >= start || seq < end
    }
}

enum TransferRecovery {
    /// Recover the transferred retransmission queue through republish.
    Republish(Vec<u32>),
    /// Flush the transferred retransmission queue by acknowledging it.
    Acknowledge(Vec<u32>),
}

pub(crate) struct Processor {
    core: Arc<SubscriptionCore>,
    services: Arc<dyn SubscriptionServices>,
    acks: Arc<AckQueue>,
    handler: Arc<dyn NotificationHandler>,
    rx: mpsc::UnboundedReceiver<Ingest>,
    cancel: CancellationToken,
    heap: BinaryHeap<Reverse<OrderedMessage>>,
    arrival: u64,
    /// Last dispatched sequence number, 0 before the first dispatch and
    /// after a cursor reset.
    last_dispatched: u32,
    /// Sequence numbers the server last advertised as retransmittable.
    available: Vec<u32>,
    /// Skip gap recovery for the next real message after a cursor reset.
    resync: bool,
    pending_flags: PublishState,
    transfer_recovery: Option<TransferRecovery>,
}

impl Processor {
    pub(crate) fn new(
        core: Arc<SubscriptionCore>,
        services: Arc<dyn SubscriptionServices>,
        acks: Arc<AckQueue>,
        handler: Arc<dyn NotificationHandler>,
        rx: mpsc::UnboundedReceiver<Ingest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            core,
            services,
            acks,
            handler,
            rx,
            cancel,
            heap: BinaryHeap::new(),
            arrival: 0,
            last_dispatched: 0,
            available: Vec::new(),
            resync: false,
            pending_flags: PublishState::NONE,
            transfer_recovery: None,
        }
    }

    pub(crate) async fn run(mut self) {
        // delete() zeroes the shared id before this task observes the
        // cancellation; completion must use the id the acks were queued
        // under, so track the last nonzero one
        let mut subscription_id = self.core.id();
        debug!(subscription_id, "message processor started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                ingest = self.rx.recv() => {
                    let Some(ingest) = ingest else { break };
                    self.accept(ingest);
                    while let Ok(more) = self.rx.try_recv() {
                        self.accept(more);
                    }
                    self.drain().await;
                    let id = self.core.id();
                    if id != 0 {
                        subscription_id = id;
                    }
                }
            }
        }
        let id = self.core.id();
        if id != 0 {
            subscription_id = id;
        }
        // drop pending acks and reject late ones, exactly once per stop
        self.acks.complete(subscription_id);
        debug!(subscription_id, "message processor stopped");
    }

    fn accept(&mut self, ingest: Ingest) {
        match ingest {
            Ingest::Message {
                message,
                available,
                string_table,
            } => {
                if let Some(available) = available {
                    self.available = available;
                }
                self.arrival += 1;
                self.heap.push(Reverse(OrderedMessage {
                    sequence: message.sequence_number,
                    arrival: self.arrival,
                    message,
                    string_table,
                }));
            }
            Ingest::ResetCursor {
                available,
                republish,
                transferred,
            } => {
                self.heap.clear();
                self.last_dispatched = 0;
                self.resync = true;
                if transferred {
                    self.pending_flags |= PublishState::TRANSFERRED;
                }
                let mut seqs = available.clone();
                seqs.sort_unstable();
                self.available = available;
                self.transfer_recovery = if seqs.is_empty() {
                    None
                } else if republish {
                    Some(TransferRecovery::Republish(seqs))
                } else {
                    Some(TransferRecovery::Acknowledge(seqs))
                };
            }
        }
    }

    async fn drain(&mut self) {
        if let Some(recovery) = self.transfer_recovery.take() {
            self.recover_transfer(recovery).await;
        }
        while let Some(Reverse(ordered)) = self.heap.pop() {
            self.process(ordered).await;
        }
    }

    async fn recover_transfer(&mut self, recovery: TransferRecovery) {
        let subscription_id = self.core.id();
        match recovery {
            TransferRecovery::Republish(seqs) => {
                for sequence in seqs {
                    match self.services.republish(subscription_id, sequence).await {
                        Ok(message) => {
                            info!(
                                subscription_id,
                                sequence, "republished transferred notification"
                            );
                            self.last_dispatched = sequence;
                            self.resync = false;
                            let flags = std::mem::take(&mut self.pending_flags)
                                | PublishState::TRANSFERRED
                                | PublishState::REPUBLISH;
                            self.dispatch(message, &[], flags).await;
                            self.enqueue_ack(sequence);
                        }
                        Err(e) => {
                            warn!(
                                subscription_id,
                                sequence,
                                error = %e,
                                "republish of transferred notification failed, message lost"
                            );
                        }
                    }
                }
            }
            TransferRecovery::Acknowledge(seqs) => {
                debug!(
                    subscription_id,
                    count = seqs.len(),
                    "acknowledging transferred retransmission queue"
                );
                for sequence in seqs {
                    self.acks.queue(SubscriptionAcknowledgement {
                        subscription_id,
                        sequence_number: sequence,
                    });
                }
            }
        }
    }

    async fn process(&mut self, ordered: OrderedMessage) {
        let cur = ordered.sequence;
        let prev = self.last_dispatched;
        if !newer_than(cur, prev) {
            debug!(
                subscription_id = self.core.id(),
                sequence = cur,
                last_dispatched = prev,
                "dropping duplicate or stale notification"
            );
            return;
        }

        let keep_alive = ordered.message.is_keep_alive();
        if self.resync {
            // first traffic after a cursor reset establishes the new base
            if !keep_alive {
                self.resync = false;
            }
        } else {
            self.recover_gap(cur).await;
        }

        let mut flags = std::mem::take(&mut self.pending_flags);
        if keep_alive {
            // a keep-alive carries the next unsent sequence number, so it
            // neither advances the cursor nor gets acknowledged
            flags |= PublishState::KEEP_ALIVE;
            self.dispatch(ordered.message, &ordered.string_table, flags).await;
            return;
        }

        self.last_dispatched = cur;
        self.dispatch(ordered.message, &ordered.string_table, flags).await;
        self.enqueue_ack(cur);
    }

    /// Recover the window between the cursor and `cur`, republishing what
    /// the server still holds and logging the rest as lost.
    async fn recover_gap(&mut self, cur: u32) {
        let prev = self.last_dispatched;
        let start = if prev == 0 { 1 } else { next_sequence(prev) };
        if start == cur {
            return;
        }
        let subscription_id = self.core.id();
        let mut candidates: Vec<u32> = self
            .available
            .iter()
            .copied()
            .filter(|&s| in_window(start, cur, s))
            .collect();
        // wrapped sequence order, not numeric order: a window crossing
        // u32::MAX must republish the pre-wrap numbers first
        candidates.sort_unstable_by_key(|&s| s.wrapping_sub(start));

        let mut gap = cur.wrapping_sub(start) as usize;
        if start > cur {
            // the window crosses 0, which is never a valid sequence number
            gap -= 1;
        }
        let lost = gap.saturating_sub(candidates.len());
        if lost > 0 {
            warn!(
                subscription_id,
                from = start,
                to = cur,
                lost,
                "messages missing from the retransmission queue, permanent loss"
            );
        }

        for sequence in candidates {
            match self.services.republish(subscription_id, sequence).await {
                Ok(message) => {
                    info!(subscription_id, sequence, "recovered message via republish");
                    self.last_dispatched = sequence;
                    let flags =
                        std::mem::take(&mut self.pending_flags) | PublishState::REPUBLISH;
                    self.dispatch(message, &[], flags).await;
                    self.enqueue_ack(sequence);
                }
                Err(e) => {
                    warn!(
                        subscription_id,
                        sequence,
                        error = %e,
                        "republish failed, message lost"
                    );
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        message: NotificationMessage,
        string_table: &[String],
        mut flags: PublishState,
    ) {
        let subscription_id = self.core.id();
        for notification in &message.notifications {
            if let NotificationData::StatusChange(status_change) = notification {
                if status_change.status == StatusCode::GOOD_SUBSCRIPTION_TRANSFERRED {
                    flags |= PublishState::TRANSFERRED;
                } else if status_change.status == StatusCode::BAD_TIMEOUT {
                    flags |= PublishState::TIMEOUT;
                }
                info!(
                    subscription_id,
                    status = %status_change.status,
                    "subscription status change"
                );
            }
        }
        if flags.contains(PublishState::TRANSFERRED) || flags.contains(PublishState::TIMEOUT) {
            self.handler.on_publish_state_change(subscription_id, flags);
        }

        let ctx = NotificationContext {
            subscription_id,
            sequence_number: message.sequence_number,
            publish_time: message.publish_time,
            state: flags,
            string_table,
        };

        if message.is_keep_alive() {
            if let Err(e) = self.handler.on_keep_alive(&ctx).await {
                error!(subscription_id, error = %e, "keep-alive handler failed");
            }
            return;
        }

        self.core.count_notification();
        if self.core.concurrent_dispatch() {
            let results = join_all(
                message
                    .notifications
                    .into_iter()
                    .map(|n| deliver(self.handler.as_ref(), &ctx, n)),
            )
            .await;
            for result in results {
                if let Err(e) = result {
                    error!(subscription_id, error = %e, "notification handler failed");
                }
            }
        } else {
            for notification in message.notifications {
                if let Err(e) = deliver(self.handler.as_ref(), &ctx, notification).await {
                    error!(subscription_id, error = %e, "notification handler failed");
                }
            }
        }
    }

    fn enqueue_ack(&self, sequence_number: u32) {
        let subscription_id = self.core.id();
        let accepted = self.acks.queue(SubscriptionAcknowledgement {
            subscription_id,
            sequence_number,
        });
        if !accepted {
            warn!(
                subscription_id,
                sequence_number, "acknowledgement rejected, queue already completed"
            );
        }
    }
}

async fn deliver(
    handler: &dyn NotificationHandler,
    ctx: &NotificationContext<'_>,
    notification: NotificationData,
) -> anyhow::Result<()> {
    match notification {
        NotificationData::DataChange(data_change) => handler.on_data_change(ctx, data_change).await,
        NotificationData::Events(events) => handler.on_event(ctx, events).await,
        // folded into the publish state flags before dispatch
        NotificationData::StatusChange(_) => Ok(()),
        NotificationData::Other(_) => {
            debug!(
                subscription_id = ctx.subscription_id,
                "ignoring unknown notification payload"
            );
            Ok(())
        }
    }
}
