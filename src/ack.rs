//! Acknowledgement queue shared by all subscriptions of a session.
//!
//! Acknowledgements are piggybacked onto the next publish request. The
//! queue is ordered by sequence number so the oldest retransmission queue
//! entries are released first, with arrival order as the tie break.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::types::SubscriptionAcknowledgement;

/// How many completed subscription ids are remembered in order to reject
/// late acknowledgements for them.
const MAX_COMPLETED_IDS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedAck {
    ack: SubscriptionAcknowledgement,
    arrival: u64,
}

impl Ord for QueuedAck {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ack
            .sequence_number
            .cmp(&other.ack.sequence_number)
            .then(self.arrival.cmp(&other.arrival))
    }
}

impl PartialOrd for QueuedAck {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Reverse<QueuedAck>>,
    completed: VecDeque<u32>,
    arrival: u64,
}

#[derive(Debug, Default)]
pub struct AckQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl AckQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one acknowledgement. Returns `false` when the subscription
    /// was already completed and the acknowledgement is rejected.
    pub fn queue(&self, ack: SubscriptionAcknowledgement) -> bool {
        {
            let mut inner = self.lock();
            if inner.completed.contains(&ack.subscription_id) {
                return false;
            }
            inner.arrival += 1;
            let arrival = inner.arrival;
            inner.heap.push(Reverse(QueuedAck { ack, arrival }));
        }
        self.notify.notify_waiters();
        true
    }

    /// Return failed-publish acknowledgements to the queue so they are
    /// retried by the next request.
    pub fn requeue(&self, acks: Vec<SubscriptionAcknowledgement>) {
        let mut queued = false;
        {
            let mut inner = self.lock();
            for ack in acks {
                if inner.completed.contains(&ack.subscription_id) {
                    continue;
                }
                inner.arrival += 1;
                let arrival = inner.arrival;
                inner.heap.push(Reverse(QueuedAck { ack, arrival }));
                queued = true;
            }
        }
        if queued {
            self.notify.notify_waiters();
        }
    }

    /// Drop pending acknowledgements of a subscription and reject any
    /// that arrive later. Called exactly once when its processor stops.
    pub fn complete(&self, subscription_id: u32) {
        let mut inner = self.lock();
        let remaining: Vec<Reverse<QueuedAck>> = inner
            .heap
            .drain()
            .filter(|Reverse(q)| q.ack.subscription_id != subscription_id)
            .collect();
        inner.heap = remaining.into_iter().collect();
        if !inner.completed.contains(&subscription_id) {
            inner.completed.push_back(subscription_id);
            while inner.completed.len() > MAX_COMPLETED_IDS {
                inner.completed.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take up to `max` acknowledgements, smallest sequence numbers first.
    pub fn take_ready(&self, max: usize) -> Vec<SubscriptionAcknowledgement> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        while out.len() < max {
            match inner.heap.pop() {
                Some(Reverse(q)) => out.push(q.ack),
                None => break,
            }
        }
        out
    }

    /// Wait up to `wait` for at least one acknowledgement to be queued.
    pub async fn wait_ready(
        &self,
        max: usize,
        wait: Duration,
    ) -> Vec<SubscriptionAcknowledgement> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let ready = self.take_ready(max);
            if !ready.is_empty() {
                return ready;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.take_ready(max);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(subscription_id: u32, sequence_number: u32) -> SubscriptionAcknowledgement {
        SubscriptionAcknowledgement {
            subscription_id,
            sequence_number,
        }
    }

    #[test]
    fn orders_by_sequence_number() {
        let queue = AckQueue::new();
        assert!(queue.queue(ack(1, 5)));
        assert!(queue.queue(ack(2, 2)));
        assert!(queue.queue(ack(1, 9)));
        let ready = queue.take_ready(10);
        let seqs: Vec<u32> = ready.iter().map(|a| a.sequence_number).collect();
        assert_eq!(seqs, vec![2, 5, 9]);
    }

    #[test]
    fn equal_sequence_numbers_keep_arrival_order() {
        let queue = AckQueue::new();
        queue.queue(ack(3, 4));
        queue.queue(ack(1, 4));
        queue.queue(ack(2, 4));
        let ready = queue.take_ready(10);
        let subs: Vec<u32> = ready.iter().map(|a| a.subscription_id).collect();
        assert_eq!(subs, vec![3, 1, 2]);
    }

    #[test]
    fn complete_drops_pending_and_rejects_late() {
        let queue = AckQueue::new();
        queue.queue(ack(1, 1));
        queue.queue(ack(2, 2));
        queue.complete(1);
        assert!(!queue.queue(ack(1, 3)));
        let ready = queue.take_ready(10);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].subscription_id, 2);
    }

    #[test]
    fn take_ready_honors_max() {
        let queue = AckQueue::new();
        for seq in 1..=5 {
            queue.queue(ack(1, seq));
        }
        assert_eq!(queue.take_ready(2).len(), 2);
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn wait_ready_times_out_empty() {
        let queue = AckQueue::new();
        let ready = queue.wait_ready(4, Duration::from_millis(10)).await;
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn wait_ready_wakes_on_queue() {
        let queue = std::sync::Arc::new(AckQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_ready(4, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.queue(ack(1, 1));
        let ready = waiter.await.unwrap();
        assert_eq!(ready.len(), 1);
    }
}
