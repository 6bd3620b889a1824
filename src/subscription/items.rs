//! Monitored item bookkeeping for one subscription.
//!
//! Items are keyed by their client handle, allocated from a process-wide
//! monotonic counter so a handle is never reused across subscriptions or
//! recreated sessions. Server-side changes are applied in batches with
//! per-index result handling, one bad item never fails its siblings.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::service::{
    MonitoredItemCreateRequest, MonitoredItemModifyRequest, SubscriptionServices,
};
use crate::types::{MonitoredItemOptions, StatusCode, SubscriptionChange};

const MAX_ITEMS_PER_BATCH: usize = 256;

static NEXT_CLIENT_HANDLE: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_client_handle() -> u32 {
    NEXT_CLIENT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// Raise the allocator so it never hands out a handle at or below
/// `last_used`. Applied from handles observed on a transferred
/// subscription, which may come from another client instance.
pub(crate) fn raise_client_handle_floor(last_used: u32) {
    NEXT_CLIENT_HANDLE.fetch_max(last_used.saturating_add(1), Ordering::Relaxed);
}

/// One monitored item as tracked by the client.
#[derive(Debug, Clone)]
pub struct MonitoredItem {
    pub client_handle: u32,
    /// Server-assigned id, 0 until created.
    pub server_id: u32,
    pub options: MonitoredItemOptions,
    pub revised_sampling_interval: Duration,
    pub revised_queue_size: u32,
    pub created: bool,
    /// Last bad result for this item; cleared on success, retried on the
    /// next apply.
    pub last_error: Option<StatusCode>,
    pub(crate) attributes_modified: bool,
}

impl MonitoredItem {
    fn new(options: MonitoredItemOptions) -> Self {
        let sampling = Duration::from_millis(options.sampling_interval_ms);
        let queue_size = options.queue_size;
        Self {
            client_handle: next_client_handle(),
            server_id: 0,
            options,
            revised_sampling_interval: sampling,
            revised_queue_size: queue_size,
            created: false,
            last_error: None,
            attributes_modified: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MonitoredItemSet {
    items: Mutex<BTreeMap<u32, MonitoredItem>>,
    /// Server ids of removed items that still need a delete call.
    deleted: Mutex<Vec<u32>>,
}

impl MonitoredItemSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new item locally. It is created on the server by the
    /// next [`apply_changes`](Self::apply_changes).
    pub fn add(&self, options: MonitoredItemOptions) -> u32 {
        let item = MonitoredItem::new(options);
        let handle = item.client_handle;
        self.items_lock().insert(handle, item);
        handle
    }

    /// Remove an item locally, scheduling the server-side delete.
    pub fn remove(&self, client_handle: u32) -> bool {
        let removed = self.items_lock().remove(&client_handle);
        match removed {
            Some(item) => {
                if item.created {
                    self.deleted_lock().push(item.server_id);
                }
                true
            }
            None => false,
        }
    }

    /// Update the desired attributes of an item. Changes are coalesced
    /// until the next apply.
    pub fn modify<F>(&self, client_handle: u32, f: F) -> bool
    where
        F: FnOnce(&mut MonitoredItemOptions),
    {
        let mut items = self.items_lock();
        match items.get_mut(&client_handle) {
            Some(item) => {
                f(&mut item.options);
                if item.created {
                    item.attributes_modified = true;
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, client_handle: u32) -> Option<MonitoredItem> {
        self.items_lock().get(&client_handle).cloned()
    }

    pub fn snapshot(&self) -> Vec<MonitoredItem> {
        self.items_lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items_lock().len()
    }

    pub fn server_ids(&self, client_handles: &[u32]) -> Vec<u32> {
        let items = self.items_lock();
        client_handles
            .iter()
            .filter_map(|h| items.get(h))
            .filter(|i| i.created)
            .map(|i| i.server_id)
            .collect()
    }

    /// Forget all server state so every item is recreated from scratch.
    pub fn reset_for_recreate(&self) {
        self.deleted_lock().clear();
        for item in self.items_lock().values_mut() {
            item.created = false;
            item.server_id = 0;
            item.attributes_modified = false;
            item.last_error = None;
        }
    }

    /// Push pending deletes, modifies and creates to the server, in that
    /// order, and apply the per-index results. Returns the change mask of
    /// what actually happened.
    pub async fn apply_changes(
        &self,
        services: &dyn SubscriptionServices,
        subscription_id: u32,
    ) -> Result<SubscriptionChange> {
        let mut change = SubscriptionChange::NONE;

        let pending_delete: Vec<u32> = std::mem::take(&mut *self.deleted_lock());
        for chunk in pending_delete.chunks(MAX_ITEMS_PER_BATCH) {
            let results = services
                .delete_monitored_items(subscription_id, chunk)
                .await?;
            if results.len() != chunk.len() {
                return Err(Error::ResultCountMismatch {
                    expected: chunk.len(),
                    actual: results.len(),
                });
            }
            for (server_id, status) in chunk.iter().zip(results) {
                if status.is_bad()
                    && status != StatusCode::BAD_MONITORED_ITEM_ID_INVALID
                    && status != StatusCode::BAD_SUBSCRIPTION_ID_INVALID
                {
                    warn!(subscription_id, server_id, %status, "monitored item delete failed");
                    self.deleted_lock().push(*server_id);
                } else {
                    change |= SubscriptionChange::ITEMS_DELETED;
                }
            }
        }

        let modify_requests: Vec<MonitoredItemModifyRequest> = {
            let items = self.items_lock();
            items
                .values()
                .filter(|i| i.created && i.attributes_modified)
                .map(|i| MonitoredItemModifyRequest {
                    monitored_item_id: i.server_id,
                    client_handle: i.client_handle,
                    sampling_interval: Duration::from_millis(i.options.sampling_interval_ms),
                    queue_size: i.options.queue_size,
                    discard_oldest: i.options.discard_oldest,
                    filter: i.options.filter.clone(),
                })
                .collect()
        };
        for chunk in modify_requests.chunks(MAX_ITEMS_PER_BATCH) {
            let results = services
                .modify_monitored_items(subscription_id, chunk.to_vec())
                .await?;
            if results.len() != chunk.len() {
                return Err(Error::ResultCountMismatch {
                    expected: chunk.len(),
                    actual: results.len(),
                });
            }
            let mut items = self.items_lock();
            for (request, result) in chunk.iter().zip(results) {
                let Some(item) = items.get_mut(&request.client_handle) else {
                    continue;
                };
                if result.status.is_bad() {
                    warn!(
                        subscription_id,
                        client_handle = request.client_handle,
                        status = %result.status,
                        "monitored item modify failed"
                    );
                    item.last_error = Some(result.status);
                } else {
                    item.revised_sampling_interval = result.revised_sampling_interval;
                    item.revised_queue_size = result.revised_queue_size;
                    item.attributes_modified = false;
                    item.last_error = None;
                    change |= SubscriptionChange::ITEMS_MODIFIED;
                }
            }
        }

        let create_requests: Vec<MonitoredItemCreateRequest> = {
            let items = self.items_lock();
            items
                .values()
                .filter(|i| !i.created)
                .map(|i| MonitoredItemCreateRequest {
                    options: i.options.clone(),
                    client_handle: i.client_handle,
                })
                .collect()
        };
        for chunk in create_requests.chunks(MAX_ITEMS_PER_BATCH) {
            let results = services
                .create_monitored_items(subscription_id, chunk.to_vec())
                .await?;
            if results.len() != chunk.len() {
                return Err(Error::ResultCountMismatch {
                    expected: chunk.len(),
                    actual: results.len(),
                });
            }
            let mut items = self.items_lock();
            for (request, result) in chunk.iter().zip(results) {
                let Some(item) = items.get_mut(&request.client_handle) else {
                    continue;
                };
                if result.status.is_bad() {
                    warn!(
                        subscription_id,
                        client_handle = request.client_handle,
                        status = %result.status,
                        "monitored item create failed"
                    );
                    item.last_error = Some(result.status);
                } else {
                    item.server_id = result.monitored_item_id;
                    item.revised_sampling_interval = result.revised_sampling_interval;
                    item.revised_queue_size = result.revised_queue_size;
                    item.created = true;
                    item.last_error = None;
                    change |= SubscriptionChange::ITEMS_CREATED;
                }
            }
        }

        Ok(change)
    }

    /// Reconcile local items with the server's view after a transfer.
    /// Returns `false` when the server could not report its items, in
    /// which case the caller should fall back to recreating them.
    pub async fn sync_server_handles(
        &self,
        services: &dyn SubscriptionServices,
        subscription_id: u32,
    ) -> Result<bool> {
        let server_items = match services.get_monitored_items(subscription_id).await {
            Ok(items) => items,
            Err(e) => {
                warn!(subscription_id, error = %e, "get monitored items failed, recreating items");
                self.reset_for_recreate();
                return Ok(false);
            }
        };

        let mut highest_handle = 0u32;
        let mut orphaned: Vec<u32> = Vec::new();
        {
            let mut items = self.items_lock();
            let by_client: BTreeMap<u32, u32> = server_items
                .iter()
                .map(|s| (s.client_handle, s.server_id))
                .collect();
            for item in items.values_mut() {
                match by_client.get(&item.client_handle) {
                    Some(&server_id) => {
                        item.server_id = server_id;
                        item.created = true;
                        item.last_error = None;
                    }
                    None => {
                        debug!(
                            subscription_id,
                            client_handle = item.client_handle,
                            "item missing on server after transfer"
                        );
                        item.server_id = 0;
                        item.created = false;
                    }
                }
            }
            for server_item in &server_items {
                highest_handle = highest_handle.max(server_item.client_handle);
                if !items.contains_key(&server_item.client_handle) {
                    orphaned.push(server_item.server_id);
                }
            }
        }

        if highest_handle > 0 {
            raise_client_handle_floor(highest_handle);
        }
        if !orphaned.is_empty() {
            debug!(
                subscription_id,
                count = orphaned.len(),
                "deleting orphaned server items after transfer"
            );
            self.deleted_lock().extend(orphaned);
        }
        Ok(true)
    }

    fn items_lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, MonitoredItem>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn deleted_lock(&self) -> std::sync::MutexGuard<'_, Vec<u32>> {
        match self.deleted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_monotonic() {
        let a = next_client_handle();
        let b = next_client_handle();
        assert!(b > a);
    }

    #[test]
    fn floor_raise_skips_transferred_handles() {
        let current = next_client_handle();
        raise_client_handle_floor(current + 100);
        assert!(next_client_handle() > current + 100);
    }

    #[test]
    fn floor_raise_never_lowers() {
        let current = next_client_handle();
        raise_client_handle_floor(0);
        assert!(next_client_handle() > current);
    }

    #[test]
    fn remove_created_item_schedules_delete() {
        let set = MonitoredItemSet::new();
        let handle = set.add(MonitoredItemOptions::value("ns=2;s=a"));
        {
            let mut items = set.items_lock();
            let item = items.get_mut(&handle).unwrap();
            item.created = true;
            item.server_id = 42;
        }
        assert!(set.remove(handle));
        assert_eq!(*set.deleted_lock(), vec![42]);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn remove_pending_item_skips_delete() {
        let set = MonitoredItemSet::new();
        let handle = set.add(MonitoredItemOptions::value("ns=2;s=a"));
        assert!(set.remove(handle));
        assert!(set.deleted_lock().is_empty());
    }

    #[test]
    fn modify_marks_created_items_only() {
        let set = MonitoredItemSet::new();
        let handle = set.add(MonitoredItemOptions::value("ns=2;s=a"));
        set.modify(handle, |o| o.queue_size = 10);
        assert!(!set.get(handle).unwrap().attributes_modified);
        {
            let mut items = set.items_lock();
            items.get_mut(&handle).unwrap().created = true;
        }
        set.modify(handle, |o| o.queue_size = 20);
        assert!(set.get(handle).unwrap().attributes_modified);
        assert_eq!(set.get(handle).unwrap().options.queue_size, 20);
    }
}
