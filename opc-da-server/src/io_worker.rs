//! Asynchronous I/O worker.
//!
//! Asynchronous reads, writes and refreshes are queued on a bounded channel
//! and executed one at a time by a dedicated task, so a slow device never
//! holds up the scan tasks. Each request answers through the group's
//! callback channels instead of a reply channel.

use crate::device::Device;
use crate::gateway::{self, ReadTarget, WriteTarget};
use crate::group::GroupCore;
use crate::opc_da::callback::{
    CancelComplete, Completion, DataChange, ReadComplete, WriteComplete,
};
use crate::opc_da::errors::{ItemError, OpcError, OpcResult};
use crate::opc_da::typedefs::{CancelId, DataSource, GroupHandle, ItemHandle, ItemState};
use crate::opc_da::value::Variant;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Upper bound on waiting for a subscriber to make room for a completion.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// `(server handle, client handle)` of an accepted item.
pub(crate) type HandlePair = (ItemHandle, ItemHandle);

pub(crate) enum IoRequest {
    Read {
        group: Arc<GroupCore>,
        cancel_id: CancelId,
        transaction_id: u32,
        items: Vec<HandlePair>,
    },
    Write {
        group: Arc<GroupCore>,
        cancel_id: CancelId,
        transaction_id: u32,
        items: Vec<(HandlePair, Variant)>,
    },
    Refresh {
        group: Arc<GroupCore>,
        cancel_id: CancelId,
        transaction_id: u32,
        source: DataSource,
    },
}

impl IoRequest {
    fn cancel_id(&self) -> CancelId {
        match self {
            Self::Read { cancel_id, .. }
            | Self::Write { cancel_id, .. }
            | Self::Refresh { cancel_id, .. } => *cancel_id,
        }
    }
}

#[derive(Debug)]
struct Transaction {
    group: GroupHandle,
    cancelled: bool,
}

/// Outstanding asynchronous operations, keyed by cancel ID.
#[derive(Debug)]
pub(crate) struct TransactionTable {
    next_id: AtomicU32,
    open: Mutex<HashMap<CancelId, Transaction>>,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }
}

impl TransactionTable {
    pub(crate) fn register(&self, group: GroupHandle) -> OpcResult<CancelId> {
        let mut open = self.open.lock()?;
        loop {
            let id = CancelId(self.next_id.fetch_add(1, Ordering::Relaxed));
            if id.0 != 0 && !open.contains_key(&id) {
                open.insert(
                    id,
                    Transaction {
                        group,
                        cancelled: false,
                    },
                );
                return Ok(id);
            }
        }
    }

    /// Flag an open transaction of `group`. Unknown or finished IDs are ignored.
    pub(crate) fn cancel(&self, group: GroupHandle, id: CancelId) -> OpcResult<bool> {
        let mut open = self.open.lock()?;
        match open.get_mut(&id) {
            Some(tx) if tx.group == group => {
                tx.cancelled = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn is_cancelled(&self, id: CancelId) -> bool {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .is_some_and(|tx| tx.cancelled)
    }

    /// Close a transaction; returns whether it was cancelled.
    pub(crate) fn finish(&self, id: CancelId) -> bool {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some_and(|tx| tx.cancelled)
    }

    pub(crate) fn len(&self) -> usize {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub(crate) struct IoWorker {
    sender: mpsc::Sender<IoRequest>,
    handle: JoinHandle<()>,
    capacity: usize,
}

impl IoWorker {
    pub(crate) fn start(
        device: Arc<dyn Device>,
        transactions: Arc<TransactionTable>,
        capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<IoRequest>(capacity);
        let handle = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let cancel_id = req.cancel_id();
                if transactions.is_cancelled(cancel_id) {
                    skip_cancelled(req, &transactions).await;
                    continue;
                }
                match req {
                    IoRequest::Read {
                        group,
                        cancel_id,
                        transaction_id,
                        items,
                    } => {
                        let span = tracing::info_span!(
                            "opc.async_read",
                            group = group.server_handle.0,
                            transaction_id,
                            count = items.len()
                        );
                        handle_read(device.as_ref(), &transactions, &group, cancel_id, transaction_id, items)
                            .instrument(span)
                            .await;
                    }
                    IoRequest::Write {
                        group,
                        cancel_id,
                        transaction_id,
                        items,
                    } => {
                        let span = tracing::info_span!(
                            "opc.async_write",
                            group = group.server_handle.0,
                            transaction_id,
                            count = items.len()
                        );
                        handle_write(device.as_ref(), &transactions, &group, cancel_id, transaction_id, items)
                            .instrument(span)
                            .await;
                    }
                    IoRequest::Refresh {
                        group,
                        cancel_id,
                        transaction_id,
                        source,
                    } => {
                        let span = tracing::info_span!(
                            "opc.refresh",
                            group = group.server_handle.0,
                            transaction_id,
                            source = ?source
                        );
                        handle_refresh(device.as_ref(), &transactions, &group, cancel_id, transaction_id, source)
                            .instrument(span)
                            .await;
                    }
                }
            }
            tracing::debug!("I/O worker exiting cleanly");
        });
        tracing::debug!(capacity, "I/O worker started");
        Self {
            sender: tx,
            handle,
            capacity,
        }
    }

    /// Queue a request without waiting.
    ///
    /// # Errors
    /// Returns [`OpcError::Busy`] when the queue is full and
    /// [`OpcError::Internal`] when the worker has stopped.
    pub(crate) fn submit(&self, req: IoRequest) -> OpcResult<()> {
        if self.handle.is_finished() {
            tracing::error!("I/O worker stopped unexpectedly");
            return Err(OpcError::Internal("I/O worker stopped".into()));
        }
        self.sender.try_send(req).map_err(|e| match e {
            TrySendError::Full(_) => {
                tracing::warn!(capacity = self.capacity, "I/O queue full, rejecting request");
                OpcError::Busy("asynchronous I/O queue is full".into())
            }
            TrySendError::Closed(_) => {
                OpcError::Internal("I/O worker channel closed (worker stopped)".into())
            }
        })
    }

    /// Queue utilisation in percent.
    pub(crate) fn utilisation(&self) -> u32 {
        let used = self.capacity.saturating_sub(self.sender.capacity());
        u32::try_from(used * 100 / self.capacity.max(1)).unwrap_or(100)
    }

    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}

async fn skip_cancelled(req: IoRequest, transactions: &TransactionTable) {
    let (group, cancel_id, transaction_id, handles) = match req {
        IoRequest::Read {
            group,
            cancel_id,
            transaction_id,
            items,
        } => (group, cancel_id, transaction_id, items.iter().map(|(s, _)| *s).collect()),
        IoRequest::Write {
            group,
            cancel_id,
            transaction_id,
            items,
        } => (
            group,
            cancel_id,
            transaction_id,
            items.iter().map(|((s, _), _)| *s).collect(),
        ),
        IoRequest::Refresh {
            group,
            cancel_id,
            transaction_id,
            ..
        } => (group, cancel_id, transaction_id, Vec::new()),
    };
    tracing::debug!(
        group = group.server_handle.0,
        cancel_id = cancel_id.0,
        "request cancelled before execution"
    );
    group.release_pending(&handles);
    transactions.finish(cancel_id);
    deliver_cancel(&group, cancel_id, transaction_id).await;
}

async fn deliver_cancel(group: &GroupCore, cancel_id: CancelId, transaction_id: u32) {
    deliver_completion(
        group,
        Completion::Cancel(CancelComplete {
            transaction_id,
            cancel_id,
            group_client_handle: group_client_handle(group),
        }),
    )
    .await;
}

async fn deliver_completion(group: &GroupCore, completion: Completion) {
    let sinks = match group.sinks() {
        Ok(Some(sinks)) => sinks,
        Ok(None) => {
            tracing::debug!(group = group.server_handle.0, "no subscriber, completion dropped");
            return;
        }
        Err(e) => {
            tracing::error!(group = group.server_handle.0, error = %e, "completion dropped");
            return;
        }
    };
    match tokio::time::timeout(DELIVERY_TIMEOUT, sinks.completions.send(completion)).await {
        Ok(Ok(())) => group.clock.touch(),
        Ok(Err(_)) => tracing::debug!(group = group.server_handle.0, "subscriber went away"),
        Err(_) => tracing::warn!(group = group.server_handle.0, "subscriber stalled, completion dropped"),
    }
}

/// Targets for the accepted items still present in the group.
fn resolve_targets(group: &GroupCore, items: &[HandlePair]) -> Vec<Result<ReadTarget, ItemError>> {
    let Ok(body) = group.body.read() else {
        return vec![Err(ItemError::InvalidHandle); items.len()];
    };
    items
        .iter()
        .map(|(server, client)| {
            body.items
                .get(server)
                .map(|item| ReadTarget::new(item, *client, true))
                .ok_or(ItemError::InvalidHandle)
        })
        .collect()
}

fn group_client_handle(group: &GroupCore) -> GroupHandle {
    group
        .body
        .read()
        .map(|b| b.client_handle)
        .unwrap_or_default()
}

async fn handle_read(
    device: &dyn Device,
    transactions: &TransactionTable,
    group: &GroupCore,
    cancel_id: CancelId,
    transaction_id: u32,
    items: Vec<HandlePair>,
) {
    let targets = resolve_targets(group, &items);
    let results = gateway::read_targets(device, DataSource::Device, targets).await;
    let states: Vec<ItemState> = items
        .iter()
        .zip(results)
        .map(|((_, client), result)| match result {
            Ok(sample) => ItemState::from_vqt(*client, sample),
            Err(e) => ItemState::failed(*client, e),
        })
        .collect();

    let handles: Vec<ItemHandle> = items.iter().map(|(s, _)| *s).collect();
    group.release_pending(&handles);
    let completion = if transactions.finish(cancel_id) {
        tracing::debug!(cancel_id = cancel_id.0, "read cancelled, suppressing result");
        Completion::Cancel(CancelComplete {
            transaction_id,
            cancel_id,
            group_client_handle: group_client_handle(group),
        })
    } else {
        tracing::info!(count = states.len(), "async read completed");
        Completion::Read(ReadComplete {
            transaction_id,
            cancel_id,
            group_client_handle: group_client_handle(group),
            items: states,
        })
    };
    deliver_completion(group, completion).await;
}

async fn handle_write(
    device: &dyn Device,
    transactions: &TransactionTable,
    group: &GroupCore,
    cancel_id: CancelId,
    transaction_id: u32,
    items: Vec<(HandlePair, Variant)>,
) {
    let pairs: Vec<HandlePair> = items.iter().map(|(pair, _)| *pair).collect();
    let targets: Vec<Result<WriteTarget, ItemError>> = {
        let resolved = resolve_targets(group, &pairs);
        resolved
            .into_iter()
            .zip(items.into_iter().map(|(_, value)| value))
            .map(|(target, value)| target.map(|t| t.into_write(value)))
            .collect()
    };
    let outcomes = gateway::write_targets(device, targets).await;
    let results: Vec<(ItemHandle, Result<(), ItemError>)> = pairs
        .iter()
        .zip(outcomes)
        .map(|((_, client), outcome)| (*client, outcome))
        .collect();

    let handles: Vec<ItemHandle> = pairs.iter().map(|(s, _)| *s).collect();
    group.release_pending(&handles);
    let completion = if transactions.finish(cancel_id) {
        tracing::debug!(cancel_id = cancel_id.0, "write cancelled, suppressing result");
        Completion::Cancel(CancelComplete {
            transaction_id,
            cancel_id,
            group_client_handle: group_client_handle(group),
        })
    } else {
        tracing::info!(count = results.len(), "async write completed");
        Completion::Write(WriteComplete {
            transaction_id,
            cancel_id,
            group_client_handle: group_client_handle(group),
            results,
        })
    };
    deliver_completion(group, completion).await;
}

async fn handle_refresh(
    device: &dyn Device,
    transactions: &TransactionTable,
    group: &GroupCore,
    cancel_id: CancelId,
    transaction_id: u32,
    source: DataSource,
) {
    let targets: Vec<Result<ReadTarget, ItemError>> = match group.body.read() {
        Ok(body) if body.active => body
            .items
            .values()
            .filter(|item| item.active)
            .map(|item| Ok(ReadTarget::new(item, item.client_handle, true)))
            .collect(),
        _ => Vec::new(),
    };
    let samples = if targets.is_empty() {
        Vec::new()
    } else {
        gateway::sample_targets(device, source, &targets).await
    };

    if transactions.finish(cancel_id) {
        tracing::debug!(cancel_id = cancel_id.0, "refresh cancelled, suppressing result");
        deliver_cancel(group, cancel_id, transaction_id).await;
        return;
    }

    let Ok(Some(sinks)) = group.sinks() else {
        tracing::debug!(group = group.server_handle.0, "no subscriber, refresh dropped");
        return;
    };

    // Refresh ignores the deadband and the delivered samples become the new baselines.
    let (change, baselines) = {
        let Ok(body) = group.body.read() else {
            return;
        };
        let mut states = Vec::with_capacity(samples.len());
        let mut baselines = Vec::with_capacity(samples.len());
        for (target, sample) in targets.iter().zip(samples) {
            let Ok(target) = target else {
                continue;
            };
            let Some(item) = body.items.get(&target.server_handle) else {
                continue;
            };
            let shown = sample.and_then(|canonical| {
                let shown = item.present(canonical.clone())?;
                Ok((canonical, shown))
            });
            match shown {
                Ok((canonical, shown)) => {
                    baselines.push((target.server_handle, canonical));
                    states.push(ItemState::from_vqt(item.client_handle, shown));
                }
                Err(e) => states.push(ItemState::failed(item.client_handle, e)),
            }
        }
        if states.is_empty() {
            tracing::debug!(
                group = group.server_handle.0,
                cancel_id = cancel_id.0,
                "no active items left, refresh skipped"
            );
            return;
        }
        (
            DataChange::new(transaction_id, body.client_handle, states),
            baselines,
        )
    };
    let count = change.items.len();

    match tokio::time::timeout(DELIVERY_TIMEOUT, sinks.data_changes.send(change)).await {
        Ok(Ok(())) => {
            if let Ok(body) = group.body.read() {
                for (handle, sample) in baselines {
                    if let Some(item) = body.items.get(&handle) {
                        item.commit_baseline(sample);
                    }
                }
            }
            group.clock.touch();
            tracing::info!(count, "refresh delivered");
        }
        Ok(Err(_)) => tracing::debug!(group = group.server_handle.0, "subscriber went away"),
        Err(_) => tracing::warn!(group = group.server_handle.0, "subscriber stalled, refresh dropped"),
    }
}
