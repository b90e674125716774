//! Synchronous and asynchronous I/O on a group's items.
//!
//! Every per-item result is index-aligned with the handles the caller
//! passed in. Whole-call problems (empty or misaligned arrays, a removed
//! group, a full I/O queue) are returned as [`OpcError`] instead.

use crate::cache::TagSlot;
use crate::device::{Device, align_results, fault_quality};
use crate::group::{Group, Item, present_as, require_aligned, require_items};
use crate::io_worker::{HandlePair, IoRequest};
use crate::opc_da::errors::{ItemError, OpcError, OpcResult};
use crate::opc_da::quality::Quality;
use crate::opc_da::typedefs::{AsyncRequest, CancelId, DataSource, ItemHandle, ItemOutcome, ItemRead};
use crate::opc_da::value::{VarType, Variant, Vqt};
use std::sync::Arc;
use tracing::Instrument;

/// Snapshot of what a read needs from one item, taken under the group lock.
#[derive(Debug, Clone)]
pub(crate) struct ReadTarget {
    pub(crate) server_handle: ItemHandle,
    pub(crate) client_handle: ItemHandle,
    item_id: String,
    slot: Arc<TagSlot>,
    requested_type: Option<VarType>,
    /// Item and group both active.
    in_service: bool,
}

impl ReadTarget {
    pub(crate) fn new(item: &Item, client_handle: ItemHandle, in_service: bool) -> Self {
        Self {
            server_handle: item.server_handle,
            client_handle,
            item_id: item.item_id.clone(),
            slot: Arc::clone(&item.slot),
            requested_type: item.requested_type.clone(),
            in_service,
        }
    }

    pub(crate) fn into_write(self, value: Variant) -> WriteTarget {
        WriteTarget {
            item_id: self.item_id,
            slot: self.slot,
            value,
        }
    }

    fn present(&self, sample: Vqt) -> ItemRead {
        present_as(self.requested_type.as_ref(), sample)
    }
}

#[derive(Debug)]
pub(crate) struct WriteTarget {
    item_id: String,
    slot: Arc<TagSlot>,
    /// Already coerced to the canonical type.
    value: Variant,
}

/// Read the targets and convert each sample to the requested type.
pub(crate) async fn read_targets(
    device: &dyn Device,
    source: DataSource,
    targets: Vec<Result<ReadTarget, ItemError>>,
) -> Vec<ItemRead> {
    let samples = sample_targets(device, source, &targets).await;
    targets
        .iter()
        .zip(samples)
        .map(|(target, sample)| match target {
            Ok(target) => target.present(sample?),
            Err(e) => Err(*e),
        })
        .collect()
}

/// Canonical samples for the accepted targets, from the cache or the device.
///
/// Device reads refresh the cache. A communication failure is not an item
/// error: the cached value comes back with Bad/CommFailure quality.
pub(crate) async fn sample_targets(
    device: &dyn Device,
    source: DataSource,
    targets: &[Result<ReadTarget, ItemError>],
) -> Vec<Result<Vqt, ItemError>> {
    if source == DataSource::Cache {
        return targets
            .iter()
            .map(|target| {
                let target = target.as_ref().map_err(|e| *e)?;
                let sample = target.slot.snapshot();
                if target.in_service {
                    Ok(sample)
                } else {
                    let stamp = sample.timestamp;
                    Ok(sample.with_quality(Quality::BAD_OUT_OF_SERVICE, stamp))
                }
            })
            .collect();
    }

    let ids: Vec<String> = targets
        .iter()
        .filter_map(|t| t.as_ref().ok().map(|t| t.item_id.clone()))
        .collect();
    let mut answers = if ids.is_empty() {
        Vec::new()
    } else {
        let count = ids.len();
        align_results(device.read(ids).await, count, "read")
    }
    .into_iter();

    targets
        .iter()
        .map(|target| {
            let target = target.as_ref().map_err(|e| *e)?;
            match answers.next().unwrap_or(Err(ItemError::CommunicationFailure)) {
                Ok(sample) => {
                    target.slot.store(sample.clone());
                    Ok(sample)
                }
                Err(ItemError::CommunicationFailure) => {
                    tracing::warn!(item = %target.item_id, "device read failed, reporting cached value");
                    target.slot.mark(Quality::BAD_COMM_FAILURE);
                    Ok(target.slot.snapshot())
                }
                Err(e) => {
                    tracing::warn!(item = %target.item_id, error = %e, "device rejected read");
                    target.slot.mark(fault_quality(e));
                    Err(e)
                }
            }
        })
        .collect()
}

/// Write the accepted targets to the device; successful writes update the cache.
pub(crate) async fn write_targets(
    device: &dyn Device,
    targets: Vec<Result<WriteTarget, ItemError>>,
) -> Vec<ItemOutcome> {
    let writes: Vec<(String, Variant)> = targets
        .iter()
        .filter_map(|t| t.as_ref().ok().map(|t| (t.item_id.clone(), t.value.clone())))
        .collect();
    let mut answers = if writes.is_empty() {
        Vec::new()
    } else {
        let count = writes.len();
        align_results(device.write(writes).await, count, "write")
    }
    .into_iter();

    targets
        .into_iter()
        .map(|target| {
            let target = target?;
            match answers.next().unwrap_or(Err(ItemError::CommunicationFailure)) {
                Ok(()) => {
                    target.slot.store(Vqt::good(target.value));
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!(item = %target.item_id, error = %e, "device rejected write");
                    Err(e)
                }
            }
        })
        .collect()
}

impl Group {
    fn read_plan(&self, handles: &[ItemHandle]) -> OpcResult<Vec<Result<ReadTarget, ItemError>>> {
        let body = self.core.read_body()?;
        Ok(handles
            .iter()
            .map(|handle| {
                let item = body.items.get(handle).ok_or(ItemError::InvalidHandle)?;
                if !item.access_rights.readable() {
                    return Err(ItemError::AccessDenied);
                }
                Ok(ReadTarget::new(
                    item,
                    item.client_handle,
                    body.active && item.active,
                ))
            })
            .collect())
    }

    fn write_plan(
        &self,
        handles: &[ItemHandle],
        values: &[Variant],
    ) -> OpcResult<Vec<Result<(ReadTarget, Variant), ItemError>>> {
        let body = self.core.read_body()?;
        Ok(handles
            .iter()
            .zip(values)
            .map(|(handle, value)| {
                let item = body.items.get(handle).ok_or(ItemError::InvalidHandle)?;
                if !item.access_rights.writable() {
                    return Err(ItemError::AccessDenied);
                }
                let coerced = value.coerce(&item.canonical_type)?;
                Ok((ReadTarget::new(item, item.client_handle, true), coerced))
            })
            .collect())
    }

    /// Read items and wait for the whole batch.
    ///
    /// # Errors
    /// Returns [`OpcError::InvalidArgument`] for an empty batch and
    /// [`OpcError::InvalidHandle`] once the group has been removed.
    pub async fn read(&self, source: DataSource, handles: &[ItemHandle]) -> OpcResult<Vec<ItemRead>> {
        let span = tracing::info_span!(
            "opc.read",
            group = self.core.server_handle.0,
            source = ?source,
            count = handles.len()
        );
        async {
            require_items(handles, "read")?;
            let plan = self.read_plan(handles)?;
            let results = read_targets(self.ctx.device.as_ref(), source, plan).await;
            tracing::info!(
                failed = results.iter().filter(|r| r.is_err()).count(),
                "read completed"
            );
            Ok::<_, OpcError>(results)
        }
        .instrument(span)
        .await
    }

    /// Write values and wait for the device to acknowledge the whole batch.
    ///
    /// Values are converted to each item's canonical type first; items that
    /// fail conversion never reach the device.
    pub async fn write(&self, handles: &[ItemHandle], values: &[Variant]) -> OpcResult<Vec<ItemOutcome>> {
        let span = tracing::info_span!(
            "opc.write",
            group = self.core.server_handle.0,
            count = handles.len()
        );
        async {
            require_items(handles, "write")?;
            require_aligned(handles.len(), values.len(), "write")?;
            let plan: Vec<Result<WriteTarget, ItemError>> = self
                .write_plan(handles, values)?
                .into_iter()
                .map(|entry| entry.map(|(target, value)| target.into_write(value)))
                .collect();
            let results = write_targets(self.ctx.device.as_ref(), plan).await;
            tracing::info!(
                failed = results.iter().filter(|r| r.is_err()).count(),
                "write completed"
            );
            Ok::<_, OpcError>(results)
        }
        .instrument(span)
        .await
    }

    fn require_subscriber(&self) -> OpcResult<()> {
        if self.core.sinks()?.is_none() {
            return Err(OpcError::InvalidState(
                "asynchronous I/O needs a connected subscriber".into(),
            ));
        }
        Ok(())
    }

    /// Track `accepted` as pending and queue the request built for the new cancel ID.
    fn submit(
        &self,
        accepted: &[ItemHandle],
        build: impl FnOnce(CancelId) -> IoRequest,
    ) -> OpcResult<CancelId> {
        self.core.hold_pending(accepted)?;
        let cancel_id = match self.ctx.transactions.register(self.core.server_handle) {
            Ok(id) => id,
            Err(e) => {
                self.core.release_pending(accepted);
                return Err(e);
            }
        };
        if let Err(e) = self.ctx.io.submit(build(cancel_id)) {
            self.core.release_pending(accepted);
            self.ctx.transactions.finish(cancel_id);
            return Err(e);
        }
        Ok(cancel_id)
    }

    /// Queue a device read. The result arrives as [`crate::Completion::Read`].
    ///
    /// # Errors
    /// [`OpcError::InvalidState`] without a subscriber and [`OpcError::Busy`]
    /// when the I/O queue is full.
    pub fn async_read(&self, handles: &[ItemHandle], transaction_id: u32) -> OpcResult<AsyncRequest> {
        let span = tracing::info_span!(
            "opc.async_read.submit",
            group = self.core.server_handle.0,
            transaction_id,
            count = handles.len()
        );
        let _enter = span.enter();
        require_items(handles, "async_read")?;
        self.require_subscriber()?;

        let mut accepted: Vec<HandlePair> = Vec::new();
        let errors: Vec<ItemOutcome> = self
            .read_plan(handles)?
            .into_iter()
            .map(|target| {
                let target = target?;
                accepted.push((target.server_handle, target.client_handle));
                Ok(())
            })
            .collect();
        if accepted.is_empty() {
            return Ok(AsyncRequest {
                cancel_id: CancelId::default(),
                errors,
            });
        }

        let servers: Vec<ItemHandle> = accepted.iter().map(|(s, _)| *s).collect();
        let group = Arc::clone(&self.core);
        let cancel_id = self.submit(&servers, |cancel_id| IoRequest::Read {
            group,
            cancel_id,
            transaction_id,
            items: accepted,
        })?;
        tracing::debug!(cancel_id = cancel_id.0, open = self.ctx.transactions.len(), "async read queued");
        Ok(AsyncRequest { cancel_id, errors })
    }

    /// Queue a device write. The result arrives as [`crate::Completion::Write`].
    pub fn async_write(
        &self,
        handles: &[ItemHandle],
        values: &[Variant],
        transaction_id: u32,
    ) -> OpcResult<AsyncRequest> {
        let span = tracing::info_span!(
            "opc.async_write.submit",
            group = self.core.server_handle.0,
            transaction_id,
            count = handles.len()
        );
        let _enter = span.enter();
        require_items(handles, "async_write")?;
        require_aligned(handles.len(), values.len(), "async_write")?;
        self.require_subscriber()?;

        let mut accepted: Vec<(HandlePair, Variant)> = Vec::new();
        let errors: Vec<ItemOutcome> = self
            .write_plan(handles, values)?
            .into_iter()
            .map(|entry| {
                let (target, value) = entry?;
                accepted.push(((target.server_handle, target.client_handle), value));
                Ok(())
            })
            .collect();
        if accepted.is_empty() {
            return Ok(AsyncRequest {
                cancel_id: CancelId::default(),
                errors,
            });
        }

        let servers: Vec<ItemHandle> = accepted.iter().map(|((s, _), _)| *s).collect();
        let group = Arc::clone(&self.core);
        let cancel_id = self.submit(&servers, |cancel_id| IoRequest::Write {
            group,
            cancel_id,
            transaction_id,
            items: accepted,
        })?;
        tracing::debug!(cancel_id = cancel_id.0, open = self.ctx.transactions.len(), "async write queued");
        Ok(AsyncRequest { cancel_id, errors })
    }

    /// Deliver every active item's current value, ignoring the deadband.
    ///
    /// The delivery arrives on the data-change channel tagged with
    /// `transaction_id`.
    ///
    /// # Errors
    /// [`OpcError::InvalidArgument`] for transaction ID 0 and
    /// [`OpcError::InvalidState`] for an inactive group or one without
    /// active items.
    pub fn refresh(&self, source: DataSource, transaction_id: u32) -> OpcResult<CancelId> {
        let span = tracing::info_span!(
            "opc.refresh.submit",
            group = self.core.server_handle.0,
            transaction_id,
            source = ?source
        );
        let _enter = span.enter();
        if transaction_id == 0 {
            return Err(OpcError::InvalidArgument(
                "refresh needs a non-zero transaction ID".into(),
            ));
        }
        {
            let body = self.core.read_body()?;
            if !body.active {
                return Err(OpcError::InvalidState("group is inactive".into()));
            }
            if !body.items.values().any(|item| item.active) {
                return Err(OpcError::InvalidState("group has no active items".into()));
            }
        }
        self.require_subscriber()?;

        let group = Arc::clone(&self.core);
        let cancel_id = self.submit(&[], |cancel_id| IoRequest::Refresh {
            group,
            cancel_id,
            transaction_id,
            source,
        })?;
        tracing::debug!(cancel_id = cancel_id.0, "refresh queued");
        Ok(cancel_id)
    }

    /// Suppress the completion of a pending asynchronous operation.
    ///
    /// Cancelling an operation that already completed, or an unknown ID, is
    /// a successful no-op.
    pub fn cancel(&self, cancel_id: CancelId) -> OpcResult<()> {
        self.core.ensure_live()?;
        if self
            .ctx
            .transactions
            .cancel(self.core.server_handle, cancel_id)?
        {
            tracing::info!(
                group = self.core.server_handle.0,
                cancel_id = cancel_id.0,
                "cancel requested"
            );
        }
        Ok(())
    }
}
