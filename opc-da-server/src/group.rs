//! Subscription groups.
//!
//! A [`Group`] is a cheap handle onto a group owned by the server. Every
//! operation fails with [`OpcError::InvalidHandle`] once the group has been
//! removed.

use crate::cache::TagSlot;
use crate::namespace::TagDef;
use crate::opc_da::callback::{GroupSinks, GroupSubscription};
use crate::opc_da::errors::{ItemError, OpcError, OpcResult};
use crate::opc_da::typedefs::{
    AccessRights, GroupHandle, GroupState, GroupStateUpdate, ItemAttributes, ItemDef,
    ItemHandle, ItemOutcome, ItemResult, TagInfo,
};
use crate::opc_da::value::{VarType, Variant, Vqt};
use crate::scheduler;
use crate::server::ServerContext;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Time of the most recent delivery to any client.
#[derive(Debug)]
pub(crate) struct DeliveryClock(Mutex<DateTime<Utc>>);

impl DeliveryClock {
    pub(crate) fn new(start: DateTime<Utc>) -> Self {
        Self(Mutex::new(start))
    }

    pub(crate) fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    pub(crate) fn last(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub(crate) struct Item {
    pub(crate) server_handle: ItemHandle,
    pub(crate) client_handle: ItemHandle,
    pub(crate) item_id: String,
    pub(crate) access_path: Option<String>,
    pub(crate) active: bool,
    pub(crate) requested_type: Option<VarType>,
    pub(crate) canonical_type: VarType,
    pub(crate) access_rights: AccessRights,
    pub(crate) eu_range: Option<(f64, f64)>,
    pub(crate) slot: Arc<TagSlot>,
    /// Deadband baseline: the sample most recently delivered for this item.
    pub(crate) last_reported: Mutex<Vqt>,
}

impl Item {
    fn new(server_handle: ItemHandle, def: &ItemDef, tag: TagDef, slot: Arc<TagSlot>) -> Self {
        let baseline = slot.snapshot();
        Self {
            server_handle,
            client_handle: def.client_handle,
            item_id: tag.item_id,
            access_path: def
                .access_path
                .as_ref()
                .filter(|p| !p.trim().is_empty())
                .cloned(),
            active: def.active,
            requested_type: def.requested_type.clone(),
            canonical_type: tag.canonical_type,
            access_rights: tag.access_rights,
            eu_range: tag.eu_range,
            slot,
            last_reported: Mutex::new(baseline),
        }
    }

    /// Sample converted to the type the client asked for.
    pub(crate) fn present(&self, sample: Vqt) -> Result<Vqt, ItemError> {
        present_as(self.requested_type.as_ref(), sample)
    }

    pub(crate) fn baseline(&self) -> Vqt {
        self.last_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn commit_baseline(&self, sample: Vqt) {
        *self
            .last_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = sample;
    }

    fn attributes(&self) -> ItemAttributes {
        ItemAttributes {
            access_path: self.access_path.clone(),
            item_id: self.item_id.clone(),
            active: self.active,
            client_handle: self.client_handle,
            server_handle: self.server_handle,
            access_rights: self.access_rights,
            requested_type: self.requested_type.clone(),
            canonical_type: self.canonical_type.clone(),
            eu_range: self.eu_range,
        }
    }

    fn definition(&self) -> ItemDef {
        ItemDef {
            access_path: self.access_path.clone(),
            item_id: self.item_id.clone(),
            active: self.active,
            client_handle: self.client_handle,
            requested_type: self.requested_type.clone(),
        }
    }
}

pub(crate) fn present_as(requested: Option<&VarType>, sample: Vqt) -> Result<Vqt, ItemError> {
    match requested {
        Some(ty) if sample.value != Variant::Empty => {
            let value = sample.value.coerce(ty)?;
            Ok(Vqt { value, ..sample })
        }
        _ => Ok(sample),
    }
}

#[derive(Debug)]
pub(crate) struct GroupBody {
    pub(crate) name: String,
    pub(crate) active: bool,
    pub(crate) requested_update_rate: u32,
    pub(crate) update_rate: u32,
    pub(crate) client_handle: GroupHandle,
    pub(crate) time_bias: i32,
    pub(crate) percent_deadband: f32,
    pub(crate) locale_id: u32,
    /// Ordered by server handle, the iteration order of scans and enumeration.
    pub(crate) items: BTreeMap<ItemHandle, Item>,
}

#[derive(Debug)]
pub(crate) struct GroupCore {
    pub(crate) server_handle: GroupHandle,
    pub(crate) body: RwLock<GroupBody>,
    sinks: Mutex<Option<GroupSinks>>,
    /// In-flight asynchronous operations per item.
    pending: Mutex<HashMap<ItemHandle, usize>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    removed: AtomicBool,
    pub(crate) clock: Arc<DeliveryClock>,
    pub(crate) callback_queue_depth: usize,
}

impl GroupCore {
    pub(crate) fn new(
        server_handle: GroupHandle,
        body: GroupBody,
        clock: Arc<DeliveryClock>,
        callback_queue_depth: usize,
    ) -> Self {
        Self {
            server_handle,
            body: RwLock::new(body),
            sinks: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            scheduler: Mutex::new(None),
            removed: AtomicBool::new(false),
            clock,
            callback_queue_depth,
        }
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_live(&self) -> OpcResult<()> {
        if self.is_removed() {
            return Err(OpcError::InvalidHandle(format!(
                "group {} has been removed",
                self.server_handle.0
            )));
        }
        Ok(())
    }

    pub(crate) fn read_body(&self) -> OpcResult<RwLockReadGuard<'_, GroupBody>> {
        self.ensure_live()?;
        Ok(self.body.read()?)
    }

    pub(crate) fn write_body(&self) -> OpcResult<RwLockWriteGuard<'_, GroupBody>> {
        self.ensure_live()?;
        Ok(self.body.write()?)
    }

    pub(crate) fn sinks(&self) -> OpcResult<Option<GroupSinks>> {
        Ok(self.sinks.lock()?.clone())
    }

    pub(crate) fn hold_pending(&self, handles: &[ItemHandle]) -> OpcResult<()> {
        let mut pending = self.pending.lock()?;
        for handle in handles {
            *pending.entry(*handle).or_insert(0) += 1;
        }
        Ok(())
    }

    pub(crate) fn release_pending(&self, handles: &[ItemHandle]) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in handles {
            if let Some(count) = pending.get_mut(handle) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    pending.remove(handle);
                }
            }
        }
    }

    /// (Re)start the scan task at the current revised rate.
    pub(crate) fn start_scheduler(self: &Arc<Self>, update_rate: u32) -> OpcResult<()> {
        let task = scheduler::spawn(self, update_rate);
        if let Some(old) = self.scheduler.lock()?.replace(task) {
            old.abort();
        }
        Ok(())
    }

    /// Mark removed, stop scanning and disconnect the subscriber.
    pub(crate) fn shutdown(&self) {
        self.removed.store(true, Ordering::Release);
        if let Some(task) = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.body
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .clear();
    }

    pub(crate) fn has_active_items(&self) -> OpcResult<bool> {
        Ok(self.body.read()?.items.values().any(|item| item.active))
    }
}

/// Handle to a subscription group.
#[derive(Clone)]
pub struct Group {
    pub(crate) core: Arc<GroupCore>,
    pub(crate) ctx: Arc<ServerContext>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("server_handle", &self.core.server_handle)
            .field("removed", &self.core.is_removed())
            .finish_non_exhaustive()
    }
}

pub(crate) fn require_items<T>(items: &[T], operation: &str) -> OpcResult<()> {
    if items.is_empty() {
        return Err(OpcError::InvalidArgument(format!(
            "{operation}: no items given"
        )));
    }
    Ok(())
}

pub(crate) fn require_aligned(left: usize, right: usize, operation: &str) -> OpcResult<()> {
    if left != right {
        return Err(OpcError::InvalidArgument(format!(
            "{operation}: {left} handles but {right} values"
        )));
    }
    Ok(())
}

impl Group {
    pub(crate) fn new(core: Arc<GroupCore>, ctx: Arc<ServerContext>) -> Self {
        Self { core, ctx }
    }

    pub fn server_handle(&self) -> GroupHandle {
        self.core.server_handle
    }

    pub fn is_removed(&self) -> bool {
        self.core.is_removed()
    }

    /// Revised update rate in milliseconds.
    pub fn update_rate(&self) -> OpcResult<u32> {
        Ok(self.core.read_body()?.update_rate)
    }

    /// Validate one definition against the namespace and the per-item rules.
    fn check_def(&self, def: &ItemDef) -> Result<TagDef, ItemError> {
        let tag = self
            .ctx
            .namespace
            .resolve(&def.item_id, def.access_path.as_deref())?;
        if def.active && !tag.access_rights.readable() {
            return Err(ItemError::AccessDenied);
        }
        if let Some(requested) = &def.requested_type {
            if !tag.canonical_type.can_convert_to(requested) {
                return Err(ItemError::BadType);
            }
        }
        Ok(tag)
    }

    /// Per-item validation plus the duplicate-client-handle rule of one call.
    fn check_defs(&self, defs: &[ItemDef]) -> Vec<Result<TagDef, ItemError>> {
        let mut seen = HashSet::new();
        defs.iter()
            .map(|def| {
                if !seen.insert(def.client_handle) {
                    return Err(ItemError::InvalidHandle);
                }
                self.check_def(def)
            })
            .collect()
    }

    /// Add items to the group.
    ///
    /// Each item succeeds or fails on its own; the result has the length and
    /// order of `defs`.
    ///
    /// # Errors
    /// Returns [`OpcError::InvalidArgument`] for an empty batch and
    /// [`OpcError::InvalidHandle`] once the group has been removed.
    pub fn add_items(&self, defs: &[ItemDef]) -> OpcResult<Vec<Result<ItemResult, ItemError>>> {
        let span = tracing::info_span!(
            "opc.add_items",
            group = self.core.server_handle.0,
            count = defs.len()
        );
        let _enter = span.enter();
        require_items(defs, "add_items")?;
        self.core.ensure_live()?;

        let checked = self.check_defs(defs);
        let max_items = self.ctx.config.max_items_per_group;
        let mut body = self.core.write_body()?;
        let mut results = Vec::with_capacity(defs.len());
        for (def, outcome) in defs.iter().zip(checked) {
            let tag = match outcome {
                Ok(tag) => tag,
                Err(e) => {
                    tracing::warn!(item = %def.item_id, error = %e, "add_items: item rejected");
                    results.push(Err(e));
                    continue;
                }
            };
            if body.items.len() >= max_items {
                tracing::warn!(item = %def.item_id, max_items, "add_items: group is full");
                results.push(Err(ItemError::Busy));
                continue;
            }
            let Some(server_handle) = self.ctx.allocate_item_handle() else {
                tracing::warn!(item = %def.item_id, "add_items: item handles exhausted");
                results.push(Err(ItemError::Busy));
                continue;
            };
            let result = ItemResult {
                server_handle,
                canonical_type: tag.canonical_type.clone(),
                access_rights: tag.access_rights,
            };
            let slot = self.ctx.cache.slot(&tag.item_id, Vqt::default)?;
            body.items
                .insert(server_handle, Item::new(server_handle, def, tag, slot));
            results.push(Ok(result));
        }
        let added = results.iter().filter(|r| r.is_ok()).count();
        tracing::info!(added, rejected = results.len() - added, "add_items completed");
        Ok(results)
    }

    /// Run the add-items checks without creating anything.
    pub fn validate_items(&self, defs: &[ItemDef]) -> OpcResult<Vec<Result<TagInfo, ItemError>>> {
        require_items(defs, "validate_items")?;
        self.core.ensure_live()?;
        Ok(self
            .check_defs(defs)
            .into_iter()
            .map(|outcome| outcome.map(|tag| tag.info()))
            .collect())
    }

    /// Insert an item under a fixed server handle.
    pub(crate) fn insert_restored(&self, server_handle: ItemHandle, def: &ItemDef) -> OpcResult<()> {
        let tag = self.check_def(def).map_err(|e| {
            OpcError::InvalidArgument(format!("item '{}' cannot be restored: {e}", def.item_id))
        })?;
        let slot = self.ctx.cache.slot(&tag.item_id, Vqt::default)?;
        let mut body = self.core.write_body()?;
        if body.items.contains_key(&server_handle) {
            return Err(OpcError::InvalidArgument(format!(
                "duplicate item handle {}",
                server_handle.0
            )));
        }
        body.items
            .insert(server_handle, Item::new(server_handle, def, tag, slot));
        Ok(())
    }

    /// Remove items from the group.
    ///
    /// An item still referenced by an asynchronous operation is refused with
    /// [`ItemError::AccessDenied`] unless `force` is set.
    pub fn remove_items(&self, handles: &[ItemHandle], force: bool) -> OpcResult<Vec<ItemOutcome>> {
        let span = tracing::info_span!(
            "opc.remove_items",
            group = self.core.server_handle.0,
            count = handles.len(),
            force
        );
        let _enter = span.enter();
        require_items(handles, "remove_items")?;

        let results = {
            let mut body = self.core.write_body()?;
            let pending = self.core.pending.lock()?;
            handles
                .iter()
                .map(|handle| {
                    if !body.items.contains_key(handle) {
                        return Err(ItemError::InvalidHandle);
                    }
                    if !force && pending.contains_key(handle) {
                        tracing::warn!(item = handle.0, "remove_items: item has pending I/O");
                        return Err(ItemError::AccessDenied);
                    }
                    body.items.remove(handle);
                    Ok(())
                })
                .collect::<Vec<_>>()
        };
        self.ctx.cache.purge_unused();
        tracing::info!(
            removed = results.iter().filter(|r| r.is_ok()).count(),
            "remove_items completed"
        );
        Ok(results)
    }

    /// Activate or deactivate items. Applying the same state twice is a no-op.
    pub fn set_active_state(&self, handles: &[ItemHandle], active: bool) -> OpcResult<Vec<ItemOutcome>> {
        let span = tracing::info_span!(
            "opc.set_active_state",
            group = self.core.server_handle.0,
            count = handles.len(),
            active
        );
        let _enter = span.enter();
        require_items(handles, "set_active_state")?;

        let mut body = self.core.write_body()?;
        Ok(handles
            .iter()
            .map(|handle| {
                let item = body.items.get_mut(handle).ok_or(ItemError::InvalidHandle)?;
                if active && !item.access_rights.readable() {
                    return Err(ItemError::AccessDenied);
                }
                item.active = active;
                Ok(())
            })
            .collect())
    }

    pub fn set_client_handles(
        &self,
        handles: &[ItemHandle],
        client_handles: &[ItemHandle],
    ) -> OpcResult<Vec<ItemOutcome>> {
        require_items(handles, "set_client_handles")?;
        require_aligned(handles.len(), client_handles.len(), "set_client_handles")?;

        let mut body = self.core.write_body()?;
        Ok(handles
            .iter()
            .zip(client_handles)
            .map(|(handle, client)| {
                let item = body.items.get_mut(handle).ok_or(ItemError::InvalidHandle)?;
                item.client_handle = *client;
                Ok(())
            })
            .collect())
    }

    /// Change the delivery type of items. `None` restores the canonical type.
    pub fn set_data_types(
        &self,
        handles: &[ItemHandle],
        requested_types: &[Option<VarType>],
    ) -> OpcResult<Vec<ItemOutcome>> {
        require_items(handles, "set_data_types")?;
        require_aligned(handles.len(), requested_types.len(), "set_data_types")?;

        let mut body = self.core.write_body()?;
        Ok(handles
            .iter()
            .zip(requested_types)
            .map(|(handle, requested)| {
                let item = body.items.get_mut(handle).ok_or(ItemError::InvalidHandle)?;
                if let Some(ty) = requested {
                    if !item.canonical_type.can_convert_to(ty) {
                        return Err(ItemError::BadType);
                    }
                }
                item.requested_type.clone_from(requested);
                Ok(())
            })
            .collect())
    }

    /// Attributes of every item, in server-handle order.
    pub fn items(&self) -> OpcResult<Vec<ItemAttributes>> {
        Ok(self
            .core
            .read_body()?
            .items
            .values()
            .map(Item::attributes)
            .collect())
    }

    pub(crate) fn item_definitions(&self) -> OpcResult<Vec<(ItemHandle, ItemDef)>> {
        Ok(self
            .core
            .read_body()?
            .items
            .values()
            .map(|item| (item.server_handle, item.definition()))
            .collect())
    }

    pub fn state(&self) -> OpcResult<GroupState> {
        let body = self.core.read_body()?;
        Ok(GroupState {
            update_rate: body.update_rate,
            requested_update_rate: body.requested_update_rate,
            active: body.active,
            name: body.name.clone(),
            time_bias: body.time_bias,
            percent_deadband: body.percent_deadband,
            locale_id: body.locale_id,
            client_handle: body.client_handle,
            server_handle: self.core.server_handle,
        })
    }

    /// Apply the fields present in `update` and return the revised update rate.
    ///
    /// # Errors
    /// Returns [`OpcError::InvalidArgument`] for a deadband outside 0..=100 or
    /// an unsupported locale; nothing is changed in that case.
    pub fn set_state(&self, update: &GroupStateUpdate) -> OpcResult<u32> {
        let span = tracing::info_span!("opc.set_state", group = self.core.server_handle.0);
        let _enter = span.enter();

        if let Some(deadband) = update.percent_deadband {
            check_deadband(deadband)?;
        }
        if let Some(locale) = update.locale_id {
            self.ctx.check_locale(locale)?;
        }

        let (revised, rate_changed) = {
            let mut body = self.core.write_body()?;
            let mut rate_changed = false;
            if let Some(requested) = update.update_rate {
                let revised = self.ctx.config.revise_update_rate(requested);
                body.requested_update_rate = requested;
                rate_changed = revised != body.update_rate;
                body.update_rate = revised;
            }
            if let Some(active) = update.active {
                body.active = active;
            }
            if let Some(time_bias) = update.time_bias {
                body.time_bias = time_bias;
            }
            if let Some(deadband) = update.percent_deadband {
                body.percent_deadband = deadband;
            }
            if let Some(locale) = update.locale_id {
                body.locale_id = locale;
            }
            if let Some(client_handle) = update.client_handle {
                body.client_handle = client_handle;
            }
            (body.update_rate, rate_changed)
        };

        if rate_changed {
            tracing::debug!(update_rate = revised, "update rate changed, restarting scans");
            self.core.start_scheduler(revised)?;
        }
        Ok(revised)
    }

    /// Rename the group.
    ///
    /// # Errors
    /// Returns [`OpcError::AlreadyExists`] if another group has that name.
    pub fn set_name(&self, name: &str) -> OpcResult<()> {
        self.ctx.rename_group(&self.core, name)
    }

    /// Copy this group's configuration and items into a new, inactive group.
    pub fn clone_group(&self, name: Option<&str>) -> OpcResult<Group> {
        let span = tracing::info_span!("opc.clone_group", group = self.core.server_handle.0);
        let _enter = span.enter();

        let state = self.state()?;
        let defs: Vec<ItemDef> = self
            .item_definitions()?
            .into_iter()
            .map(|(_, def)| def)
            .collect();

        let core = self.ctx.register_group(
            &crate::opc_da::typedefs::GroupDef {
                name: name.map(str::to_string),
                active: false,
                update_rate: state.requested_update_rate,
                client_handle: state.client_handle,
                time_bias: state.time_bias,
                percent_deadband: state.percent_deadband,
                locale_id: state.locale_id,
            },
            None,
        )?;
        let clone = Group::new(core, Arc::clone(&self.ctx));
        if !defs.is_empty() {
            for (def, result) in defs.iter().zip(clone.add_items(&defs)?) {
                if let Err(e) = result {
                    tracing::warn!(item = %def.item_id, error = %e, "clone_group: item not copied");
                }
            }
        }
        tracing::info!(clone = clone.server_handle().0, "clone_group completed");
        Ok(clone)
    }

    /// Connect a subscriber and return the receiving ends of its channels.
    ///
    /// # Errors
    /// Returns [`OpcError::AlreadyExists`] while another subscriber is connected.
    pub fn advise(&self) -> OpcResult<GroupSubscription> {
        self.core.ensure_live()?;
        let mut sinks = self.core.sinks.lock()?;
        if sinks.as_ref().is_some_and(|s| !s.is_closed()) {
            return Err(OpcError::AlreadyExists(
                "a subscriber is already connected".into(),
            ));
        }
        let depth = self.core.callback_queue_depth;
        let (data_tx, data_rx) = mpsc::channel(depth);
        let (done_tx, done_rx) = mpsc::channel(depth);
        *sinks = Some(GroupSinks {
            data_changes: data_tx,
            completions: done_tx,
        });
        tracing::info!(group = self.core.server_handle.0, "subscriber connected");
        Ok(GroupSubscription {
            data_changes: data_rx,
            completions: done_rx,
        })
    }

    /// Disconnect the subscriber.
    pub fn unadvise(&self) -> OpcResult<()> {
        self.core.ensure_live()?;
        match self.core.sinks.lock()?.take() {
            Some(_) => {
                tracing::info!(group = self.core.server_handle.0, "subscriber disconnected");
                Ok(())
            }
            None => Err(OpcError::InvalidState("no subscriber connected".into())),
        }
    }
}

pub(crate) fn check_deadband(deadband: f32) -> OpcResult<()> {
    if !(0.0..=100.0).contains(&deadband) {
        return Err(OpcError::InvalidArgument(format!(
            "percent deadband {deadband} outside 0..=100"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opc_da::quality::Quality;

    fn item(requested_type: Option<VarType>) -> Item {
        let def = ItemDef {
            requested_type,
            ..ItemDef::new("Sim.A", ItemHandle(1))
        };
        let tag = TagDef::new("Sim.A", VarType::R8, AccessRights::ReadWrite);
        Item::new(ItemHandle(10), &def, tag, Arc::new(TagSlot::default()))
    }

    #[test]
    fn test_present_converts_to_requested_type() {
        let item = item(Some(VarType::I4));
        let shown = item.present(Vqt::good(41.6)).unwrap();
        assert_eq!(shown.value, Variant::I4(42));
        assert_eq!(shown.quality, Quality::GOOD);

        let canonical = self::item(None);
        assert_eq!(canonical.present(Vqt::good(1.5)).unwrap().value, Variant::R8(1.5));
    }

    #[test]
    fn test_present_passes_empty_through() {
        let item = item(Some(VarType::I4));
        let waiting = item.present(Vqt::default()).unwrap();
        assert_eq!(waiting.value, Variant::Empty);
        assert_eq!(waiting.quality, Quality::BAD_WAITING_FOR_INITIAL_DATA);
    }

    #[test]
    fn test_baseline_seeded_from_slot() {
        let item = item(None);
        assert_eq!(item.baseline().value, Variant::Empty);
        item.commit_baseline(Vqt::good(2.0));
        assert_eq!(item.baseline().value, Variant::R8(2.0));
    }

    #[test]
    fn test_deadband_bounds() {
        assert!(check_deadband(0.0).is_ok());
        assert!(check_deadband(100.0).is_ok());
        assert!(check_deadband(-0.1).is_err());
        assert!(check_deadband(f32::NAN).is_err());
    }
}
