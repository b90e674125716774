//! Server object: group registry, shared collaborators and status.

use crate::cache::DataCache;
use crate::config::ServerConfig;
use crate::device::{Device, DevicePoller};
use crate::group::{DeliveryClock, Group, GroupBody, GroupCore, check_deadband, present_as};
use crate::io_worker::{IoWorker, TransactionTable};
use crate::namespace::{AddressSpace, NamespaceDirectory};
use crate::opc_da::errors::{ItemError, OpcError, OpcResult};
use crate::opc_da::typedefs::{GroupDef, GroupHandle, ItemHandle, ServerState, ServerStatus};
use crate::opc_da::value::{Variant, Vqt};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

#[cfg(test)]
mod tests;

#[derive(Debug, Default)]
struct Registry {
    groups: BTreeMap<GroupHandle, Arc<GroupCore>>,
    names: HashMap<String, GroupHandle>,
}

/// State shared by the server and every [`Group`] handle.
pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) namespace: NamespaceDirectory,
    pub(crate) cache: Arc<DataCache>,
    pub(crate) device: Arc<dyn Device>,
    pub(crate) transactions: Arc<TransactionTable>,
    pub(crate) io: IoWorker,
    registry: Mutex<Registry>,
    next_group_handle: AtomicU32,
    next_item_handle: AtomicU32,
    clock: Arc<DeliveryClock>,
    start_time: DateTime<Utc>,
    stopped: AtomicBool,
}

/// Next handle from `counter`, or `None` once the handle space is used up.
///
/// Counters start at 1 and stop at `u32::MAX` instead of wrapping onto a
/// handle that may still be live.
fn allocate(counter: &AtomicU32) -> Option<u32> {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
            value.checked_add(1)
        })
        .ok()
}

impl ServerContext {
    pub(crate) fn allocate_item_handle(&self) -> Option<ItemHandle> {
        allocate(&self.next_item_handle).map(ItemHandle)
    }

    pub(crate) fn check_locale(&self, locale_id: u32) -> OpcResult<()> {
        if !self.config.supports_locale(locale_id) {
            return Err(OpcError::InvalidArgument(format!(
                "locale 0x{locale_id:04X} is not supported"
            )));
        }
        Ok(())
    }

    /// Make sure future allocations start above restored handles.
    pub(crate) fn reserve_handles(&self, next_group: u32, next_item: u32) {
        self.next_group_handle.fetch_max(next_group, Ordering::Relaxed);
        self.next_item_handle.fetch_max(next_item, Ordering::Relaxed);
    }

    pub(crate) fn handle_counters(&self) -> (u32, u32) {
        (
            self.next_group_handle.load(Ordering::Relaxed),
            self.next_item_handle.load(Ordering::Relaxed),
        )
    }

    /// Create a group and start its scheduler.
    ///
    /// `handle` is only given when restoring a saved configuration.
    pub(crate) fn register_group(
        &self,
        def: &GroupDef,
        handle: Option<GroupHandle>,
    ) -> OpcResult<Arc<GroupCore>> {
        check_deadband(def.percent_deadband)?;
        self.check_locale(def.locale_id)?;

        let mut registry = self.registry.lock()?;
        if registry.groups.len() >= self.config.max_groups {
            return Err(OpcError::Busy(format!(
                "server already holds {} groups",
                self.config.max_groups
            )));
        }
        let requested_name = def
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());
        if let Some(name) = requested_name {
            if registry.names.contains_key(name) {
                return Err(OpcError::AlreadyExists(name.to_string()));
            }
        }
        let server_handle = match handle {
            Some(h) if h.0 == 0 || registry.groups.contains_key(&h) => {
                return Err(OpcError::InvalidArgument(format!(
                    "duplicate group handle {}",
                    h.0
                )));
            }
            Some(h) => h,
            None => allocate(&self.next_group_handle)
                .map(GroupHandle)
                .ok_or_else(|| OpcError::Busy("group handles exhausted".into()))?,
        };
        let name = match requested_name {
            Some(name) => name.to_string(),
            None => unique_name(&registry.names, server_handle),
        };

        let update_rate = self.config.revise_update_rate(def.update_rate);
        let body = GroupBody {
            name: name.clone(),
            active: def.active,
            requested_update_rate: def.update_rate,
            update_rate,
            client_handle: def.client_handle,
            time_bias: def.time_bias,
            percent_deadband: def.percent_deadband,
            locale_id: def.locale_id,
            items: BTreeMap::new(),
        };
        let core = Arc::new(GroupCore::new(
            server_handle,
            body,
            Arc::clone(&self.clock),
            self.config.callback_queue_depth,
        ));
        core.start_scheduler(update_rate)?;
        registry.groups.insert(server_handle, Arc::clone(&core));
        registry.names.insert(name.clone(), server_handle);
        tracing::info!(
            group = server_handle.0,
            name = %name,
            update_rate,
            active = def.active,
            "group created"
        );
        Ok(core)
    }

    pub(crate) fn rename_group(&self, core: &GroupCore, name: &str) -> OpcResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(OpcError::InvalidArgument("group name is empty".into()));
        }
        let mut registry = self.registry.lock()?;
        let mut body = core.write_body()?;
        if body.name == name {
            return Ok(());
        }
        if registry.names.contains_key(name) {
            return Err(OpcError::AlreadyExists(name.to_string()));
        }
        registry.names.remove(&body.name);
        registry
            .names
            .insert(name.to_string(), core.server_handle);
        tracing::info!(group = core.server_handle.0, from = %body.name, to = %name, "group renamed");
        body.name = name.to_string();
        Ok(())
    }

    fn lookup(&self, handle: GroupHandle) -> OpcResult<Arc<GroupCore>> {
        self.registry
            .lock()?
            .groups
            .get(&handle)
            .cloned()
            .ok_or_else(|| OpcError::InvalidHandle(format!("no group with handle {}", handle.0)))
    }

    fn remove_group(&self, handle: GroupHandle, force: bool) -> OpcResult<()> {
        let core = {
            let mut registry = self.registry.lock()?;
            let core = registry.groups.get(&handle).cloned().ok_or_else(|| {
                OpcError::InvalidHandle(format!("no group with handle {}", handle.0))
            })?;
            if !force && core.has_active_items()? {
                tracing::warn!(group = handle.0, "remove_group refused: items still active");
                return Err(OpcError::AccessDenied("items still active".into()));
            }
            registry.groups.remove(&handle);
            let name = core.body.read()?.name.clone();
            registry.names.remove(&name);
            core
        };
        core.shutdown();
        self.cache.purge_unused();
        tracing::info!(group = handle.0, force, "group removed");
        Ok(())
    }

    fn shutdown_groups(&self) {
        let cores: Vec<Arc<GroupCore>> = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.names.clear();
            std::mem::take(&mut registry.groups).into_values().collect()
        };
        for core in &cores {
            core.shutdown();
        }
        self.cache.purge_unused();
    }
}

fn unique_name(names: &HashMap<String, GroupHandle>, handle: GroupHandle) -> String {
    let base = format!("Group{}", handle.0);
    if !names.contains_key(&base) {
        return base;
    }
    (2u32..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !names.contains_key(candidate))
        .unwrap_or(base)
}

/// The subscription engine.
///
/// Owns every group, the shared cache, the I/O worker and the device
/// poller. Must be created inside a Tokio runtime.
pub struct Server {
    ctx: Arc<ServerContext>,
    poller: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.ctx.config)
            .field("start_time", &self.ctx.start_time)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Start a server over the given address space and device.
    ///
    /// # Errors
    /// Returns [`OpcError::InvalidArgument`] for an invalid configuration and
    /// [`OpcError::Internal`] when called outside a Tokio runtime.
    pub fn new(
        config: ServerConfig,
        address_space: Arc<dyn AddressSpace>,
        device: Arc<dyn Device>,
    ) -> OpcResult<Self> {
        tokio::runtime::Handle::try_current().map_err(|_| {
            OpcError::Internal("the server must be started inside a Tokio runtime".into())
        })?;
        config.validate()?;

        let cache = Arc::new(DataCache::new());
        let transactions = Arc::new(TransactionTable::default());
        let io = IoWorker::start(
            Arc::clone(&device),
            Arc::clone(&transactions),
            config.io_queue_depth,
        );
        let poller = (config.device_poll_ms > 0).then(|| {
            DevicePoller::spawn(
                Arc::clone(&cache),
                Arc::clone(&device),
                Duration::from_millis(config.device_poll_ms),
            )
        });
        let start_time = Utc::now();
        tracing::info!(
            min_update_rate_ms = config.min_update_rate_ms,
            device_poll_ms = config.device_poll_ms,
            "server started"
        );

        let ctx = Arc::new(ServerContext {
            namespace: NamespaceDirectory::new(address_space),
            cache,
            device,
            transactions,
            io,
            registry: Mutex::new(Registry::default()),
            next_group_handle: AtomicU32::new(1),
            next_item_handle: AtomicU32::new(1),
            clock: Arc::new(DeliveryClock::new(start_time)),
            start_time,
            stopped: AtomicBool::new(false),
            config,
        });
        Ok(Self { ctx, poller })
    }

    pub(crate) fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Create a group. The revised update rate is available from
    /// [`Group::update_rate`].
    ///
    /// # Errors
    /// [`OpcError::AlreadyExists`] for a duplicate name, [`OpcError::Busy`]
    /// at the group limit and [`OpcError::InvalidArgument`] for an invalid
    /// deadband or locale.
    pub fn add_group(&self, def: &GroupDef) -> OpcResult<Group> {
        let span = tracing::info_span!("opc.add_group", name = ?def.name, update_rate = def.update_rate);
        let _enter = span.enter();
        let core = self.ctx.register_group(def, None)?;
        Ok(Group::new(core, Arc::clone(&self.ctx)))
    }

    pub fn group(&self, handle: GroupHandle) -> OpcResult<Group> {
        let core = self.ctx.lookup(handle)?;
        Ok(Group::new(core, Arc::clone(&self.ctx)))
    }

    pub fn group_by_name(&self, name: &str) -> OpcResult<Group> {
        let handle = self
            .ctx
            .registry
            .lock()?
            .names
            .get(name.trim())
            .copied()
            .ok_or_else(|| OpcError::InvalidArgument(format!("no group named '{name}'")))?;
        self.group(handle)
    }

    /// Every group, in server-handle order.
    pub fn groups(&self) -> OpcResult<Vec<Group>> {
        Ok(self
            .ctx
            .registry
            .lock()?
            .groups
            .values()
            .map(|core| Group::new(Arc::clone(core), Arc::clone(&self.ctx)))
            .collect())
    }

    /// Remove a group.
    ///
    /// Without `force`, a group that still has active items is refused with
    /// [`OpcError::AccessDenied`]. Afterwards every operation on the handle
    /// fails with [`OpcError::InvalidHandle`].
    pub fn remove_group(&self, handle: GroupHandle, force: bool) -> OpcResult<()> {
        let span = tracing::info_span!("opc.remove_group", group = handle.0, force);
        let _enter = span.enter();
        self.ctx.remove_group(handle, force)
    }

    pub fn status(&self) -> ServerStatus {
        let group_count = self
            .ctx
            .registry
            .lock()
            .map(|r| r.groups.len())
            .unwrap_or_default();
        let server_state = if self.ctx.stopped.load(Ordering::Acquire) {
            ServerState::Suspended
        } else {
            ServerState::Running
        };
        ServerStatus {
            start_time: self.ctx.start_time,
            current_time: Utc::now(),
            last_update_time: self.ctx.clock.last(),
            server_state,
            group_count: u32::try_from(group_count).unwrap_or(u32::MAX),
            band_width: self.ctx.io.utilisation(),
            major_version: self.ctx.config.major_version,
            minor_version: self.ctx.config.minor_version,
            build_number: self.ctx.config.build_number,
            vendor_info: self.ctx.config.vendor_info.clone(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn namespace(&self) -> &NamespaceDirectory {
        &self.ctx.namespace
    }

    pub fn cache(&self) -> &DataCache {
        &self.ctx.cache
    }

    /// Inject a sample into the cache as if the device had just reported it.
    /// The value is stored in the tag's canonical type.
    ///
    /// # Errors
    /// Returns [`OpcError::InvalidArgument`] if `item_id` is not in the
    /// address space or the value cannot be converted to its type.
    pub fn update_sample(&self, item_id: &str, sample: Vqt) -> OpcResult<()> {
        let invalid = |e: ItemError| OpcError::InvalidArgument(format!("'{item_id}': {e}"));
        let info = self.ctx.namespace.validate(item_id, None).map_err(invalid)?;
        let sample = present_as(Some(&info.canonical_type), sample).map_err(invalid)?;
        self.ctx.cache.upsert(item_id, sample)
    }

    /// [`Server::update_sample`] with a Good sample stamped now.
    pub fn update_value(&self, item_id: &str, value: impl Into<Variant>) -> OpcResult<()> {
        self.update_sample(item_id, Vqt::good(value))
    }

    /// Release every group and stop the background tasks.
    pub fn shutdown(&self) {
        if self.ctx.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(poller) = &self.poller {
            poller.abort();
        }
        self.ctx.shutdown_groups();
        self.ctx.io.abort();
        tracing::info!("server shut down");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
