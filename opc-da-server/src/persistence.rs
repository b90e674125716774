//! Saving and restoring the group configuration.
//!
//! The snapshot is JSON. Only configuration is saved; values come back from
//! the device once the restored server runs.

use crate::config::ServerConfig;
use crate::device::Device;
use crate::group::Group;
use crate::namespace::AddressSpace;
use crate::opc_da::errors::{OpcError, OpcResult};
use crate::opc_da::typedefs::{GroupDef, GroupHandle, ItemDef, ItemHandle};
use crate::opc_da::value::VarType;
use crate::server::Server;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ServerSnapshot {
    next_group_handle: u32,
    next_item_handle: u32,
    groups: Vec<GroupSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GroupSnapshot {
    server_handle: GroupHandle,
    client_handle: GroupHandle,
    name: String,
    active: bool,
    requested_update_rate: u32,
    percent_deadband: f32,
    time_bias: i32,
    locale_id: u32,
    items: Vec<ItemSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ItemSnapshot {
    server_handle: ItemHandle,
    client_handle: ItemHandle,
    item_id: String,
    #[serde(default)]
    access_path: Option<String>,
    active: bool,
    #[serde(default)]
    requested_type: Option<VarType>,
}

impl Server {
    /// Encode every group and item, including their server handles.
    ///
    /// # Errors
    /// Fails with [`OpcError::Internal`] on corrupted internal state.
    pub fn serialize(&self) -> OpcResult<Vec<u8>> {
        let span = tracing::info_span!("opc.serialize");
        let _enter = span.enter();

        let (next_group_handle, next_item_handle) = self.context().handle_counters();
        let mut groups = Vec::new();
        for group in self.groups()? {
            let state = group.state()?;
            let items = group
                .item_definitions()?
                .into_iter()
                .map(|(server_handle, def)| ItemSnapshot {
                    server_handle,
                    client_handle: def.client_handle,
                    item_id: def.item_id,
                    access_path: def.access_path,
                    active: def.active,
                    requested_type: def.requested_type,
                })
                .collect();
            groups.push(GroupSnapshot {
                server_handle: state.server_handle,
                client_handle: state.client_handle,
                name: state.name,
                active: state.active,
                requested_update_rate: state.requested_update_rate,
                percent_deadband: state.percent_deadband,
                time_bias: state.time_bias,
                locale_id: state.locale_id,
                items,
            });
        }

        let snapshot = ServerSnapshot {
            next_group_handle,
            next_item_handle,
            groups,
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        tracing::info!(groups = snapshot.groups.len(), bytes = bytes.len(), "configuration saved");
        Ok(bytes)
    }

    /// Start a server with the groups and items of a saved configuration.
    ///
    /// Server handles are reproduced exactly and later allocations never
    /// collide with them.
    ///
    /// # Errors
    /// Returns [`OpcError::Serialization`] for an unreadable blob and
    /// [`OpcError::InvalidArgument`] when a handle is duplicated or an item
    /// no longer resolves in `address_space`.
    pub fn restore(
        config: ServerConfig,
        address_space: Arc<dyn AddressSpace>,
        device: Arc<dyn Device>,
        blob: &[u8],
    ) -> OpcResult<Self> {
        let span = tracing::info_span!("opc.restore", bytes = blob.len());
        let _enter = span.enter();

        let snapshot: ServerSnapshot = serde_json::from_slice(blob)?;
        check_unique_handles(&snapshot)?;

        let server = Self::new(config, address_space, device)?;
        let ctx = server.context();
        let max_group = snapshot.groups.iter().map(|g| g.server_handle.0).max().unwrap_or(0);
        let max_item = snapshot
            .groups
            .iter()
            .flat_map(|g| g.items.iter().map(|i| i.server_handle.0))
            .max()
            .unwrap_or(0);
        ctx.reserve_handles(
            snapshot.next_group_handle.max(max_group.saturating_add(1)),
            snapshot.next_item_handle.max(max_item.saturating_add(1)),
        );

        for saved in &snapshot.groups {
            let def = GroupDef {
                name: Some(saved.name.clone()),
                active: saved.active,
                update_rate: saved.requested_update_rate,
                client_handle: saved.client_handle,
                time_bias: saved.time_bias,
                percent_deadband: saved.percent_deadband,
                locale_id: saved.locale_id,
            };
            let core = ctx.register_group(&def, Some(saved.server_handle))?;
            let group = Group::new(core, Arc::clone(ctx));
            for item in &saved.items {
                let item_def = ItemDef {
                    access_path: item.access_path.clone(),
                    item_id: item.item_id.clone(),
                    active: item.active,
                    client_handle: item.client_handle,
                    requested_type: item.requested_type.clone(),
                };
                group.insert_restored(item.server_handle, &item_def)?;
            }
        }
        tracing::info!(groups = snapshot.groups.len(), "configuration restored");
        Ok(server)
    }
}

fn check_unique_handles(snapshot: &ServerSnapshot) -> OpcResult<()> {
    let mut groups = HashSet::new();
    let mut items = HashSet::new();
    for group in &snapshot.groups {
        if group.server_handle.0 == 0 || !groups.insert(group.server_handle) {
            return Err(OpcError::InvalidArgument(format!(
                "duplicate group handle {}",
                group.server_handle.0
            )));
        }
        for item in &group.items {
            if item.server_handle.0 == 0 || !items.insert(item.server_handle) {
                return Err(OpcError::InvalidArgument(format!(
                    "duplicate item handle {}",
                    item.server_handle.0
                )));
            }
        }
    }
    Ok(())
}
