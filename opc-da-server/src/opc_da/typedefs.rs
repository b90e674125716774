use super::errors::ItemError;
use super::quality::Quality;
use super::value::{VarType, Variant, Vqt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque handle for an OPC group.
///
/// Used for both the server-assigned and the client-assigned group handle,
/// preventing accidental mixing with item handles.
///
/// # Examples
///
/// ```
/// use opc_da_server::GroupHandle;
/// let handle = GroupHandle(123u32);
/// assert_eq!(handle.0, 123u32);
/// ```
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GroupHandle(pub u32);

/// Opaque handle for an OPC item.
///
/// Similar to [`GroupHandle`], this ensures type-safe identification of
/// items within a group.
///
/// # Examples
///
/// ```
/// use opc_da_server::ItemHandle;
/// let handle = ItemHandle(456u32);
/// assert_eq!(handle.0, 456u32);
/// ```
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ItemHandle(pub u32);

/// Server-assigned identifier of one asynchronous operation, used to cancel it.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CancelId(pub u32);

/// Where a read takes its values from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// The server's cache, as last updated by the device poller.
    Cache,
    /// The device itself; the cache is updated with the result.
    Device,
}

/// Access rights of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessRights {
    Read,
    Write,
    ReadWrite,
}

impl AccessRights {
    pub const fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub const fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    /// `OPC_READABLE` / `OPC_WRITEABLE` bit mask.
    pub const fn mask(self) -> u32 {
        match self {
            Self::Read => 1,
            Self::Write => 2,
            Self::ReadWrite => 3,
        }
    }
}

/// Static metadata returned by namespace validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub canonical_type: VarType,
    pub access_rights: AccessRights,
}

/// Operational state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Failed,
    NoConfig,
    Suspended,
    Test,
    CommunicationFault,
}

/// Operational status and metadata of the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    /// Time when the server was started.
    pub start_time: DateTime<Utc>,
    /// Current time according to the server.
    pub current_time: DateTime<Utc>,
    /// Time of the last delivery to any client, or the start time.
    pub last_update_time: DateTime<Utc>,
    pub server_state: ServerState,
    /// Number of groups currently managed by the server.
    pub group_count: u32,
    /// Asynchronous I/O queue utilisation in percent.
    pub band_width: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub build_number: u16,
    pub vendor_info: String,
}

/// Parameters of a new group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDef {
    /// Unique name; generated by the server when `None`.
    pub name: Option<String>,
    pub active: bool,
    /// Requested update rate in milliseconds (0 = fastest supported).
    pub update_rate: u32,
    pub client_handle: GroupHandle,
    /// Time zone bias in minutes from UTC.
    pub time_bias: i32,
    /// Percent change of the EU range required to report an analog item.
    pub percent_deadband: f32,
    pub locale_id: u32,
}

impl Default for GroupDef {
    fn default() -> Self {
        Self {
            name: None,
            active: true,
            update_rate: 1000,
            client_handle: GroupHandle::default(),
            time_bias: 0,
            percent_deadband: 0.0,
            locale_id: 0,
        }
    }
}

/// Current state and properties of a group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupState {
    /// Revised update rate in milliseconds; the scan period.
    pub update_rate: u32,
    /// Update rate the client asked for.
    pub requested_update_rate: u32,
    pub active: bool,
    pub name: String,
    pub time_bias: i32,
    pub percent_deadband: f32,
    pub locale_id: u32,
    pub client_handle: GroupHandle,
    pub server_handle: GroupHandle,
}

/// Partial group state update. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupStateUpdate {
    pub update_rate: Option<u32>,
    pub active: Option<bool>,
    pub time_bias: Option<i32>,
    pub percent_deadband: Option<f32>,
    pub locale_id: Option<u32>,
    pub client_handle: Option<GroupHandle>,
}

/// Definition required to add a new item to a group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemDef {
    /// Optional access path for the item (server-specific).
    pub access_path: Option<String>,
    /// The identifier of the tag within the server namespace.
    pub item_id: String,
    /// Whether the item should be added in an active state.
    pub active: bool,
    /// Handle assigned by the client for this item.
    pub client_handle: ItemHandle,
    /// Requested data type; `None` delivers the canonical type.
    pub requested_type: Option<VarType>,
}

impl ItemDef {
    /// Active item with no access path and canonical delivery type.
    pub fn new(item_id: impl Into<String>, client_handle: ItemHandle) -> Self {
        Self {
            access_path: None,
            item_id: item_id.into(),
            active: true,
            client_handle,
            requested_type: None,
        }
    }
}

/// Server-assigned properties of an item that was added successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    pub server_handle: ItemHandle,
    pub canonical_type: VarType,
    pub access_rights: AccessRights,
}

/// Attributes of an item as reported by item enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemAttributes {
    pub access_path: Option<String>,
    pub item_id: String,
    pub active: bool,
    pub client_handle: ItemHandle,
    pub server_handle: ItemHandle,
    pub access_rights: AccessRights,
    pub requested_type: Option<VarType>,
    pub canonical_type: VarType,
    /// Engineering-unit range `(low, high)`; present for analog items.
    pub eu_range: Option<(f64, f64)>,
}

/// One item's entry in a delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemState {
    pub client_handle: ItemHandle,
    pub value: Variant,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
    /// Per-item error; the value is [`Variant::Empty`] when set.
    pub error: Option<ItemError>,
}

impl ItemState {
    pub(crate) fn from_vqt(client_handle: ItemHandle, vqt: Vqt) -> Self {
        Self {
            client_handle,
            value: vqt.value,
            quality: vqt.quality,
            timestamp: vqt.timestamp,
            error: None,
        }
    }

    pub(crate) fn failed(client_handle: ItemHandle, error: ItemError) -> Self {
        Self {
            client_handle,
            value: Variant::Empty,
            quality: Quality::BAD,
            timestamp: Utc::now(),
            error: Some(error),
        }
    }
}

/// Per-item outcome of a synchronous read, aligned with the input handles.
pub type ItemRead = Result<Vqt, ItemError>;

/// Per-item outcome of a write or a metadata change.
pub type ItemOutcome = Result<(), ItemError>;

/// Immediate answer to an asynchronous read or write.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncRequest {
    /// Identifier to pass to `cancel`. Meaningless when no item was accepted.
    pub cancel_id: CancelId,
    /// Handle validation outcome per item; only accepted items complete later.
    pub errors: Vec<ItemOutcome>,
}

/// Element kinds requested from a browse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseType {
    /// Sub-branches of the position.
    Branch,
    /// Items directly under the position.
    Leaf,
    /// Every item under the position, at any depth.
    Flat,
}

/// Shape of the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceType {
    Flat,
    Hierarchical,
}

/// Browse filter applied by the namespace directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseFilter {
    pub browse_type: BrowseType,
    /// Glob matched against the element's last path segment; empty matches all.
    pub name_pattern: String,
    pub data_type: Option<VarType>,
    pub access_rights: Option<AccessRights>,
}

impl BrowseFilter {
    pub fn new(browse_type: BrowseType) -> Self {
        Self {
            browse_type,
            name_pattern: String::new(),
            data_type: None,
            access_rights: None,
        }
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = pattern.into();
        self
    }
}
