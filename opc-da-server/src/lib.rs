//! # opc-da-server
//!
//! Platform-neutral OPC DA subscription engine.
//!
//! Clients organise items into groups; each group is scanned at its own
//! update rate and reports deadband-filtered changes as one batched
//! [`DataChange`] per scan. Synchronous and asynchronous read, write,
//! refresh and cancel operations work against a shared value cache that a
//! [`Device`] keeps up to date.
//!
//! ## Features
//! - `test-support`: Enables `MockDevice` and `MockAddressSpace` via `mockall`

mod cache;
mod config;
mod device;
mod gateway;
mod group;
mod helpers;
mod io_worker;
mod namespace;
pub mod opc_da;
mod persistence;
mod scheduler;
mod server;

// Stable public API
pub use cache::{DataCache, TagSlot};
pub use config::ServerConfig;
pub use device::{Device, DevicePoller, SimulatedDevice};
pub use group::Group;
pub use helpers::{parse_value, quality_to_string, timestamp_to_string, value_to_string};
pub use namespace::{AddressSpace, NamespaceDirectory, PATH_SEPARATOR, StaticAddressSpace, TagDef};
pub use opc_da::callback::{
    CancelComplete, Completion, DataChange, GroupSubscription, PERIODIC_TRANSACTION,
    ReadComplete, WriteComplete,
};
pub use opc_da::errors::{
    ItemError, OpcError, OpcResult, format_code, friendly_code_hint, friendly_error_hint,
};
pub use opc_da::quality::{Quality, QualityStatus};
pub use opc_da::typedefs::{
    AccessRights, AsyncRequest, BrowseFilter, BrowseType, CancelId, DataSource, GroupDef,
    GroupHandle, GroupState, GroupStateUpdate, ItemAttributes, ItemDef, ItemHandle, ItemOutcome,
    ItemRead, ItemResult, ItemState, NamespaceType, ServerState, ServerStatus, TagInfo,
};
pub use opc_da::value::{VT_ARRAY, VarType, Variant, Vqt};
pub use server::Server;

// Test support re-export
#[cfg(feature = "test-support")]
pub use device::MockDevice;
#[cfg(feature = "test-support")]
pub use namespace::MockAddressSpace;
