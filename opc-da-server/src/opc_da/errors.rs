use thiserror::Error;

/// Result type alias for whole-call OPC DA operations.
pub type OpcResult<T> = Result<T, OpcError>;

pub const OPC_E_INVALIDHANDLE: u32 = 0xC004_0001;
pub const OPC_E_BADTYPE: u32 = 0xC004_0004;
pub const OPC_E_BADRIGHTS: u32 = 0xC004_0006;
pub const OPC_E_UNKNOWNITEMID: u32 = 0xC004_0007;
pub const OPC_E_INVALIDITEMID: u32 = 0xC004_0008;
pub const OPC_E_INVALIDFILTER: u32 = 0xC004_0009;
pub const OPC_E_UNKNOWNPATH: u32 = 0xC004_000A;
pub const OPC_E_RANGE: u32 = 0xC004_000B;
pub const OPC_E_DUPLICATENAME: u32 = 0xC004_000C;
pub const OPC_S_INUSE: u32 = 0x0004_000F;
pub const E_FAIL: u32 = 0x8000_4005;
pub const E_OUTOFMEMORY: u32 = 0x8007_000E;
pub const E_INVALIDARG: u32 = 0x8007_0057;
pub const E_UNEXPECTED: u32 = 0x8000_FFFF;
pub const CONNECT_E_ADVISELIMIT: u32 = 0x8004_0201;

/// Per-item outcome code.
///
/// Item errors are always carried inline in the per-item result array and
/// never abort sibling items of the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ItemError {
    /// The server handle does not name an item of this group, or a client
    /// handle was repeated within one call.
    #[error("invalid handle")]
    InvalidHandle,

    /// The item ID is syntactically invalid.
    #[error("item ID syntax is invalid")]
    InvalidItemId,

    /// The item ID is not present in the address space.
    #[error("item ID not found in server address space")]
    UnknownItemId,

    /// The access path is not offered for this item.
    #[error("access path is not known to the server")]
    UnknownPath,

    /// The item's access rights forbid the operation.
    #[error("access denied")]
    AccessDenied,

    /// The value does not fit the target data type.
    #[error("value out of range for the target type")]
    RangeError,

    /// The value cannot be converted to the target data type.
    #[error("data type cannot be converted")]
    BadType,

    /// The underlying device could not be reached.
    #[error("device communication failure")]
    CommunicationFailure,

    /// The server or group is at capacity.
    #[error("server busy")]
    Busy,

    /// A uniquely named object already exists.
    #[error("duplicate name")]
    AlreadyExists,
}

impl ItemError {
    /// The classic HRESULT a binding layer reports for this error.
    pub const fn code(self) -> u32 {
        match self {
            Self::InvalidHandle => OPC_E_INVALIDHANDLE,
            Self::InvalidItemId => OPC_E_INVALIDITEMID,
            Self::UnknownItemId => OPC_E_UNKNOWNITEMID,
            Self::UnknownPath => OPC_E_UNKNOWNPATH,
            Self::AccessDenied => OPC_E_BADRIGHTS,
            Self::RangeError => OPC_E_RANGE,
            Self::BadType => OPC_E_BADTYPE,
            Self::CommunicationFailure => E_FAIL,
            Self::Busy => E_OUTOFMEMORY,
            Self::AlreadyExists => OPC_E_DUPLICATENAME,
        }
    }
}

/// Whole-call error.
///
/// Returned when a request is rejected as a whole; no per-item results are
/// produced in that case.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OpcError {
    /// The group handle is unknown or the group has been removed.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// The request itself is malformed (empty or misaligned arrays, bad filter, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is refused in the object's current state (e.g. items still active).
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A group with the requested name already exists.
    #[error("Duplicate name: {0}")]
    AlreadyExists(String),

    /// The server is at capacity.
    #[error("Server busy: {0}")]
    Busy(String),

    /// Operation attempted in an invalid state (e.g. refresh on an inactive group).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Saved configuration could not be encoded or decoded.
    #[error("Serialization failed: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Catch-all for corrupted internal state. Always fails closed.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OpcError {
    /// The classic HRESULT a binding layer reports for this error.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidHandle(_) => OPC_E_INVALIDHANDLE,
            Self::InvalidArgument(_) => E_INVALIDARG,
            Self::AccessDenied(_) => OPC_S_INUSE,
            Self::AlreadyExists(_) => OPC_E_DUPLICATENAME,
            Self::Busy(_) => E_OUTOFMEMORY,
            Self::InvalidState(_) => E_FAIL,
            Self::Serialization { .. } => E_INVALIDARG,
            Self::Internal(_) => E_UNEXPECTED,
        }
    }
}

impl From<tokio::task::JoinError> for OpcError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Async task join failed: {err}"))
    }
}

impl From<std::num::TryFromIntError> for OpcError {
    fn from(err: std::num::TryFromIntError) -> Self {
        Self::InvalidArgument(format!("Integer conversion error: {err}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for OpcError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        tracing::error!("internal lock poisoned, rejecting call");
        Self::Internal("internal lock poisoned".into())
    }
}

/// Helper to format an HRESULT with friendly hints.
pub fn format_code(code: u32) -> String {
    let hex = format!("0x{code:08X}");
    match friendly_code_hint(code) {
        Some(hint) => format!("{hex}: {hint}"),
        None => hex,
    }
}

/// Maps known OPC error codes to actionable hints.
pub fn friendly_code_hint(code: u32) -> Option<&'static str> {
    match code {
        OPC_E_INVALIDHANDLE => Some("Handle is not valid for this group or server"),
        OPC_E_BADTYPE => Some("Data type mismatch: the value cannot be converted (OPC_E_BADTYPE)"),
        OPC_E_BADRIGHTS => Some("Item access rights forbid this operation (OPC_E_BADRIGHTS)"),
        OPC_E_UNKNOWNITEMID => Some("Item ID not found in server address space (OPC_E_UNKNOWNITEMID)"),
        OPC_E_INVALIDITEMID => Some("Item ID syntax is invalid for this server (OPC_E_INVALIDITEMID)"),
        OPC_E_INVALIDFILTER => Some("Browse filter is not a valid pattern"),
        OPC_E_UNKNOWNPATH => Some("Access path is not known for this item (OPC_E_UNKNOWNPATH)"),
        OPC_E_RANGE => Some("Value is out of range for the item's data type (OPC_E_RANGE)"),
        OPC_E_DUPLICATENAME => Some("A group with this name already exists"),
        OPC_S_INUSE => Some("Object still in use: remove or deactivate items first, or force"),
        E_FAIL => Some("Operation failed: check the server log"),
        E_OUTOFMEMORY => Some("Server is at capacity: retry later"),
        E_INVALIDARG => Some("Request arguments are malformed"),
        CONNECT_E_ADVISELIMIT => Some("Group already has a callback connection"),
        _ => None,
    }
}

/// Maps an [`OpcError`] to a friendly hint.
pub fn friendly_error_hint(error: &OpcError) -> Option<&'static str> {
    friendly_code_hint(error.code())
}
