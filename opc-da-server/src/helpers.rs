//! Display helpers for values, qualities and timestamps.

use crate::opc_da::errors::ItemError;
use crate::opc_da::quality::{Quality, QualityStatus};
use crate::opc_da::value::{VarType, Variant};
use chrono::{DateTime, Utc};

/// Convert a [`Variant`] to a displayable string.
///
/// Floats get two decimals, strings are quoted and arrays show their
/// length.
///
/// # Examples
/// ```
/// use opc_da_server::{Variant, value_to_string};
///
/// assert_eq!(value_to_string(&Variant::R8(1.0 / 3.0)), "0.33");
/// assert_eq!(value_to_string(&Variant::from("on")), "\"on\"");
/// assert_eq!(value_to_string(&Variant::Empty), "Empty");
/// ```
pub fn value_to_string(value: &Variant) -> String {
    match value {
        Variant::Empty => "Empty".to_string(),
        Variant::R4(v) => format!("{v:.2}"),
        Variant::R8(v) => format!("{v:.2}"),
        Variant::Str(s) => format!("\"{s}\""),
        Variant::Date(d) => timestamp_to_string(*d),
        Variant::Array(items) => format!("Array[{}] ({:?})", items.len(), value.var_type()),
        other => other.to_string(),
    }
}

/// Map an OPC quality word to a human-readable label.
pub fn quality_to_string(quality: Quality) -> String {
    let label = match quality.status() {
        QualityStatus::Good => "Good",
        QualityStatus::Uncertain => "Uncertain",
        QualityStatus::Bad => "Bad",
        QualityStatus::Unknown => return format!("Unknown(0x{:04X})", quality.0),
    };
    let detail = match quality {
        Quality::BAD_CONFIG_ERROR => Some("config error"),
        Quality::BAD_NOT_CONNECTED => Some("not connected"),
        Quality::BAD_DEVICE_FAILURE => Some("device failure"),
        Quality::BAD_COMM_FAILURE => Some("comm failure"),
        Quality::BAD_OUT_OF_SERVICE => Some("out of service"),
        Quality::BAD_WAITING_FOR_INITIAL_DATA => Some("waiting for initial data"),
        Quality::GOOD_LOCAL_OVERRIDE => Some("local override"),
        Quality::UNCERTAIN_LAST_USABLE => Some("last usable value"),
        _ => None,
    };
    match detail {
        Some(detail) => format!("{label} ({detail})"),
        None => label.to_string(),
    }
}

/// Convert a UTC timestamp to a local time string.
pub fn timestamp_to_string(timestamp: DateTime<Utc>) -> String {
    if timestamp == DateTime::<Utc>::UNIX_EPOCH {
        return "N/A".to_string();
    }
    timestamp
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Parse user input into a value of the given type.
///
/// # Errors
/// [`ItemError::BadType`] when the text cannot be read as that type and
/// [`ItemError::RangeError`] when it does not fit.
pub fn parse_value(input: &str, target: &VarType) -> Result<Variant, ItemError> {
    Variant::from(input).coerce(target)
}
