//! OPC DA protocol vocabulary.
//!
//! Handles, values, qualities, error codes and delivery types shared by the
//! engine and any binding layer built on top of it.

#![allow(clippy::module_name_repetitions, clippy::unreadable_literal)]

pub mod callback;
pub mod errors;
pub mod quality;
pub mod typedefs;
pub mod value;
