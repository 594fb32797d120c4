//! # CANopen Common Library
//!
//! Shared CANopen protocol primitives used by the SDO client engine.
//!
//! This library provides:
//! - SDO (Service Data Object) frame layout: command specifiers, multiplexer,
//!   expedited/segment headers and abort frames
//! - The CiA 301 abort code catalogue with descriptions
//! - Conversion between SDO frames and socketcan frames

pub mod sdo;

// Re-export commonly used types for convenience
pub use sdo::{
    ClientCommand, ServerCommand, SdoAbortCode, SdoError, SdoFrame,
    describe_abort_code, request_cob_id, response_cob_id,
};
