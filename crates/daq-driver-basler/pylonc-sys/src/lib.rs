//! Raw FFI bindings for the Basler pylon C SDK, generated by bindgen.
//!
//! Build with the `pylon-sdk` feature and `PYLON_ROOT` set to the pylon
//! installation. Without the feature this crate is empty.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]
#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

/// Success value of every `GENAPIC_RESULT` returning function.
#[cfg(feature = "pylon-sdk")]
pub const GENAPI_E_OK: GENAPIC_RESULT = 0;
