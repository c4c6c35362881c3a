//! Core types for BEAT data exchange
//!
//! This crate holds what every other part of the data exchange layer builds
//! upon: the error taxonomy, content hashes and the cache path layout, data
//! formats and the records conforming to them, and small file utilities.

#![warn(missing_docs)]

pub mod algorithm;
pub mod dataformat;
pub mod error;
pub mod hash;
pub mod io;
pub mod json;
pub mod record;
pub mod stats;
pub mod utils;

// Re-export key types for convenience
pub use algorithm::AlgorithmDeclaration;
pub use dataformat::{DataFormat, DataFormatCache, DataType, Field, ScalarType};
pub use error::{Error, ErrorKind, Result};
pub use record::{Casting, DynamicRecord, Record, Value};
pub use stats::IoStatistics;

/// Index of a record on a channel timeline
///
/// Cursors use `-1` for "nothing read yet".
pub type DataIndex = i64;
