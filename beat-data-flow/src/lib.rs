//! Synchronized inputs, data loaders and outputs of BEAT algorithms
//!
//! Sequential algorithms see their main channel as an [`InputGroup`] stepped
//! by the runtime; autonomous algorithms pull records from [`DataLoader`]s.
//! Results are written through [`Output`]s following the main group.

#![warn(missing_docs)]

pub mod config;
pub mod input;
pub mod loader;
pub mod output;

#[cfg(test)]
mod testing;

pub use config::{AlgorithmKind, ExecutionConfig, FlowBuilder, InputConfig, OutputConfig};
pub use input::{Input, InputGroup, InputList};
pub use loader::{mix_data_indices, DataLoader, DataLoaderList, DataView, LoaderData};
pub use output::{Output, OutputList, SynchronizationListener};

// Re-export core types
pub use beat_data_core::{DataIndex, Error, ErrorKind, Result};

static_assertions::assert_impl_all!(DataLoader: Send);
static_assertions::assert_not_impl_any!(SynchronizationListener: Send, Sync);
