//! Cache shards, data sources and sinks for BEAT data exchange
//!
//! Records reach an algorithm from cache shards on disk, from the outputs of
//! a database view, or from a view server over a message channel. Results
//! leave through sinks writing new shards.

#![warn(missing_docs)]

mod data_source;

pub mod cached;
pub mod database;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod shard;
pub mod sink;

pub use cached::{CachedDataSource, CachedSourceOptions};
pub use data_source::{Block, DataRecord, DataSource, Interval};
pub use database::{DatabaseOutputDataSource, DatabaseSourceOptions, View, ViewOutput};
pub use protocol::{CodecOptions, FramedChannel, MessageChannel, MultipartCodec, ReadTimeout};
pub use remote::RemoteDataSource;
pub use server::MessageHandler;
pub use shard::Encoding;
pub use sink::{CachedDataSink, DataSink, StdoutDataSink};

// Re-export core types
pub use beat_data_core::{DataIndex, Error, ErrorKind, Result};

static_assertions::assert_impl_all!(CachedDataSource: DataSource, Send);
static_assertions::assert_impl_all!(RemoteDataSource: DataSource, Send);
static_assertions::assert_impl_all!(CachedDataSink: DataSink, Send);
static_assertions::assert_obj_safe!(DataSource, DataSink, MessageChannel);
