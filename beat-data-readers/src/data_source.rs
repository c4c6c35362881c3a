//! Random access to sequences of records carrying data indices
//!
//! Every source is a list of records, each covering an inclusive interval of
//! data indices. Records are addressed by position with [`DataSource::get`]
//! or by data index with [`DataSource::get_at_index`].

use std::fmt;

use beat_data_core::{DataIndex, IoStatistics, Record, Result};

/// Inclusive `(start, end)` interval of data indices
pub type Interval = (DataIndex, DataIndex);

/// A record together with the interval it covers
pub type Block = (DataRecord, DataIndex, DataIndex);

/// A record as delivered by a source
#[derive(Debug, Clone)]
pub enum DataRecord {
    /// Decoded record
    Unpacked(Box<dyn Record>),
    /// Raw payload, as stored or transmitted
    Packed(Vec<u8>),
}

impl DataRecord {
    /// The decoded record, if this is one
    pub fn as_record(&self) -> Option<&dyn Record> {
        match self {
            DataRecord::Unpacked(record) => Some(record.as_ref()),
            DataRecord::Packed(_) => None,
        }
    }

    /// Binary form, packing the record if needed
    pub fn to_packed(&self) -> Result<Vec<u8>> {
        match self {
            DataRecord::Unpacked(record) => record.pack(),
            DataRecord::Packed(bytes) => Ok(bytes.clone()),
        }
    }
}

impl From<Box<dyn Record>> for DataRecord {
    fn from(record: Box<dyn Record>) -> Self {
        DataRecord::Unpacked(record)
    }
}

/// Base trait for all data sources
///
/// Metadata is prepared lazily: the first call needing it may fail with the
/// error of the preparation.
pub trait DataSource: Send + fmt::Debug {
    /// Intervals of all records, in order
    fn intervals(&mut self) -> Result<&[Interval]>;

    /// Record at `index`, or `None` outside `0..len`
    fn get(&mut self, index: i64) -> Result<Option<Block>>;

    /// Drop cached handles, keeping the metadata
    fn reset(&mut self) {}

    /// Release all resources
    fn close(&mut self);

    /// Bytes read and time spent reading so far
    fn statistics(&self) -> IoStatistics;

    /// Number of records
    fn len(&mut self) -> Result<usize> {
        Ok(self.intervals()?.len())
    }

    /// Whether the source holds no record
    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Start index of the first record
    fn first_data_index(&mut self) -> Result<Option<DataIndex>> {
        Ok(self.intervals()?.first().map(|i| i.0))
    }

    /// End index of the last record
    fn last_data_index(&mut self) -> Result<Option<DataIndex>> {
        Ok(self.intervals()?.last().map(|i| i.1))
    }

    /// Owned copy of the intervals
    fn data_indices(&mut self) -> Result<Vec<Interval>> {
        Ok(self.intervals()?.to_vec())
    }

    /// Record whose interval contains `data_index`
    fn get_at_index(&mut self, data_index: DataIndex) -> Result<Option<Block>> {
        let position = self
            .intervals()?
            .iter()
            .position(|&(start, end)| start <= data_index && data_index <= end);
        match position {
            Some(position) => self.get(position as i64),
            None => Ok(None),
        }
    }
}
