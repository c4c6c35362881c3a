//! Fixtures shared by the unit tests

use std::sync::{Arc, Mutex};

use serde_json::json;

use beat_data_core::dataformat::format_from_declaration;
use beat_data_core::{DataFormat, DataIndex, DynamicRecord, IoStatistics, Record, Result};
use beat_data_readers::{Block, DataRecord, DataSink, DataSource, Interval};

pub(crate) const SINGLE_INTEGER: &str = "user/single_integer/1";

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub(crate) fn format() -> Arc<DataFormat> {
    Arc::new(format_from_declaration(SINGLE_INTEGER, &json!({"value": "int32"})).unwrap())
}

pub(crate) fn record(value: i64) -> DynamicRecord {
    DynamicRecord::from_json(format(), &json!({ "value": value })).unwrap()
}

pub(crate) fn value(data: &DataRecord) -> i64 {
    data.as_record().unwrap().as_dict()["value"].as_i64().unwrap()
}

/// In-memory source whose records hold `base + start`
#[derive(Debug)]
pub(crate) struct MemorySource {
    intervals: Vec<Interval>,
    base: i64,
}

impl MemorySource {
    pub(crate) fn new(intervals: &[Interval], base: i64) -> Self {
        Self {
            intervals: intervals.to_vec(),
            base,
        }
    }

    pub(crate) fn units(count: i64, base: i64) -> Self {
        let intervals: Vec<Interval> = (0..count).map(|i| (i, i)).collect();
        Self::new(&intervals, base)
    }
}

impl DataSource for MemorySource {
    fn intervals(&mut self) -> Result<&[Interval]> {
        Ok(&self.intervals)
    }

    fn get(&mut self, index: i64) -> Result<Option<Block>> {
        let found = usize::try_from(index).ok().and_then(|i| self.intervals.get(i));
        Ok(found.map(|&(s, e)| {
            let data: Box<dyn Record> = Box::new(record(self.base + s));
            (DataRecord::from(data), s, e)
        }))
    }

    fn close(&mut self) {}

    fn statistics(&self) -> IoStatistics {
        IoStatistics::default()
    }
}

/// Rows written to a [`RecordingSink`]: value, start, end
pub(crate) type Rows = Arc<Mutex<Vec<(i64, DataIndex, DataIndex)>>>;

/// Sink keeping the value and interval of every write
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub(crate) rows: Rows,
}

impl DataSink for RecordingSink {
    fn write(&mut self, data: &dyn Record, start: DataIndex, end: DataIndex) -> Result<()> {
        let value = data.as_dict()["value"].as_i64().unwrap_or_default();
        self.rows.lock().unwrap().push((value, start, end));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}
