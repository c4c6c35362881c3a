//! Data source over one output of a database view

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value as JsonValue;

use beat_data_core::{Casting, DataFormat, DataIndex, Error, IoStatistics, Record, Result};

use crate::data_source::{Block, DataRecord, DataSource, Interval};

/// What a view returns for one output at one index
#[derive(Debug)]
pub enum ViewOutput {
    /// Attribute dictionary, converted through the output's data format
    Dict(JsonValue),
    /// Ready-made record
    Record(Box<dyn Record>),
}

/// A database view, implemented by user code
///
/// Failures are reported as [`anyhow::Error`] and surface as
/// [`Error::User`].
#[cfg_attr(test, mockall::automock)]
pub trait View: Send + Sync {
    /// All objects of the view, in data index order
    fn objects(&self) -> anyhow::Result<Vec<JsonValue>>;

    /// Name of the object attribute an output is computed from
    fn output_mapping(&self, output: &str) -> Option<String>;

    /// Value of `output` for the object at `index`
    fn get(&self, output: &str, index: DataIndex) -> anyhow::Result<ViewOutput>;
}

/// Options for [`DatabaseOutputDataSource::setup`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DatabaseSourceOptions {
    /// Skip records starting before this index
    pub start_index: Option<DataIndex>,
    /// Skip records ending after this index
    pub end_index: Option<DataIndex>,
    /// Return packed payloads instead of records
    pub pack: bool,
}

/// Source returning the values of one view output
///
/// Consecutive objects sharing the output's attribute value form one record.
pub struct DatabaseOutputDataSource {
    view: Arc<dyn View>,
    output_name: String,
    format: Arc<DataFormat>,
    pack: bool,
    infos: Vec<Interval>,
    stats: IoStatistics,
}

impl fmt::Debug for DatabaseOutputDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseOutputDataSource")
            .field("output_name", &self.output_name)
            .field("format", &self.format.name())
            .field("pack", &self.pack)
            .field("infos", &self.infos.len())
            .finish_non_exhaustive()
    }
}

/// Group consecutive equal values into inclusive runs
fn runs<T: PartialEq>(values: &[T]) -> Vec<Interval> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=values.len() {
        if i == values.len() || values[i] != values[start] {
            runs.push((start as DataIndex, i as DataIndex - 1));
            start = i;
        }
    }
    runs
}

impl DatabaseOutputDataSource {
    /// Index the objects of `view` for `output_name`
    pub fn setup(
        view: Arc<dyn View>,
        output_name: &str,
        format: Arc<DataFormat>,
        options: DatabaseSourceOptions,
    ) -> Result<Self> {
        let attribute = view.output_mapping(output_name).ok_or_else(|| {
            Error::NotFound(format!("view has no output named `{output_name}'"))
        })?;
        let objects = view.objects().map_err(Error::User)?;

        let values = objects
            .iter()
            .map(|object| {
                object.get(&attribute).ok_or_else(|| {
                    Error::NotFound(format!("view object has no attribute `{attribute}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let infos: Vec<Interval> = runs(&values)
            .into_iter()
            .filter(|&(start, end)| {
                options.start_index.map_or(true, |s| start >= s)
                    && options.end_index.map_or(true, |e| end <= e)
            })
            .collect();

        tracing::debug!(
            target: "beat::database",
            output = output_name,
            attribute = %attribute,
            objects = objects.len(),
            records = infos.len(),
            "indexed view output"
        );

        Ok(Self {
            view,
            output_name: output_name.to_owned(),
            format,
            pack: options.pack,
            infos,
            stats: IoStatistics::default(),
        })
    }

    /// Name of the view output
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// Data format of the output's records
    pub fn format(&self) -> &Arc<DataFormat> {
        &self.format
    }
}

impl DataSource for DatabaseOutputDataSource {
    fn intervals(&mut self) -> Result<&[Interval]> {
        Ok(&self.infos)
    }

    fn get(&mut self, index: i64) -> Result<Option<Block>> {
        let Some(&(start, end)) = usize::try_from(index).ok().and_then(|i| self.infos.get(i)) else {
            return Ok(None);
        };

        let started = Instant::now();
        let output = self
            .view
            .get(&self.output_name, start)
            .map_err(|e| Error::User(e.context(format!("cannot get `{}' at {start}", self.output_name))))?;
        let record: Box<dyn Record> = match output {
            ViewOutput::Dict(data) => {
                let mut record = self.format.new_record();
                record.from_dict(&data, Casting::Safe, false)?;
                Box::new(record)
            }
            ViewOutput::Record(record) => record,
        };

        let data = if self.pack {
            let packed = record.pack()?;
            self.stats.record(packed.len(), started.elapsed());
            DataRecord::Packed(packed)
        } else {
            self.stats.record(0, started.elapsed());
            DataRecord::Unpacked(record)
        };
        Ok(Some((data, start, end)))
    }

    fn close(&mut self) {
        self.infos.clear();
    }

    fn statistics(&self) -> IoStatistics {
        self.stats
    }
}
