//! Outputs writing results in step with an input group

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use beat_data_core::{DataIndex, Error, IoStatistics, Record, Result};
use beat_data_readers::{DataSink, Interval};

/// Current interval of an input group, as seen by the outputs bound to it
///
/// Clones share the same interval. Before the first tick it is `(-1, -1)`.
#[derive(Debug, Clone)]
pub struct SynchronizationListener {
    interval: Rc<Cell<Interval>>,
    origin: Rc<Cell<DataIndex>>,
}

impl Default for SynchronizationListener {
    fn default() -> Self {
        Self {
            interval: Rc::new(Cell::new((-1, -1))),
            origin: Rc::new(Cell::new(-1)),
        }
    }
}

impl SynchronizationListener {
    /// Create a listener with no interval yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the group's new interval
    pub fn set(&self, start: DataIndex, end: DataIndex) {
        if self.origin.get() < 0 {
            self.origin.set(start);
        }
        self.interval.set((start, end));
    }

    /// Last interval reported
    pub fn interval(&self) -> Interval {
        self.interval.get()
    }

    /// Start of the last interval reported
    pub fn data_index_start(&self) -> DataIndex {
        self.interval.get().0
    }

    /// End of the last interval reported
    pub fn data_index_end(&self) -> DataIndex {
        self.interval.get().1
    }

    /// Start of the first interval reported, `-1` before the first tick
    pub fn origin(&self) -> DataIndex {
        self.origin.get()
    }
}

/// Writer of one algorithm output
///
/// Each write covers the indices following the previous write, up to the
/// given end or, by default, the end of the group's current interval.
pub struct Output {
    name: String,
    sink: Box<dyn DataSink>,
    listener: Option<SynchronizationListener>,
    last_written_data_index: DataIndex,
    nb_blocks_written: u64,
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.name)
            .field("listener", &self.listener)
            .field("last_written_data_index", &self.last_written_data_index)
            .field("nb_blocks_written", &self.nb_blocks_written)
            .finish_non_exhaustive()
    }
}

impl Output {
    /// Create an output
    ///
    /// The first write starts where the group started, or at
    /// `force_start_index` while the group has not ticked or without listener.
    pub fn new(
        name: &str,
        sink: Box<dyn DataSink>,
        listener: Option<SynchronizationListener>,
        force_start_index: DataIndex,
    ) -> Self {
        Self {
            name: name.to_owned(),
            sink,
            listener,
            last_written_data_index: force_start_index - 1,
            nb_blocks_written: 0,
        }
    }

    /// Output name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// End index of the last write
    pub fn last_written_data_index(&self) -> DataIndex {
        self.last_written_data_index
    }

    /// Number of successful writes
    pub fn nb_blocks_written(&self) -> u64 {
        self.nb_blocks_written
    }

    /// Whether the sink accepts writes
    pub fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }

    /// Writing statistics of the sink
    pub fn statistics(&self) -> IoStatistics {
        self.sink.statistics()
    }

    /// Whether the current interval of the group is not fully written yet
    pub fn is_data_missing(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|l| self.last_written_data_index < l.data_index_end())
    }

    /// Write `data` up to `end`, defaulting to the end of the current interval
    ///
    /// Nothing reaches the sink when the range is invalid.
    pub fn write(&mut self, data: &dyn Record, end: Option<DataIndex>) -> Result<()> {
        let current_end = self.listener.as_ref().map(SynchronizationListener::data_index_end);
        let end = match (end, current_end) {
            (Some(end), Some(current_end)) if end > current_end => {
                return Err(Error::OutOfRange(format!(
                    "output `{}': end index {end} lies after the current interval end {current_end}",
                    self.name
                )));
            }
            (Some(end), _) | (None, Some(end)) => end,
            (None, None) => {
                return Err(Error::InvalidArgument(format!(
                    "output `{}' is not synchronized, an end index is required",
                    self.name
                )));
            }
        };

        let start = match &self.listener {
            Some(listener) if self.nb_blocks_written == 0 && listener.origin() >= 0 => listener.origin(),
            _ => self.last_written_data_index + 1,
        };
        if end < start {
            return Err(Error::OutOfRange(format!(
                "output `{}': end index {end} lies before the next start index {start}",
                self.name
            )));
        }

        self.sink.write(data, start, end)?;
        self.last_written_data_index = end;
        self.nb_blocks_written += 1;

        tracing::trace!(target: "beat::output", output = %self.name, start, end, "block written");
        Ok(())
    }

    /// Finish writing
    pub fn close(&mut self) -> Result<()> {
        self.sink.close()
    }
}

/// The outputs of an algorithm
#[derive(Debug, Default)]
pub struct OutputList {
    outputs: Vec<Output>,
}

impl OutputList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an output
    pub fn add(&mut self, output: Output) {
        self.outputs.push(output);
    }

    /// Number of outputs
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Whether no output was added
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Output by name
    pub fn get(&self, name: &str) -> Option<&Output> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Mutable output by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Output> {
        self.outputs.iter_mut().find(|o| o.name == name)
    }

    /// Output by position
    pub fn at(&self, index: usize) -> Option<&Output> {
        self.outputs.get(index)
    }

    /// Mutable output by position
    pub fn at_mut(&mut self, index: usize) -> Option<&mut Output> {
        self.outputs.get_mut(index)
    }

    /// All outputs, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Output> {
        self.outputs.iter()
    }

    /// Whether any output lags behind its group
    pub fn is_data_missing(&self) -> bool {
        self.outputs.iter().any(Output::is_data_missing)
    }

    /// Close every output, returning the first failure
    pub fn close(&mut self) -> Result<()> {
        let mut result = Ok(());
        for output in &mut self.outputs {
            if let Err(e) = output.close() {
                tracing::warn!(target: "beat::output", output = %output.name, error = %e, "cannot close output");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
