//! Inputs advancing in lockstep on a channel
//!
//! An [`InputGroup`] holds the inputs of one channel. Each tick advances the
//! inputs whose current record ends first; coarser inputs keep their record
//! until the finer ones catch up. The interval shared by all inputs after a
//! tick is reported to the group's [`SynchronizationListener`].

use beat_data_core::{DataIndex, Error, IoStatistics, Result};
use beat_data_readers::{DataRecord, DataSource, Interval};

use crate::output::SynchronizationListener;

/// Cursor over the records of one data source
#[derive(Debug)]
pub struct Input {
    name: String,
    data_format: String,
    source: Box<dyn DataSource>,
    intervals: Vec<Interval>,
    next_position: usize,
    data: Option<DataRecord>,
    data_index: DataIndex,
    data_index_end: DataIndex,
    same_as_previous: bool,
    group_last_data_index: DataIndex,
    nb_data_blocks_read: u64,
}

impl Input {
    /// Wrap `source`, whose records have format `data_format`
    pub fn new(name: &str, data_format: &str, mut source: Box<dyn DataSource>) -> Result<Self> {
        let intervals = source.data_indices()?;
        Ok(Self {
            name: name.to_owned(),
            data_format: data_format.to_owned(),
            source,
            intervals,
            next_position: 0,
            data: None,
            data_index: -1,
            data_index_end: -1,
            same_as_previous: true,
            group_last_data_index: -1,
            nb_data_blocks_read: 0,
        })
    }

    /// Input name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the data format of the records
    pub fn data_format(&self) -> &str {
        &self.data_format
    }

    /// Current record, `None` before the first tick
    pub fn data(&self) -> Option<&DataRecord> {
        self.data.as_ref()
    }

    /// Start of the current record, `-1` before the first tick
    pub fn data_index(&self) -> DataIndex {
        self.data_index
    }

    /// End of the current record, `-1` before the first tick
    pub fn data_index_end(&self) -> DataIndex {
        self.data_index_end
    }

    /// Intervals of all records of the source
    pub fn data_indices(&self) -> &[Interval] {
        &self.intervals
    }

    /// Whether records remain to be read
    pub fn has_more_data(&self) -> bool {
        self.next_position < self.intervals.len()
    }

    /// Whether the last tick replaced the current record
    pub fn has_data_changed(&self) -> bool {
        !self.same_as_previous
    }

    /// Whether the current record ends with the group's current interval
    pub fn is_data_unit_done(&self) -> bool {
        self.data_index_end == self.group_last_data_index
    }

    /// Number of records read so far
    pub fn nb_data_blocks_read(&self) -> u64 {
        self.nb_data_blocks_read
    }

    /// Reading statistics of the underlying source
    pub fn statistics(&self) -> IoStatistics {
        self.source.statistics()
    }

    fn read_next(&mut self) -> Result<()> {
        if !self.has_more_data() {
            return Err(Error::OutOfRange(format!("input `{}' has no more data", self.name)));
        }
        let position = self.next_position as i64;
        let (data, start, end) = self.source.get(position)?.ok_or_else(|| {
            Error::NotFound(format!("record {position} of input `{}'", self.name))
        })?;

        self.data = Some(data);
        self.data_index = start;
        self.data_index_end = end;
        self.next_position += 1;
        self.same_as_previous = false;
        self.nb_data_blocks_read += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.source.close();
    }
}

/// Inputs of one channel, advanced together
#[derive(Debug)]
pub struct InputGroup {
    channel: String,
    inputs: Vec<Input>,
    listener: Option<SynchronizationListener>,
    restricted_access: bool,
    data_index: DataIndex,
    data_index_end: DataIndex,
    first_data_index: DataIndex,
    last_data_index: DataIndex,
}

impl InputGroup {
    /// Create an empty group
    ///
    /// Algorithm code may only advance groups created without
    /// `restricted_access`; the others belong to the host runtime.
    pub fn new(channel: &str, listener: Option<SynchronizationListener>, restricted_access: bool) -> Self {
        Self {
            channel: channel.to_owned(),
            inputs: Vec::new(),
            listener,
            restricted_access,
            data_index: -1,
            data_index_end: -1,
            first_data_index: -1,
            last_data_index: -1,
        }
    }

    /// Channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Add an input
    pub fn add(&mut self, input: Input) {
        self.inputs.push(input);
    }

    /// Number of inputs
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Whether the group has no input
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Input by name
    pub fn get(&self, name: &str) -> Option<&Input> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Input by position
    pub fn at(&self, index: usize) -> Option<&Input> {
        self.inputs.get(index)
    }

    /// Whether `name` belongs to this group
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All inputs, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Input> {
        self.inputs.iter()
    }

    /// Listener notified after each tick
    pub fn listener(&self) -> Option<&SynchronizationListener> {
        self.listener.as_ref()
    }

    /// Whether only the host runtime may advance this group
    pub fn restricted_access(&self) -> bool {
        self.restricted_access
    }

    /// Lowest start over the current records
    pub fn data_index(&self) -> DataIndex {
        self.data_index
    }

    /// Highest end over the current records
    pub fn data_index_end(&self) -> DataIndex {
        self.data_index_end
    }

    /// Start of the interval shared by all current records
    pub fn first_data_index(&self) -> DataIndex {
        self.first_data_index
    }

    /// End of the interval shared by all current records
    pub fn last_data_index(&self) -> DataIndex {
        self.last_data_index
    }

    /// Whether any input has records left
    pub fn has_more_data(&self) -> bool {
        self.inputs.iter().any(Input::has_more_data)
    }

    /// Advance the group one tick, on behalf of algorithm code
    pub fn next(&mut self) -> Result<()> {
        self.check_access()?;
        self.advance()
    }

    /// Advance a single input, on behalf of algorithm code
    pub fn next_input(&mut self, name: &str) -> Result<()> {
        self.check_access()?;
        let input = self
            .inputs
            .iter_mut()
            .find(|i| i.name == name)
            .ok_or_else(|| Error::NotFound(format!("input `{name}' in group `{}'", self.channel)))?;
        input.read_next()?;
        self.synchronize();
        Ok(())
    }

    /// Advance the group one tick
    ///
    /// The inputs whose current record ends first read their next record;
    /// the others keep theirs. Fails without moving any input when one of
    /// the expiring inputs is exhausted.
    pub fn advance(&mut self) -> Result<()> {
        let Some(lower_end) = self.inputs.iter().map(|i| i.data_index_end).min() else {
            return Err(Error::InvalidOperation(format!(
                "group `{}' has no input to advance",
                self.channel
            )));
        };
        if let Some(exhausted) = self
            .inputs
            .iter()
            .find(|i| i.data_index_end == lower_end && !i.has_more_data())
        {
            return Err(Error::OutOfRange(format!(
                "input `{}' has no more data",
                exhausted.name
            )));
        }

        for input in &mut self.inputs {
            if input.data_index_end == lower_end {
                input.read_next()?;
            } else {
                input.same_as_previous = true;
            }
        }
        self.synchronize();
        Ok(())
    }

    fn check_access(&self) -> Result<()> {
        if self.restricted_access {
            return Err(Error::AccessDenied(format!(
                "group `{}' is advanced by the runtime only",
                self.channel
            )));
        }
        Ok(())
    }

    fn synchronize(&mut self) {
        let starts = self.inputs.iter().map(|i| i.data_index);
        let ends = self.inputs.iter().map(|i| i.data_index_end);
        self.data_index = starts.clone().min().unwrap_or(-1);
        self.first_data_index = starts.max().unwrap_or(-1);
        self.data_index_end = ends.clone().max().unwrap_or(-1);
        self.last_data_index = ends.min().unwrap_or(-1);

        for input in &mut self.inputs {
            input.group_last_data_index = self.last_data_index;
        }
        if let Some(listener) = &self.listener {
            listener.set(self.first_data_index, self.last_data_index);
        }

        tracing::trace!(
            target: "beat::sync",
            channel = %self.channel,
            first = self.first_data_index,
            last = self.last_data_index,
            "group advanced"
        );
    }

    /// Release the sources of all inputs
    pub fn close(&mut self) {
        for input in &mut self.inputs {
            input.close();
        }
    }
}

/// The input groups of an algorithm
///
/// The first restricted group added is the main group, advanced by the
/// runtime at each step; the others follow it.
#[derive(Debug, Default)]
pub struct InputList {
    groups: Vec<InputGroup>,
    main_group: Option<usize>,
}

impl InputList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group
    pub fn add(&mut self, group: InputGroup) {
        if self.main_group.is_none() && group.restricted_access {
            self.main_group = Some(self.groups.len());
        }
        self.groups.push(group);
    }

    /// Total number of inputs
    pub fn len(&self) -> usize {
        self.groups.iter().map(InputGroup::len).sum()
    }

    /// Whether no input was added
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of groups
    pub fn nb_groups(&self) -> usize {
        self.groups.len()
    }

    /// Group advanced by the runtime
    pub fn main_group(&self) -> Option<&InputGroup> {
        self.main_group.map(|i| &self.groups[i])
    }

    /// Input by name
    pub fn get(&self, name: &str) -> Option<&Input> {
        self.groups.iter().find_map(|g| g.get(name))
    }

    /// Input by position, counting across groups
    pub fn at(&self, index: usize) -> Option<&Input> {
        self.groups.iter().flat_map(InputGroup::iter).nth(index)
    }

    /// Group of a channel
    pub fn group(&self, channel: &str) -> Option<&InputGroup> {
        self.groups.iter().find(|g| g.channel == channel)
    }

    /// Mutable group of a channel
    pub fn group_mut(&mut self, channel: &str) -> Option<&mut InputGroup> {
        self.groups.iter_mut().find(|g| g.channel == channel)
    }

    /// Group owning input `name`
    pub fn group_of(&self, name: &str) -> Option<&InputGroup> {
        self.groups.iter().find(|g| g.contains(name))
    }

    /// All groups, in insertion order
    pub fn groups(&self) -> impl Iterator<Item = &InputGroup> {
        self.groups.iter()
    }

    /// All inputs, group after group
    pub fn iter(&self) -> impl Iterator<Item = &Input> {
        self.groups.iter().flat_map(InputGroup::iter)
    }

    /// Whether any group has records left
    pub fn has_more_data(&self) -> bool {
        self.groups.iter().any(InputGroup::has_more_data)
    }

    /// Run one step: tick the main group, then bring every other group up
    /// to the main group's current interval
    pub fn advance(&mut self) -> Result<()> {
        let main = self
            .main_group
            .ok_or_else(|| Error::InvalidOperation("no main input group".to_owned()))?;
        self.groups[main].advance()?;
        let first = self.groups[main].first_data_index;

        for (i, group) in self.groups.iter_mut().enumerate() {
            if i == main {
                continue;
            }
            while group.has_more_data() && group.last_data_index < first {
                group.advance()?;
            }
        }
        Ok(())
    }

    /// Release all sources
    pub fn close(&mut self) {
        for group in &mut self.groups {
            group.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{init_tracing, value, MemorySource};
    use beat_data_core::ErrorKind;

    fn input(name: &str, intervals: &[Interval], base: i64) -> Input {
        Input::new(name, "user/single_integer/1", Box::new(MemorySource::new(intervals, base))).unwrap()
    }

    fn units(name: &str, count: i64, base: i64) -> Input {
        Input::new(name, "user/single_integer/1", Box::new(MemorySource::units(count, base))).unwrap()
    }

    fn changed(group: &InputGroup) -> Vec<bool> {
        group.iter().map(Input::has_data_changed).collect()
    }

    #[test]
    fn test_initial_state() {
        let mut group = InputGroup::new("channel1", None, true);
        group.add(units("a", 2, 0));
        let input = group.get("a").unwrap();

        assert_eq!((input.data_index(), input.data_index_end()), (-1, -1));
        assert!(input.data().is_none());
        assert!(input.has_more_data());
        assert!(!input.has_data_changed());
        assert!(input.is_data_unit_done());
        assert_eq!(input.data_format(), "user/single_integer/1");
        assert_eq!((group.first_data_index(), group.last_data_index()), (-1, -1));
        assert!(group.has_more_data());
    }

    #[test]
    fn test_same_rate_inputs() {
        init_tracing();
        let listener = SynchronizationListener::new();
        let mut group = InputGroup::new("channel1", Some(listener.clone()), true);
        group.add(units("a", 5, 0));
        group.add(units("b", 5, 100));
        group.add(units("c", 5, 200));

        for tick in 0..5 {
            group.advance().unwrap();
            assert_eq!((group.first_data_index(), group.last_data_index()), (tick, tick));
            assert_eq!(listener.interval(), (tick, tick));
            assert_eq!(changed(&group), vec![true, true, true]);
            assert!(group.iter().all(Input::is_data_unit_done));
            assert_eq!(value(group.get("c").unwrap().data().unwrap()), 200 + tick);
        }
        assert!(!group.has_more_data());
        assert_eq!(group.get("a").unwrap().nb_data_blocks_read(), 5);
        assert_eq!(group.advance().unwrap_err().kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn test_mixed_rate_inputs() {
        let mut group = InputGroup::new("channel1", None, true);
        group.add(units("unit", 6, 0));
        group.add(input("pair", &[(0, 1), (2, 3), (4, 5)], 0));
        group.add(input("whole", &[(0, 5)], 0));

        let mut pair_changes = Vec::new();
        for tick in 0..6 {
            group.advance().unwrap();
            assert_eq!((group.first_data_index(), group.last_data_index()), (tick, tick));
            assert_eq!((group.data_index(), group.data_index_end()), (0, 5));

            let pair = group.get("pair").unwrap();
            if pair.has_data_changed() {
                pair_changes.push(tick);
            }
            assert_eq!(pair.is_data_unit_done(), tick % 2 == 1);
            assert_eq!(group.get("whole").unwrap().has_data_changed(), tick == 0);
            assert_eq!(group.get("whole").unwrap().is_data_unit_done(), tick == 5);
        }
        assert_eq!(pair_changes, vec![0, 2, 4]);
        assert!(!group.has_more_data());
    }

    #[test]
    fn test_desynchronized_inputs() {
        let listener = SynchronizationListener::new();
        let mut group = InputGroup::new("channel1", Some(listener.clone()), true);
        group.add(input("a", &[(0, 2), (3, 3)], 1000));
        group.add(input("b", &[(0, 1), (2, 3)], 2000));

        let mut ticks = Vec::new();
        while group.has_more_data() {
            group.advance().unwrap();
            ticks.push((listener.interval(), changed(&group)));
        }
        assert_eq!(
            ticks,
            vec![
                ((0, 1), vec![true, true]),
                ((2, 2), vec![false, true]),
                ((3, 3), vec![true, false]),
            ]
        );
        assert_eq!(value(group.get("a").unwrap().data().unwrap()), 1003);
        assert_eq!(value(group.get("b").unwrap().data().unwrap()), 2002);
    }

    #[test]
    fn test_exhausted_input_stops_before_moving() {
        let mut group = InputGroup::new("channel1", None, true);
        group.add(units("short", 1, 0));
        group.add(units("long", 3, 0));
        group.advance().unwrap();

        let err = group.advance().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(group.get("long").unwrap().data_index(), 0);
        assert!(group.has_more_data());
    }

    #[test]
    fn test_restricted_access() {
        let mut group = InputGroup::new("channel1", None, true);
        group.add(units("a", 2, 0));
        assert_eq!(group.next().unwrap_err().kind(), ErrorKind::AccessDenied);
        assert_eq!(group.next_input("a").unwrap_err().kind(), ErrorKind::AccessDenied);
        assert_eq!(group.get("a").unwrap().data_index(), -1);
    }

    #[test]
    fn test_unrestricted_next() {
        let mut group = InputGroup::new("channel2", None, false);
        group.add(input("a", &[(0, 0), (1, 1)], 0));
        group.add(input("b", &[(0, 1)], 0));

        group.next().unwrap();
        assert_eq!(group.last_data_index(), 0);
        group.next_input("a").unwrap();
        assert_eq!(group.get("a").unwrap().data_index(), 1);
        assert_eq!(group.first_data_index(), 1);
        assert_eq!(group.next_input("c").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(group.next_input("a").unwrap_err().kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn test_empty_group() {
        let mut group = InputGroup::new("channel1", None, false);
        assert!(group.is_empty());
        assert!(!group.has_more_data());
        assert_eq!(group.next().unwrap_err().kind(), ErrorKind::Usage);
    }

    #[test]
    fn test_input_list_lookups() {
        let mut main = InputGroup::new("channel1", None, true);
        main.add(units("a", 4, 1000));
        let mut secondary = InputGroup::new("channel2", None, false);
        secondary.add(input("b", &[(0, 3)], 2000));
        secondary.add(input("c", &[(0, 1), (2, 3)], 3000));

        let mut list = InputList::new();
        assert!(list.is_empty());
        assert_eq!(list.advance().unwrap_err().kind(), ErrorKind::Usage);
        list.add(secondary);
        list.add(main);

        assert_eq!(list.len(), 3);
        assert_eq!(list.nb_groups(), 2);
        assert_eq!(list.main_group().unwrap().channel(), "channel1");
        assert_eq!(list.at(1).unwrap().name(), "c");
        assert_eq!(list.at(2).unwrap().name(), "a");
        assert!(list.at(3).is_none());
        assert_eq!(list.get("c").unwrap().name(), "c");
        assert_eq!(list.group_of("a").unwrap().channel(), "channel1");
        assert!(list.group_of("d").is_none());
        assert_eq!(list.group("channel2").unwrap().len(), 2);
        assert_eq!(list.iter().count(), 3);
    }

    #[test]
    fn test_input_list_follows_main_group() {
        let mut main = InputGroup::new("channel1", None, true);
        main.add(units("a", 4, 1000));
        let mut secondary = InputGroup::new("channel2", None, false);
        secondary.add(input("b", &[(0, 3)], 2000));

        let mut list = InputList::new();
        list.add(main);
        list.add(secondary);

        let mut sums = Vec::new();
        while list.main_group().unwrap().has_more_data() {
            list.advance().unwrap();
            let a = value(list.get("a").unwrap().data().unwrap());
            let b = value(list.get("b").unwrap().data().unwrap());
            sums.push(a + b);
        }
        assert_eq!(sums, vec![3000, 3001, 3002, 3003]);
        assert_eq!(list.get("b").unwrap().nb_data_blocks_read(), 1);
        assert!(!list.has_more_data());
    }
}
