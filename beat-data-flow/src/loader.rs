//! Random access to the records of several inputs sharing a channel
//!
//! A [`DataLoader`] aligns its inputs on a common timeline: the mixed index
//! is the coarsest list of intervals that falls within one record of every
//! input. Entry `i` of a loader yields the record of each input covering the
//! `i`-th mixed interval.

use std::collections::{BTreeMap, BTreeSet};

use beat_data_core::{DataIndex, Result};
use beat_data_readers::{DataRecord, DataSource, Interval};

/// Records of all inputs of a loader for one mixed interval, keyed by input
pub type LoaderData = BTreeMap<String, DataRecord>;

/// Entry of a loader: the records and the interval they cover
pub type LoaderEntry = (LoaderData, DataIndex, DataIndex);

/// Refine several interval lists into intervals contained in all of them
///
/// The result spans from the latest first start to the earliest last end,
/// cut after every index at which one of the lists closes an interval.
pub fn mix_data_indices(lists: &[Vec<Interval>]) -> Vec<Interval> {
    let mut start = DataIndex::MIN;
    let mut end = DataIndex::MAX;
    for list in lists {
        let (Some(first), Some(last)) = (list.first(), list.last()) else {
            return Vec::new();
        };
        start = start.max(first.0);
        end = end.min(last.1);
    }
    if lists.is_empty() || end < start {
        return Vec::new();
    }

    let cuts: BTreeSet<DataIndex> = lists
        .iter()
        .flatten()
        .map(|&(_, e)| e)
        .filter(|&e| start <= e && e <= end)
        .collect();

    let mut current = start;
    let mut mixed = Vec::with_capacity(cuts.len());
    for cut in cuts {
        mixed.push((current, cut));
        current = cut + 1;
    }
    mixed
}

fn overlaps(&(s, e): &Interval, start: DataIndex, end: DataIndex) -> bool {
    s <= end && e >= start
}

#[derive(Debug)]
struct LoaderInput {
    name: String,
    source: Box<dyn DataSource>,
    intervals: Vec<Interval>,
    // last record read, by position in `intervals`
    current: Option<(usize, DataRecord)>,
}

impl LoaderInput {
    fn read(&mut self, data_index: DataIndex) -> Result<Option<DataRecord>> {
        let Some(position) = self
            .intervals
            .iter()
            .position(|&(s, e)| s <= data_index && data_index <= e)
        else {
            return Ok(None);
        };
        if let Some((cached, data)) = &self.current {
            if *cached == position {
                return Ok(Some(data.clone()));
            }
        }

        let data = self.source.get(position as i64)?.map(|(data, _, _)| data);
        self.current = data.clone().map(|d| (position, d));
        Ok(data)
    }
}

fn read_all(inputs: &mut [LoaderInput], mixed: &[Interval], index: i64) -> Result<Option<LoaderEntry>> {
    let Some(&(start, end)) = usize::try_from(index).ok().and_then(|i| mixed.get(i)) else {
        return Ok(None);
    };
    let mut data = LoaderData::new();
    for input in inputs {
        if let Some(record) = input.read(start)? {
            data.insert(input.name.clone(), record);
        }
    }
    Ok(Some((data, start, end)))
}

/// Aggregates the inputs of one channel for random access
#[derive(Debug)]
pub struct DataLoader {
    channel: String,
    inputs: Vec<LoaderInput>,
    mixed: Vec<Interval>,
    data_index_start: DataIndex,
    data_index_end: DataIndex,
}

impl DataLoader {
    /// Create an empty loader for `channel`
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_owned(),
            inputs: Vec::new(),
            mixed: Vec::new(),
            data_index_start: -1,
            data_index_end: -1,
        }
    }

    /// Channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Add an input, reading its interval list
    pub fn add(&mut self, name: &str, mut source: Box<dyn DataSource>) -> Result<()> {
        let intervals = source.data_indices()?;
        if let (Some(first), Some(last)) = (intervals.first(), intervals.last()) {
            if self.data_index_start < 0 {
                self.data_index_start = first.0;
                self.data_index_end = last.1;
            } else {
                self.data_index_start = self.data_index_start.min(first.0);
                self.data_index_end = self.data_index_end.max(last.1);
            }
        }

        self.inputs.push(LoaderInput {
            name: name.to_owned(),
            source,
            intervals,
            current: None,
        });
        let lists: Vec<Vec<Interval>> = self.inputs.iter().map(|i| i.intervals.clone()).collect();
        self.mixed = mix_data_indices(&lists);

        tracing::debug!(
            target: "beat::loader",
            channel = %self.channel,
            input = name,
            units = self.mixed.len(),
            "input added to data loader"
        );
        Ok(())
    }

    /// Names of the inputs, in insertion order
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|i| i.name.as_str())
    }

    /// Whether `name` is one of the inputs
    pub fn contains(&self, name: &str) -> bool {
        self.inputs.iter().any(|i| i.name == name)
    }

    /// Number of inputs
    pub fn nb_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Number of entries, the length of the mixed index
    pub fn count(&self) -> usize {
        self.mixed.len()
    }

    /// Number of records of one input
    pub fn count_of(&self, name: &str) -> Option<usize> {
        self.inputs.iter().find(|i| i.name == name).map(|i| i.intervals.len())
    }

    /// Mixed index
    pub fn data_indices(&self) -> &[Interval] {
        &self.mixed
    }

    /// Lowest start index over all inputs, `-1` when empty
    pub fn data_index_start(&self) -> DataIndex {
        self.data_index_start
    }

    /// Highest end index over all inputs, `-1` when empty
    pub fn data_index_end(&self) -> DataIndex {
        self.data_index_end
    }

    /// Entry `index`, or `None` outside `0..count()`
    pub fn get(&mut self, index: i64) -> Result<Option<LoaderEntry>> {
        read_all(&mut self.inputs, &self.mixed, index)
    }

    /// Restrict the loader to the `index`-th record of input `name`
    pub fn view(&mut self, name: &str, index: i64) -> Option<DataView<'_>> {
        let input = self.inputs.iter().find(|i| i.name == name)?;
        let &(start, end) = usize::try_from(index).ok().and_then(|i| input.intervals.get(i))?;

        let mixed = self
            .mixed
            .iter()
            .copied()
            .filter(|&(s, e)| s >= start && e <= end)
            .collect();
        Some(DataView {
            loader: self,
            mixed,
            start,
            end,
        })
    }

    /// Release the sources of all inputs
    pub fn close(&mut self) {
        for input in &mut self.inputs {
            input.current = None;
            input.source.close();
        }
    }
}

/// A [`DataLoader`] restricted to the interval of one input record
#[derive(Debug)]
pub struct DataView<'a> {
    loader: &'a mut DataLoader,
    mixed: Vec<Interval>,
    start: DataIndex,
    end: DataIndex,
}

impl DataView<'_> {
    /// Number of entries inside the interval
    pub fn count(&self) -> usize {
        self.mixed.len()
    }

    /// Number of records of one input overlapping the interval
    pub fn count_of(&self, name: &str) -> Option<usize> {
        let input = self.loader.inputs.iter().find(|i| i.name == name)?;
        Some(
            input
                .intervals
                .iter()
                .filter(|i| overlaps(i, self.start, self.end))
                .count(),
        )
    }

    /// Mixed index inside the interval
    pub fn data_indices(&self) -> &[Interval] {
        &self.mixed
    }

    /// Start of the interval
    pub fn data_index_start(&self) -> DataIndex {
        self.start
    }

    /// End of the interval
    pub fn data_index_end(&self) -> DataIndex {
        self.end
    }

    /// Entry `index` of the view
    pub fn get(&mut self, index: i64) -> Result<Option<LoaderEntry>> {
        read_all(&mut self.loader.inputs, &self.mixed, index)
    }
}

/// The data loaders of an algorithm, one per channel
///
/// The first loader added is the main one.
#[derive(Debug, Default)]
pub struct DataLoaderList {
    loaders: Vec<DataLoader>,
}

impl DataLoaderList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a loader
    pub fn add(&mut self, loader: DataLoader) {
        self.loaders.push(loader);
    }

    /// Number of loaders
    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    /// Whether no loader was added
    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// Loader of the main channel
    pub fn main_loader(&self) -> Option<&DataLoader> {
        self.loaders.first()
    }

    /// Mutable loader of the main channel
    pub fn main_loader_mut(&mut self) -> Option<&mut DataLoader> {
        self.loaders.first_mut()
    }

    /// Loader of a channel
    pub fn get(&self, channel: &str) -> Option<&DataLoader> {
        self.loaders.iter().find(|l| l.channel == channel)
    }

    /// Mutable loader of a channel
    pub fn get_mut(&mut self, channel: &str) -> Option<&mut DataLoader> {
        self.loaders.iter_mut().find(|l| l.channel == channel)
    }

    /// Loader owning the `index`-th input, counting across loaders
    pub fn at(&self, index: usize) -> Option<&DataLoader> {
        let mut remaining = index;
        for loader in &self.loaders {
            if remaining < loader.nb_inputs() {
                return Some(loader);
            }
            remaining -= loader.nb_inputs();
        }
        None
    }

    /// Loader owning input `name`
    pub fn loader_of(&self, name: &str) -> Option<&DataLoader> {
        self.loaders.iter().find(|l| l.contains(name))
    }

    /// Mutable loader owning input `name`
    pub fn loader_of_mut(&mut self, name: &str) -> Option<&mut DataLoader> {
        self.loaders.iter_mut().find(|l| l.contains(name))
    }

    /// All loaders, the main one first
    pub fn iter(&self) -> impl Iterator<Item = &DataLoader> {
        self.loaders.iter()
    }

    /// Release all sources
    pub fn close(&mut self) {
        for loader in &mut self.loaders {
            loader.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{value, MemorySource};
    use beat_data_core::IoStatistics;
    use beat_data_readers::Block;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use test_case::test_case;

    #[derive(Debug)]
    struct CountingSource {
        inner: MemorySource,
        reads: Arc<AtomicUsize>,
    }

    impl DataSource for CountingSource {
        fn intervals(&mut self) -> Result<&[Interval]> {
            self.inner.intervals()
        }

        fn get(&mut self, index: i64) -> Result<Option<Block>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(index)
        }

        fn close(&mut self) {}

        fn statistics(&self) -> IoStatistics {
            IoStatistics::default()
        }
    }

    #[test_case(vec![vec![(0, 2), (3, 4)], vec![(0, 4)]] => vec![(0, 2), (3, 4)]; "coarse second list")]
    #[test_case(vec![vec![(0, 2), (3, 4)], vec![(0, 1), (2, 3), (4, 4)]] => vec![(0, 1), (2, 2), (3, 3), (4, 4)]; "interleaved")]
    #[test_case(vec![vec![(2, 5), (6, 9)], vec![(0, 3), (4, 7)]] => vec![(2, 3), (4, 5), (6, 7)]; "late start early end")]
    #[test_case(vec![vec![(0, 1)], vec![]] => Vec::<Interval>::new(); "empty list")]
    #[test_case(vec![] => Vec::<Interval>::new(); "no list")]
    fn test_mix(lists: Vec<Vec<Interval>>) -> Vec<Interval> {
        mix_data_indices(&lists)
    }

    fn partition(cuts: &BTreeSet<DataIndex>, end: DataIndex) -> Vec<Interval> {
        let mut intervals = Vec::new();
        let mut start = 0;
        for &cut in cuts.iter().filter(|&&c| c < end) {
            intervals.push((start, cut));
            start = cut + 1;
        }
        intervals.push((start, end));
        intervals
    }

    proptest! {
        #[test]
        fn test_mix_refines_every_list(
            end in 0i64..60,
            cuts in prop::collection::vec(prop::collection::btree_set(0i64..60, 0..12), 1..4),
        ) {
            let lists: Vec<Vec<Interval>> = cuts.iter().map(|c| partition(c, end)).collect();
            let mixed = mix_data_indices(&lists);

            prop_assert_eq!(mixed.first().map(|i| i.0), Some(0));
            prop_assert_eq!(mixed.last().map(|i| i.1), Some(end));
            for pair in mixed.windows(2) {
                prop_assert_eq!(pair[1].0, pair[0].1 + 1);
            }
            for &(s, e) in &mixed {
                for list in &lists {
                    prop_assert!(list.iter().any(|&(ls, le)| ls <= s && e <= le));
                }
            }
        }
    }

    fn loader(inputs: &[(&str, &[Interval], i64)]) -> DataLoader {
        let mut loader = DataLoader::new("channel1");
        for &(name, intervals, base) in inputs {
            loader.add(name, Box::new(MemorySource::new(intervals, base))).unwrap();
        }
        loader
    }

    fn values(entry: &LoaderEntry) -> BTreeMap<String, i64> {
        entry.0.iter().map(|(k, v)| (k.clone(), value(v))).collect()
    }

    #[test]
    fn test_empty_loader() {
        let mut loader = DataLoader::new("channel1");
        assert_eq!(loader.channel(), "channel1");
        assert_eq!(loader.count(), 0);
        assert_eq!((loader.data_index_start(), loader.data_index_end()), (-1, -1));
        assert!(loader.get(0).unwrap().is_none());
        assert!(loader.view("unknown", 0).is_none());
    }

    #[test]
    fn test_two_synchronized_inputs() {
        let mut loader = loader(&[
            ("input1", &[(0, 0), (1, 1), (2, 2), (3, 3)], 1000),
            ("input2", &[(0, 1), (2, 3)], 2000),
        ]);
        assert_eq!(loader.count(), 4);
        assert_eq!(loader.count_of("input1"), Some(4));
        assert_eq!(loader.count_of("input2"), Some(2));
        assert_eq!((loader.data_index_start(), loader.data_index_end()), (0, 3));

        assert!(loader.get(-1).unwrap().is_none());
        let entry = loader.get(1).unwrap().unwrap();
        assert_eq!((entry.1, entry.2), (1, 1));
        assert_eq!(values(&entry), BTreeMap::from([("input1".into(), 1001), ("input2".into(), 2000)]));
        let entry = loader.get(3).unwrap().unwrap();
        assert_eq!(values(&entry), BTreeMap::from([("input1".into(), 1003), ("input2".into(), 2002)]));
        assert!(loader.get(4).unwrap().is_none());

        let mut view = loader.view("input2", 1).unwrap();
        assert_eq!(view.count(), 2);
        assert_eq!(view.count_of("input1"), Some(2));
        assert_eq!(view.count_of("input2"), Some(1));
        assert_eq!((view.data_index_start(), view.data_index_end()), (2, 3));
        let entry = view.get(1).unwrap().unwrap();
        assert_eq!((entry.1, entry.2), (3, 3));
        assert_eq!(values(&entry), BTreeMap::from([("input1".into(), 1003), ("input2".into(), 2002)]));
        assert!(view.get(2).unwrap().is_none());

        assert!(loader.view("input2", 2).is_none());
        assert!(loader.view("input1", -1).is_none());
    }

    #[test]
    fn test_two_desynchronized_inputs() {
        let mut loader = loader(&[
            ("input1", &[(0, 2), (3, 3)], 1000),
            ("input2", &[(0, 1), (2, 3)], 2000),
        ]);
        assert_eq!(loader.data_indices(), &[(0, 1), (2, 2), (3, 3)]);

        let entry = loader.get(1).unwrap().unwrap();
        assert_eq!((entry.1, entry.2), (2, 2));
        assert_eq!(values(&entry), BTreeMap::from([("input1".into(), 1000), ("input2".into(), 2002)]));

        let mut view = loader.view("input1", 0).unwrap();
        assert_eq!(view.count(), 2);
        assert_eq!(view.count_of("input1"), Some(1));
        assert_eq!(view.count_of("input2"), Some(2));
        assert_eq!((view.data_index_start(), view.data_index_end()), (0, 2));
        let entry = view.get(0).unwrap().unwrap();
        assert_eq!((entry.1, entry.2), (0, 1));

        let view = loader.view("input2", 0).unwrap();
        assert_eq!(view.count(), 1);
        assert_eq!(view.count_of("input1"), Some(1));
        assert_eq!(view.data_indices(), &[(0, 1)]);
    }

    #[test]
    fn test_records_read_once_per_interval() {
        let reads1 = Arc::new(AtomicUsize::new(0));
        let reads2 = Arc::new(AtomicUsize::new(0));
        let mut loader = DataLoader::new("channel1");
        for (name, intervals, base, reads) in [
            ("input1", &[(0, 2), (3, 3)][..], 1000, &reads1),
            ("input2", &[(0, 1), (2, 3)][..], 2000, &reads2),
        ] {
            let source = CountingSource {
                inner: MemorySource::new(intervals, base),
                reads: Arc::clone(reads),
            };
            loader.add(name, Box::new(source)).unwrap();
        }
        let counts = || (reads1.load(Ordering::SeqCst), reads2.load(Ordering::SeqCst));

        let first = loader.get(0).unwrap().unwrap();
        assert_eq!(counts(), (1, 1));
        let again = loader.get(0).unwrap().unwrap();
        assert_eq!(values(&again), values(&first));
        assert_eq!(counts(), (1, 1));

        // (2, 2) shares the first record of input1
        let entry = loader.get(1).unwrap().unwrap();
        assert_eq!(values(&entry), BTreeMap::from([("input1".into(), 1000), ("input2".into(), 2002)]));
        assert_eq!(counts(), (1, 2));
        loader.get(2).unwrap().unwrap();
        assert_eq!(counts(), (2, 2));

        loader.get(0).unwrap().unwrap();
        assert_eq!(counts(), (3, 3));
    }

    #[test]
    fn test_loader_list_lookups() {
        let mut list = DataLoaderList::new();
        assert!(list.main_loader().is_none());
        list.add(loader(&[("a", &[(0, 0)], 0), ("b", &[(0, 0)], 0)]));
        let mut second = DataLoader::new("channel2");
        second.add("c", Box::new(MemorySource::new(&[(0, 3)], 0))).unwrap();
        list.add(second);

        assert_eq!(list.len(), 2);
        assert_eq!(list.main_loader().unwrap().channel(), "channel1");
        assert_eq!(list.get("channel2").unwrap().count_of("c"), Some(1));
        assert_eq!(list.at(1).unwrap().channel(), "channel1");
        assert_eq!(list.at(2).unwrap().channel(), "channel2");
        assert!(list.at(3).is_none());
        assert_eq!(list.loader_of("c").unwrap().channel(), "channel2");
        assert!(list.loader_of("d").is_none());
        assert_eq!(list.iter().count(), 2);
    }
}
