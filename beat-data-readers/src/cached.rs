//! Data source reading the shards of one cached stream

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize, Serializer};

use beat_data_core::io::ShardHandle;
use beat_data_core::{
    Casting, DataFormat, DataFormatCache, DataIndex, Error, IoStatistics, Record, Result,
};

use crate::data_source::{Block, DataRecord, DataSource, Interval};
use crate::shard::{self, Encoding, RecordLocation};

/// Options for opening a cached stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSourceOptions {
    /// Skip records starting before this index
    pub start_index: Option<DataIndex>,

    /// Skip records ending after this index
    pub end_index: Option<DataIndex>,

    /// Decode payloads into records rather than returning raw bytes
    pub unpack: bool,

    /// Memory-map data files instead of seeking through them
    pub memory_map: bool,
}

impl Default for CachedSourceOptions {
    fn default() -> Self {
        Self {
            start_index: None,
            end_index: None,
            unpack: true,
            memory_map: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FileInfos {
    file_index: usize,
    location: RecordLocation,
}

/// Data source over the shards of a cached stream
///
/// At most one data file is open at any time. Serializing the source drops
/// that handle; deserializing reopens it if one was held.
#[derive(Debug, Deserialize)]
#[serde(try_from = "CachedSourceState")]
pub struct CachedDataSource {
    filenames: Vec<PathBuf>,
    encodings: Vec<Encoding>,
    format_name: String,
    prefix: PathBuf,
    options: CachedSourceOptions,
    infos: Vec<FileInfos>,
    intervals: Vec<Interval>,
    current_file_index: Option<usize>,
    current_file: Option<ShardHandle>,
    format: Option<Arc<DataFormat>>,
    stats: IoStatistics,
}

impl CachedDataSource {
    /// Open the stream whose data file path (or stem) is `path`
    ///
    /// Shards are discovered, checked for consistency and scanned. The data
    /// format named in the headers is resolved through `formats`.
    pub fn open(path: &Path, formats: &mut DataFormatCache, options: CachedSourceOptions) -> Result<Self> {
        let files = shard::all_filenames(path, options.start_index, options.end_index)?;
        if files.data.is_empty() {
            return Err(Error::NotFound(format!("no cache shard for `{}'", path.display())));
        }
        shard::check_consistency(&files.data, &files.data_checksum)?;

        let mut encodings = Vec::with_capacity(files.data.len());
        let mut infos = Vec::new();
        let mut format_name: Option<String> = None;

        for (file_index, filename) in files.data.iter().enumerate() {
            let (header, records) = shard::scan_data_file(filename, options.start_index, options.end_index)?;
            match &format_name {
                None => format_name = Some(header.format.clone()),
                Some(name) if *name != header.format => {
                    return Err(Error::Format(format!(
                        "`{}' holds `{}' records, previous shards hold `{name}'",
                        filename.display(),
                        header.format
                    )))
                }
                Some(_) => {}
            }
            encodings.push(header.encoding);
            infos.extend(records.into_iter().map(|location| FileInfos { file_index, location }));
        }

        let format_name = format_name.unwrap_or_default();
        let format = formats.resolve(&format_name)?;

        tracing::debug!(
            target: "beat::cache",
            path = %path.display(),
            shards = files.data.len(),
            records = infos.len(),
            format = %format_name,
            "opened cached stream"
        );

        let intervals = infos.iter().map(|i| (i.location.start, i.location.end)).collect();
        Ok(Self {
            filenames: files.data,
            encodings,
            format_name,
            prefix: formats.prefix().to_path_buf(),
            options,
            infos,
            intervals,
            current_file_index: None,
            current_file: None,
            format: Some(format),
            stats: IoStatistics::default(),
        })
    }

    /// Data files of this stream, ordered by start index
    pub fn filenames(&self) -> &[PathBuf] {
        &self.filenames
    }

    /// Name of the data format of the records
    pub fn format_name(&self) -> &str {
        &self.format_name
    }

    /// Whether a data file is currently open
    pub fn has_open_file(&self) -> bool {
        self.current_file.is_some()
    }

    fn handle(&mut self, file_index: usize) -> Result<&mut ShardHandle> {
        if self.current_file_index != Some(file_index) || self.current_file.is_none() {
            self.current_file = None;
            self.current_file_index = None;
            let path = self.filenames.get(file_index).ok_or_else(|| {
                Error::OutOfRange(format!("shard {file_index} of {}", self.filenames.len()))
            })?;
            let handle = ShardHandle::open(path, self.options.memory_map)?;
            self.current_file_index = Some(file_index);
            return Ok(self.current_file.insert(handle));
        }
        self.current_file
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation("no open data file".to_owned()))
    }

    fn format(&mut self) -> Result<Arc<DataFormat>> {
        if let Some(format) = &self.format {
            return Ok(Arc::clone(format));
        }
        let format = DataFormatCache::new(&self.prefix).resolve(&self.format_name)?;
        self.format = Some(Arc::clone(&format));
        Ok(format)
    }

    fn decode(&mut self, payload: &[u8], encoding: Encoding) -> Result<Box<dyn Record>> {
        let mut record = self.format()?.new_record();
        match encoding {
            Encoding::Binary => record.unpack(payload)?,
            Encoding::Json => {
                let value: serde_json::Value = serde_json::from_slice(payload)?;
                record.from_dict(&value, Casting::Safe, false)?;
            }
        }
        Ok(Box::new(record))
    }
}

impl DataSource for CachedDataSource {
    fn intervals(&mut self) -> Result<&[Interval]> {
        Ok(&self.intervals)
    }

    fn get(&mut self, index: i64) -> Result<Option<Block>> {
        let Some(info) = usize::try_from(index).ok().and_then(|i| self.infos.get(i)).copied() else {
            return Ok(None);
        };
        let location = info.location;

        let started = Instant::now();
        let payload = self.handle(info.file_index)?.read_at(location.offset, location.size)?;
        self.stats.record(location.size, started.elapsed());

        let data = if self.options.unpack {
            let encoding = self.encodings.get(info.file_index).copied().unwrap_or_default();
            DataRecord::Unpacked(self.decode(&payload, encoding)?)
        } else {
            DataRecord::Packed(payload)
        };
        Ok(Some((data, location.start, location.end)))
    }

    fn reset(&mut self) {
        self.current_file = None;
        self.current_file_index = None;
    }

    fn close(&mut self) {
        self.reset();
        self.infos.clear();
        self.intervals.clear();
    }

    fn statistics(&self) -> IoStatistics {
        self.stats
    }
}

/// Serializable state of a [`CachedDataSource`]
#[derive(Debug, Serialize, Deserialize)]
struct CachedSourceState {
    filenames: Vec<PathBuf>,
    encodings: Vec<Encoding>,
    format_name: String,
    prefix: PathBuf,
    options: CachedSourceOptions,
    infos: Vec<FileInfos>,
    current_file_index: Option<usize>,
    was_open: bool,
}

impl Serialize for CachedDataSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        CachedSourceState {
            filenames: self.filenames.clone(),
            encodings: self.encodings.clone(),
            format_name: self.format_name.clone(),
            prefix: self.prefix.clone(),
            options: self.options,
            infos: self.infos.clone(),
            current_file_index: self.current_file_index,
            was_open: self.current_file.is_some(),
        }
        .serialize(serializer)
    }
}

impl TryFrom<CachedSourceState> for CachedDataSource {
    type Error = Error;

    fn try_from(state: CachedSourceState) -> Result<Self> {
        let intervals = state.infos.iter().map(|i| (i.location.start, i.location.end)).collect();
        let mut source = Self {
            filenames: state.filenames,
            encodings: state.encodings,
            format_name: state.format_name,
            prefix: state.prefix,
            options: state.options,
            infos: state.infos,
            intervals,
            current_file_index: None,
            current_file: None,
            format: None,
            stats: IoStatistics::default(),
        };
        if let (true, Some(file_index)) = (state.was_open, state.current_file_index) {
            source.handle(file_index)?;
        }
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{CachedDataSink, DataSink};
    use beat_data_core::{ErrorKind, Value};
    use serde_json::json;
    use test_case::test_case;

    fn prefix_with_format(dir: &Path) -> DataFormatCache {
        let path = dir.join("prefix/dataformats/user/single_integer/1.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, r#"{"value": "int32"}"#).unwrap();
        DataFormatCache::new(dir.join("prefix"))
    }

    fn write_shard(
        formats: &mut DataFormatCache,
        stem: &Path,
        start: i64,
        end: i64,
        encoding: Encoding,
    ) {
        let format = formats.get("user/single_integer/1").unwrap();
        let mut sink = CachedDataSink::setup(stem, Arc::clone(&format), start, end, encoding).unwrap();
        for i in start..=end {
            let mut record = format.new_record();
            record.set("value", Value::Int32(1000 + i as i32)).unwrap();
            sink.write(&record, i, i).unwrap();
        }
        sink.close().unwrap();
    }

    fn value_of(block: &Block) -> i64 {
        let record = block.0.as_record().unwrap();
        record.as_dict()["value"].as_i64().unwrap()
    }

    #[test_case(Encoding::Binary ; "binary")]
    #[test_case(Encoding::Json ; "json")]
    fn test_single_shard_round_trip(encoding: Encoding) {
        let dir = tempfile::tempdir().unwrap();
        let mut formats = prefix_with_format(dir.path());
        let stem = dir.path().join("cache/ab/cd/ef/0123.data");
        std::fs::create_dir_all(stem.parent().unwrap()).unwrap();
        write_shard(&mut formats, &stem, 0, 3, encoding);

        let mut source = CachedDataSource::open(&stem, &mut formats, CachedSourceOptions::default()).unwrap();
        assert_eq!(source.len().unwrap(), 4);
        assert_eq!(source.data_indices().unwrap(), vec![(0, 0), (1, 1), (2, 2), (3, 3)]);
        for i in 0..4 {
            let block = source.get(i).unwrap().unwrap();
            assert_eq!((block.1, block.2), (i, i));
            assert_eq!(value_of(&block), 1000 + i);
        }
        assert!(source.get(4).unwrap().is_none());
        assert!(source.statistics().bytes > 0);
    }

    #[test]
    fn test_packed_reads_return_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut formats = prefix_with_format(dir.path());
        let stem = dir.path().join("s.data");
        write_shard(&mut formats, &stem, 0, 1, Encoding::Binary);

        let options = CachedSourceOptions {
            unpack: false,
            ..CachedSourceOptions::default()
        };
        let mut source = CachedDataSource::open(&stem, &mut formats, options).unwrap();
        let (data, _, _) = source.get(1).unwrap().unwrap();
        assert_eq!(data.to_packed().unwrap(), 1001i32.to_le_bytes().to_vec());
    }

    fn three_shards(dir: &Path) -> (DataFormatCache, PathBuf) {
        let mut formats = prefix_with_format(dir);
        let stem = dir.join("stream.data");
        for (s, e) in [(20, 29), (0, 9), (10, 19)] {
            write_shard(&mut formats, &stem, s, e, Encoding::Binary);
        }
        (formats, stem)
    }

    #[test]
    fn test_multi_shard_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let (mut formats, stem) = three_shards(dir.path());
        let mut source = CachedDataSource::open(&stem, &mut formats, CachedSourceOptions::default()).unwrap();
        assert_eq!(source.filenames().len(), 3);
        assert_eq!(source.len().unwrap(), 30);
        for i in 0..30 {
            let block = source.get(i).unwrap().unwrap();
            assert_eq!(block.1, i);
            assert_eq!(value_of(&block), 1000 + i);
        }
    }

    #[test_case(14, 18, 5 ; "inside one shard")]
    #[test_case(4, 18, 15 ; "across two shards")]
    #[test_case(4, 28, 25 ; "across three shards")]
    fn test_window_selection(start: i64, end: i64, expected: usize) {
        let dir = tempfile::tempdir().unwrap();
        let (mut formats, stem) = three_shards(dir.path());
        let options = CachedSourceOptions {
            start_index: Some(start),
            end_index: Some(end),
            ..CachedSourceOptions::default()
        };
        let mut source = CachedDataSource::open(&stem, &mut formats, options).unwrap();
        assert_eq!(source.len().unwrap(), expected);
        assert_eq!(source.first_data_index().unwrap(), Some(start));
        assert_eq!(source.last_data_index().unwrap(), Some(end));
    }

    #[test]
    fn test_checksum_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (mut formats, stem) = three_shards(dir.path());
        let target = dir.path().join("stream.10.19.data");
        let mut bytes = std::fs::read(&target).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&target, bytes).unwrap();

        let err = CachedDataSource::open(&stem, &mut formats, CachedSourceOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    }

    #[test]
    fn test_contiguity_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (mut formats, stem) = three_shards(dir.path());
        for ext in ["data", "data.checksum", "index", "index.checksum"] {
            std::fs::remove_file(dir.path().join(format!("stream.10.19.{ext}"))).unwrap();
        }
        let err = CachedDataSource::open(&stem, &mut formats, CachedSourceOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContiguityViolation);
    }

    #[test]
    fn test_missing_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut formats = prefix_with_format(dir.path());
        let err = CachedDataSource::open(&dir.path().join("none.data"), &mut formats, CachedSourceOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_serialization_reopens_current_shard() {
        let dir = tempfile::tempdir().unwrap();
        let (mut formats, stem) = three_shards(dir.path());
        let mut source = CachedDataSource::open(&stem, &mut formats, CachedSourceOptions::default()).unwrap();
        let original = source.get(12).unwrap().unwrap();
        assert!(source.has_open_file());

        let bytes = bincode::serialize(&source).unwrap();
        let mut restored: CachedDataSource = bincode::deserialize(&bytes).unwrap();
        assert!(restored.has_open_file());

        let copy = restored.get(12).unwrap().unwrap();
        assert_eq!((copy.1, copy.2), (original.1, original.2));
        assert_eq!(value_of(&copy), value_of(&original));

        source.reset();
        let bytes = bincode::serialize(&source).unwrap();
        let restored: CachedDataSource = bincode::deserialize(&bytes).unwrap();
        assert!(!restored.has_open_file());
    }

    #[test]
    fn test_json_shard_holds_indented_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut formats = prefix_with_format(dir.path());
        let stem = dir.path().join("j.data");
        write_shard(&mut formats, &stem, 0, 0, Encoding::Json);

        let text = std::fs::read_to_string(dir.path().join("j.0.0.data")).unwrap();
        let body = "{\n    \"value\": 1000\n}\n";
        assert_eq!(text, format!("json\nuser/single_integer/1\n0 0 {}\n{body}", body.len()));
        assert_eq!(json!({"value": 1000}), serde_json::from_str::<serde_json::Value>(body).unwrap());
    }
}
