//! On-disk layout of cache shards
//!
//! A shard is the quadruple `<stem>.<start>.<end>.data`, `.index`,
//! `.data.checksum` and `.index.checksum`. The data file starts with a two
//! line header (encoding tag, format identifier) followed by records, each
//! framed by an ASCII `"<start> <end> <size>\n"` line.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use beat_data_core::hash::hash_file_contents;
use beat_data_core::{DataIndex, Error, Result};

static SHARD_PATTERN: Lazy<std::result::Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^.*\.(\d+)\.(\d+)\.(data|index)(\.checksum)?$"));

/// Payload encoding of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Packed records
    #[default]
    Binary,
    /// Indented JSON documents, each followed by a newline
    Json,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Binary => f.write_str("binary"),
            Encoding::Json => f.write_str("json"),
        }
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binary" => Ok(Encoding::Binary),
            "json" => Ok(Encoding::Json),
            other => Err(Error::Format(format!(
                "valid encodings are `binary' or `json': `{other}' is invalid"
            ))),
        }
    }
}

/// The two header lines of a data file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Payload encoding
    pub encoding: Encoding,
    /// Data format name, or `analysis:<algorithm>`
    pub format: String,
}

impl Header {
    /// Read a header, returning it with the number of bytes consumed
    pub fn read<R: BufRead>(reader: &mut R) -> Result<(Self, u64)> {
        let mut consumed = 0;
        let mut line = Vec::new();

        consumed += read_line(reader, &mut line)?;
        let encoding = header_text(&line)?.parse()?;

        line.clear();
        let n = read_line(reader, &mut line)?;
        if n == 0 {
            return Err(Error::format("missing data format line in header"));
        }
        consumed += n;
        let format = header_text(&line)?.to_owned();

        Ok((Self { encoding, format }, consumed as u64))
    }

    /// Write the header, returning the number of bytes written
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let text = format!("{}\n{}\n", self.encoding, self.format);
        writer.write_all(text.as_bytes())?;
        Ok(text.len())
    }
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize> {
    Ok(reader.read_until(b'\n', buf)?)
}

fn header_text(line: &[u8]) -> Result<&str> {
    let text = std::str::from_utf8(line).map_err(Error::format)?;
    Ok(text.trim_end_matches(|c: char| c.is_ascii_whitespace()))
}

/// Framing line preceding every record payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLine {
    /// First data index covered
    pub start: DataIndex,
    /// Last data index covered
    pub end: DataIndex,
    /// Payload size in bytes
    pub size: usize,
}

impl FrameLine {
    /// Parse `"<start> <end> <size>"`, trailing whitespace allowed
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        let &[start, end, size] = fields.as_slice() else {
            return Err(Error::Format(format!("invalid record framing `{}'", line.trim_end())));
        };
        let number = |s: &str| -> Result<DataIndex> {
            s.parse()
                .map_err(|_| Error::Format(format!("invalid number `{s}' in record framing")))
        };
        let frame = Self {
            start: number(start)?,
            end: number(end)?,
            size: usize::try_from(number(size)?).map_err(Error::format)?,
        };
        if frame.start < 0 || frame.end < frame.start {
            return Err(Error::Format(format!(
                "invalid record interval [{}, {}]",
                frame.start, frame.end
            )));
        }
        Ok(frame)
    }
}

impl fmt::Display for FrameLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} {}", self.start, self.end, self.size)
    }
}

/// Position of one record inside a data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLocation {
    /// First data index covered
    pub start: DataIndex,
    /// Last data index covered
    pub end: DataIndex,
    /// Offset of the payload from the start of the file
    pub offset: u64,
    /// Payload size in bytes
    pub size: usize,
}

/// Read a data file's header and locate its records without reading payloads
///
/// Only records lying entirely inside the window are returned.
pub fn scan_data_file(
    path: &Path,
    start_index: Option<DataIndex>,
    end_index: Option<DataIndex>,
) -> Result<(Header, Vec<RecordLocation>)> {
    let file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let (header, mut offset) = Header::read(&mut reader)?;
    let mut records = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = read_line(&mut reader, &mut line)?;
        if n == 0 {
            break;
        }
        offset += n as u64;

        let text = std::str::from_utf8(&line).map_err(Error::format)?;
        let frame = FrameLine::parse(text)?;

        if start_index.map_or(true, |s| frame.start >= s) && end_index.map_or(true, |e| frame.end <= e) {
            records.push(RecordLocation {
                start: frame.start,
                end: frame.end,
                offset,
                size: frame.size,
            });
        }

        let size = i64::try_from(frame.size).map_err(Error::format)?;
        reader.seek_relative(size)?;
        offset += frame.size as u64;
    }

    if offset > file_size {
        return Err(Error::Format(format!(
            "`{}' is truncated: the last record ends at byte {offset}, the file has {file_size}",
            path.display()
        )));
    }

    tracing::debug!(
        target: "beat::shard",
        path = %path.display(),
        encoding = %header.encoding,
        format = %header.format,
        records = records.len(),
        "scanned data file"
    );
    Ok((header, records))
}

/// Files of the shards of one stream, each list ordered by start index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardFiles {
    /// `.data` files
    pub data: Vec<PathBuf>,
    /// `.index` files
    pub index: Vec<PathBuf>,
    /// `.data.checksum` files
    pub data_checksum: Vec<PathBuf>,
    /// `.index.checksum` files
    pub index_checksum: Vec<PathBuf>,
}

fn shard_pattern() -> Result<&'static Regex> {
    SHARD_PATTERN
        .as_ref()
        .map_err(|e| Error::InvalidArgument(e.to_string()))
}

/// Interval encoded in a shard file name, if any
pub fn shard_range(path: &Path) -> Option<(DataIndex, DataIndex)> {
    let pattern = shard_pattern().ok()?;
    let name = path.file_name()?.to_str()?;
    let captures = pattern.captures(name)?;
    Some((captures[1].parse().ok()?, captures[2].parse().ok()?))
}

/// Path of a shard's data file, `<stem>.<start>.<end><ext>`
///
/// `path` may carry an extension, which is moved after the interval.
pub fn shard_path(path: &Path, start: DataIndex, end: DataIndex) -> PathBuf {
    let stem = path.with_extension("");
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut name = stem.into_os_string();
    name.push(format!(".{start}.{end}{ext}"));
    PathBuf::from(name)
}

/// Enumerate the shard files of a stream
///
/// `path` is the stream's data file path (`<stem>.data`) or its stem. Files
/// whose interval misses the `[start_index, end_index]` window are skipped.
pub fn all_filenames(
    path: &Path,
    start_index: Option<DataIndex>,
    end_index: Option<DataIndex>,
) -> Result<ShardFiles> {
    let pattern = shard_pattern()?;
    let stem = path.with_extension("");
    let dir = match stem.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = match stem.file_name() {
        Some(name) => format!("{}.", name.to_string_lossy()),
        None => return Ok(ShardFiles::default()),
    };

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ShardFiles::default()),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut candidates: Vec<(DataIndex, String)> = Vec::new();
    for entry in entries {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) {
            continue;
        }
        let range = pattern.captures(&name).and_then(|c| {
            Some((c[1].parse::<DataIndex>().ok()?, c[2].parse::<DataIndex>().ok()?))
        });
        if let Some((start, end)) = range {
            if start_index.is_some_and(|s| end < s) || end_index.is_some_and(|e| start > e) {
                continue;
            }
        }
        candidates.push((range.map_or(0, |r| r.0), name));
    }
    candidates.sort();

    let mut files = ShardFiles::default();
    for (_, name) in candidates {
        let Some(captures) = pattern.captures(&name) else {
            continue;
        };
        let checksum = captures.get(4).is_some();
        let target = match (&captures[3], checksum) {
            ("data", false) => &mut files.data,
            ("data", true) => &mut files.data_checksum,
            ("index", false) => &mut files.index,
            _ => &mut files.index_checksum,
        };
        target.push(dir.join(&name));
    }

    tracing::debug!(
        target: "beat::shard",
        stem = %stem.display(),
        ?start_index,
        ?end_index,
        shards = files.data.len(),
        "discovered shard files"
    );
    Ok(files)
}

/// Read a checksum file, ignoring surrounding whitespace
pub fn read_checksum(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text.trim().to_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
            "checksum file `{}'",
            path.display()
        ))),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Compare a file's content hash with its checksum file
pub fn verify_checksum(path: &Path, checksum_path: &Path) -> Result<()> {
    let expected = read_checksum(checksum_path)?;
    let actual = hash_file_contents(path)?;
    if expected != actual {
        return Err(Error::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Check that data files and their checksums pair up, verify, and are contiguous
pub fn check_consistency(data: &[PathBuf], checksums: &[PathBuf]) -> Result<()> {
    let checksummed: BTreeSet<PathBuf> = checksums.iter().map(|c| c.with_extension("")).collect();
    if let Some(missing) = data.iter().find(|d| !checksummed.contains(*d)) {
        return Err(Error::NotFound(format!(
            "checksum file for `{}' ({} data file(s), {} checksum file(s))",
            missing.display(),
            data.len(),
            checksums.len()
        )));
    }
    if data.len() != checksums.len() {
        return Err(Error::NotFound(format!(
            "data file for one of {} checksum file(s), {} data file(s) found",
            checksums.len(),
            data.len()
        )));
    }

    let mut ranges = Vec::with_capacity(data.len());
    for path in data {
        let mut checksum = path.clone().into_os_string();
        checksum.push(".checksum");
        verify_checksum(path, Path::new(&checksum))?;
        if let Some(range) = shard_range(path) {
            ranges.push((range, path));
        }
    }

    ranges.sort_by_key(|(range, _)| range.0);
    for pair in ranges.windows(2) {
        let ((_, previous_end), previous) = pair[0];
        let ((next_start, _), next) = pair[1];
        if next_start != previous_end + 1 {
            return Err(Error::ContiguityViolation {
                previous: previous.clone(),
                next: next.clone(),
            });
        }
    }
    Ok(())
}

/// Load the start indices of a stream from its `.index` files
///
/// Returns the sorted start indices followed by `last end + 1`.
pub fn load_data_index(cache_root: &Path, hash_path: &Path) -> Result<Vec<DataIndex>> {
    let stem = cache_root.join(hash_path).with_extension("");
    let dir = stem.parent().map(Path::to_path_buf).unwrap_or_default();
    let prefix = stem
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut candidates = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".index") {
                candidates.push(dir.join(name));
            }
        }
    }
    if candidates.is_empty() {
        return Err(Error::NotFound(format!(
            "no index file matching `{}*.index'",
            stem.display()
        )));
    }
    candidates.sort();

    let mut starts = Vec::new();
    let mut last_end = 0;
    for path in &candidates {
        let text = std::fs::read_to_string(path)?;
        let mut end = None;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let mut fields = line.split_ascii_whitespace();
            let mut next = || -> Result<DataIndex> {
                fields
                    .next()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| Error::Format(format!("invalid index line `{line}' in `{}'", path.display())))
            };
            starts.push(next()?);
            end = Some(next()?);
        }
        let end = end.ok_or_else(|| Error::Format(format!("index file `{}' is empty", path.display())))?;

        let mut checksum = path.clone().into_os_string();
        checksum.push(".checksum");
        verify_checksum(path, Path::new(&checksum))?;

        last_end = last_end.max(end);
    }

    starts.sort_unstable();
    starts.push(last_end + 1);
    Ok(starts)
}

/// Load the per-column change points of a database index (`.db` file)
///
/// For every column of the first object, the result holds `0`, each row
/// where the column's value changes, and finally the number of rows.
/// Returns `None` when the index does not exist.
pub fn load_data_index_db(cache_root: &Path, hash_path: &Path) -> Result<Option<Vec<Vec<DataIndex>>>> {
    let path = cache_root.join(hash_path);
    if !path.exists() {
        return Ok(None);
    }

    let rows: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_slice(&std::fs::read(&path)?)?;
    let Some((first, rest)) = rows.split_first() else {
        return Err(Error::Format(format!("database index `{}' is empty", path.display())));
    };

    let columns: Vec<&String> = first.keys().collect();
    let mut current: Vec<&serde_json::Value> = columns.iter().map(|c| &first[c.as_str()]).collect();
    let mut changes: Vec<Vec<DataIndex>> = vec![vec![0]; columns.len()];

    for (row, entry) in rest.iter().enumerate() {
        for (col, name) in columns.iter().enumerate() {
            let value = entry.get(name.as_str()).unwrap_or(&serde_json::Value::Null);
            if value != current[col] {
                changes[col].push(row as DataIndex + 1);
                current[col] = value;
            }
        }
    }
    for column in &mut changes {
        column.push(rows.len() as DataIndex);
    }
    Ok(Some(changes))
}

/// Split the indices common to every list into at most `n` contiguous ranges
///
/// Ranges are cut where the common index first reaches the next multiple of
/// `last common index / n`, so they have roughly equal lengths.
pub fn found_split_ranges(lists: &[Vec<DataIndex>], n: usize) -> Vec<(DataIndex, DataIndex)> {
    if n == 0 || lists.is_empty() || lists.iter().any(Vec::is_empty) {
        return Vec::new();
    }

    let mut common: BTreeSet<DataIndex> = lists[0].iter().copied().collect();
    for list in &lists[1..] {
        let other: BTreeSet<DataIndex> = list.iter().copied().collect();
        common = common.intersection(&other).copied().collect();
    }
    let common: Vec<DataIndex> = common.into_iter().collect();
    let Some(&last) = common.last() else {
        return Vec::new();
    };

    let average = last as f64 / n as f64;
    let mut ranges = Vec::new();
    let mut cuts = 0;
    let mut start = 0;
    for i in 1..common.len() {
        if common[i] as f64 >= (cuts + 1) as f64 * average && cuts < n - 1 {
            ranges.push((common[start], common[i] - 1));
            start = i;
            cuts += 1;
        } else if i == common.len() - 1 {
            ranges.push((common[start], common[i] - 1));
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use beat_data_core::hash;
    use beat_data_core::ErrorKind;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn touch_shard(dir: &Path, stem: &str, start: i64, end: i64) {
        let base = format!("{stem}.{start}.{end}");
        let data = format!("binary\nuser/x/1\n{start} {end} 1\nA");
        let index = format!("{start} {end}\n");
        std::fs::write(dir.join(format!("{base}.data")), &data).unwrap();
        std::fs::write(dir.join(format!("{base}.data.checksum")), hash::hash(&data)).unwrap();
        std::fs::write(dir.join(format!("{base}.index")), &index).unwrap();
        std::fs::write(dir.join(format!("{base}.index.checksum")), hash::hash(&index)).unwrap();
    }

    #[test]
    fn test_header_round_trip_and_crlf() {
        let header = Header {
            encoding: Encoding::Json,
            format: "user/x/1".to_owned(),
        };
        let mut out = Vec::new();
        assert_eq!(header.write(&mut out).unwrap(), 14);
        let (read, consumed) = Header::read(&mut Cursor::new(&out)).unwrap();
        assert_eq!(read, header);
        assert_eq!(consumed, 14);

        let (crlf, consumed) = Header::read(&mut Cursor::new(b"binary\r\nanalysis:user/a/1\r\n")).unwrap();
        assert_eq!(crlf.encoding, Encoding::Binary);
        assert_eq!(crlf.format, "analysis:user/a/1");
        assert_eq!(consumed, 27);
    }

    #[test]
    fn test_header_rejects_unknown_encoding() {
        let err = Header::read(&mut Cursor::new(b"yaml\nuser/x/1\n")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_frame_line() {
        assert_eq!(
            FrameLine::parse("3 5 12\n").unwrap(),
            FrameLine { start: 3, end: 5, size: 12 }
        );
        assert_eq!(FrameLine { start: 3, end: 5, size: 12 }.to_string(), "3 5 12\n");
        assert!(FrameLine::parse("3 5\n").is_err());
        assert!(FrameLine::parse("3 x 5\n").is_err());
        assert!(FrameLine::parse("5 3 1\n").is_err());
    }

    #[test]
    fn test_shard_path() {
        assert_eq!(
            shard_path(Path::new("/c/ab/cd/ef/123.data"), 0, 9),
            PathBuf::from("/c/ab/cd/ef/123.0.9.data")
        );
        assert_eq!(shard_path(Path::new("out"), 4, 5), PathBuf::from("out.4.5"));
        assert_eq!(shard_range(Path::new("/c/123.10.19.data.checksum")), Some((10, 19)));
        assert_eq!(shard_range(Path::new("/c/123.data")), None);
    }

    #[test]
    fn test_shard_pattern_compiled_once() {
        let first = shard_pattern().unwrap();
        for end in 0..100 {
            let name = format!("/c/123.{end}.{end}.index");
            assert_eq!(shard_range(Path::new(&name)), Some((end, end)));
        }
        assert!(std::ptr::eq(first, shard_pattern().unwrap()));
    }

    #[test]
    fn test_all_filenames_sorted_and_windowed() {
        let dir = tempfile::tempdir().unwrap();
        for (s, e) in [(20, 29), (0, 9), (10, 19)] {
            touch_shard(dir.path(), "stream", s, e);
        }
        touch_shard(dir.path(), "other", 0, 9);

        let all = all_filenames(&dir.path().join("stream.data"), None, None).unwrap();
        let starts: Vec<_> = all.data.iter().map(|p| shard_range(p).unwrap().0).collect();
        assert_eq!(starts, [0, 10, 20]);
        assert_eq!(all.index.len(), 3);
        assert_eq!(all.data_checksum.len(), 3);
        assert_eq!(all.index_checksum.len(), 3);

        let window = all_filenames(&dir.path().join("stream.data"), Some(14), Some(18)).unwrap();
        assert_eq!(window.data, vec![dir.path().join("stream.10.19.data")]);

        let missing = all_filenames(&dir.path().join("nothing/here.data"), None, None).unwrap();
        assert_eq!(missing, ShardFiles::default());
    }

    #[test]
    fn test_check_consistency() {
        let dir = tempfile::tempdir().unwrap();
        for (s, e) in [(0, 9), (10, 19), (20, 29)] {
            touch_shard(dir.path(), "s", s, e);
        }
        let files = all_filenames(&dir.path().join("s.data"), None, None).unwrap();
        check_consistency(&files.data, &files.data_checksum).unwrap();

        std::fs::remove_file(dir.path().join("s.10.19.data")).unwrap();
        std::fs::remove_file(dir.path().join("s.10.19.data.checksum")).unwrap();
        let files = all_filenames(&dir.path().join("s.data"), None, None).unwrap();
        match check_consistency(&files.data, &files.data_checksum).unwrap_err() {
            Error::ContiguityViolation { previous, next } => {
                assert_eq!(previous, dir.path().join("s.0.9.data"));
                assert_eq!(next, dir.path().join("s.20.29.data"));
            }
            other => panic!("unexpected error {other}"),
        }

        std::fs::remove_file(dir.path().join("s.0.9.data.checksum")).unwrap();
        let files = all_filenames(&dir.path().join("s.data"), None, None).unwrap();
        let err = check_consistency(&files.data, &files.data_checksum).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_scan_data_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.0.2.data");
        std::fs::write(&path, b"binary\nuser/x/1\n0 0 2\nab1 2 3\ncde").unwrap();

        let (header, records) = scan_data_file(&path, None, None).unwrap();
        assert_eq!(header.format, "user/x/1");
        assert_eq!(
            records,
            vec![
                RecordLocation { start: 0, end: 0, offset: 22, size: 2 },
                RecordLocation { start: 1, end: 2, offset: 30, size: 3 },
            ]
        );

        let (_, window) = scan_data_file(&path, Some(1), None).unwrap();
        assert_eq!(window.len(), 1);

        std::fs::write(&path, b"binary\nuser/x/1\n0 0 20\nab").unwrap();
        assert_eq!(
            scan_data_file(&path, None, None).unwrap_err().kind(),
            ErrorKind::Format
        );
    }

    #[test]
    fn test_load_data_index() {
        let dir = tempfile::tempdir().unwrap();
        let stream = dir.path().join("ab/cd");
        std::fs::create_dir_all(&stream).unwrap();
        for (s, e) in [(4, 9), (0, 3)] {
            let index = format!("{s} {}\n{} {e}\n", s + 1, s + 2);
            let path = stream.join(format!("ef12.{s}.{e}.index"));
            std::fs::write(&path, &index).unwrap();
            std::fs::write(stream.join(format!("ef12.{s}.{e}.index.checksum")), hash::hash(&index)).unwrap();
        }

        let indices = load_data_index(dir.path(), Path::new("ab/cd/ef12.data")).unwrap();
        assert_eq!(indices, vec![0, 2, 4, 6, 10]);

        std::fs::write(stream.join("ef12.0.3.index.checksum"), "0000").unwrap();
        let err = load_data_index(dir.path(), Path::new("ab/cd/ef12.data")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);

        let err = load_data_index(dir.path(), Path::new("ab/cd/none.data")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_load_data_index_db() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("set.db"),
            r#"[{"a": 1, "b": "x"}, {"a": 1, "b": "y"}, {"a": 2, "b": "y"}, {"a": 2, "b": "z"}]"#,
        )
        .unwrap();

        let changes = load_data_index_db(dir.path(), Path::new("set.db")).unwrap().unwrap();
        assert_eq!(changes, vec![vec![0, 2, 4], vec![0, 1, 3, 4]]);
        assert!(load_data_index_db(dir.path(), Path::new("none.db")).unwrap().is_none());
    }

    #[test]
    fn test_found_split_ranges() {
        let lists = vec![vec![0, 2, 4, 6, 8, 10], vec![0, 1, 2, 4, 6, 8, 10]];
        assert_eq!(found_split_ranges(&lists, 2), vec![(0, 5), (6, 9)]);
        assert_eq!(found_split_ranges(&lists, 1), vec![(0, 9)]);
        assert!(found_split_ranges(&[vec![0, 1], vec![]], 2).is_empty());
        assert!(found_split_ranges(&[], 2).is_empty());
    }

    proptest! {
        #[test]
        fn prop_split_ranges_are_contiguous(
            starts in proptest::collection::btree_set(1i64..500, 1..40),
            n in 1usize..6,
        ) {
            let mut list: Vec<i64> = vec![0];
            list.extend(starts);
            let ranges = found_split_ranges(&[list.clone()], n);
            prop_assert!(ranges.len() <= n);
            if list.len() > 1 {
                prop_assert_eq!(ranges.first().map(|r| r.0), Some(0));
                prop_assert_eq!(ranges.last().map(|r| r.1), list.last().map(|l| l - 1));
            }
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[1].0, pair[0].1 + 1);
            }
        }
    }
}
