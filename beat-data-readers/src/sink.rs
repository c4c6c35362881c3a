//! Destinations for the records written by outputs

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value as JsonValue;

use beat_data_core::dataformat::UNNAMED_DATAFORMAT;
use beat_data_core::hash::hash_file_contents;
use beat_data_core::utils::{safe_rmfile, write_atomic};
use beat_data_core::{json, Casting, DataFormat, DataIndex, Error, IoStatistics, Record, Result};

use crate::shard::{self, Encoding, FrameLine, Header};

/// Base trait for all data sinks
pub trait DataSink: Send {
    /// Write one record covering `[start, end]`
    fn write(&mut self, data: &dyn Record, start: DataIndex, end: DataIndex) -> Result<()>;

    /// Whether the sink accepts writes
    fn is_connected(&self) -> bool;

    /// Finish writing and release resources
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Bytes written and time spent writing so far
    fn statistics(&self) -> IoStatistics {
        IoStatistics::default()
    }
}

/// Sink printing one line per written record, for debugging
///
/// Records are lost after printing.
#[derive(Debug)]
pub struct StdoutDataSink<W: Write + Send = std::io::Stdout> {
    writer: W,
    prefix: String,
    display_data: bool,
}

impl StdoutDataSink {
    /// Print to the standard output
    pub fn stdout(prefix: Option<&str>, display_data: bool) -> Self {
        Self::new(std::io::stdout(), prefix, display_data)
    }
}

impl<W: Write + Send> StdoutDataSink<W> {
    /// Print to `writer`, each line starting with `prefix`
    pub fn new(writer: W, prefix: Option<&str>, display_data: bool) -> Self {
        let prefix = match prefix {
            Some(p) if !p.is_empty() => format!("{p} "),
            _ => String::new(),
        };
        Self {
            writer,
            prefix,
            display_data,
        }
    }

    /// Recover the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> DataSink for StdoutDataSink<W> {
    fn write(&mut self, data: &dyn Record, start: DataIndex, end: DataIndex) -> Result<()> {
        if self.display_data {
            writeln!(self.writer, "{}({start} -> {end}): {}", self.prefix, data.as_dict())?;
        } else {
            writeln!(self.writer, "{}({start} -> {end}): <data>", self.prefix)?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Sink producing one cache shard
///
/// The shard only persists if writes reach the declared end index; closing
/// earlier removes the partial data and index files.
#[derive(Debug)]
pub struct CachedDataSink {
    data_path: PathBuf,
    index_path: PathBuf,
    encoding: Encoding,
    format: Arc<DataFormat>,
    start_index: DataIndex,
    end_index: DataIndex,
    files: Option<(BufWriter<File>, BufWriter<File>)>,
    last_written_data_index: Option<DataIndex>,
    nb_bytes_written: u64,
    stats: IoStatistics,
}

impl CachedDataSink {
    /// Create the data and index files of the shard `[start_index, end_index]`
    ///
    /// Files are named `<stem>.<start>.<end>.data` and `.index`, `path`
    /// being the stream's data file path.
    pub fn setup(
        path: &Path,
        format: Arc<DataFormat>,
        start_index: DataIndex,
        end_index: DataIndex,
        encoding: Encoding,
    ) -> Result<Self> {
        if format.name() == UNNAMED_DATAFORMAT {
            return Err(Error::InvalidArgument(
                "cannot record data using an unnamed data format".to_owned(),
            ));
        }
        if end_index < start_index {
            return Err(Error::OutOfRange(format!(
                "shard end {end_index} lies before its start {start_index}"
            )));
        }

        let data_path = shard::shard_path(&path.with_extension("data"), start_index, end_index);
        let index_path = data_path.with_extension("index");
        if let Some(dir) = data_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let mut data_file = BufWriter::new(File::create(&data_path)?);
        let index_file = match File::create(&index_path) {
            Ok(file) => BufWriter::new(file),
            Err(e) => {
                drop(data_file);
                safe_rmfile(&data_path)?;
                return Err(Error::Io(e));
            }
        };

        let header = Header {
            encoding,
            format: format.name().to_owned(),
        };
        let written = header
            .write(&mut data_file)
            .and_then(|_| data_file.flush().map_err(Error::from));
        if let Err(e) = written {
            drop(data_file);
            drop(index_file);
            safe_rmfile(&data_path)?;
            safe_rmfile(&index_path)?;
            return Err(e);
        }

        tracing::debug!(
            target: "beat::sink",
            path = %data_path.display(),
            start_index,
            end_index,
            %encoding,
            "cache sink ready"
        );

        Ok(Self {
            data_path,
            index_path,
            encoding,
            format,
            start_index,
            end_index,
            files: Some((data_file, index_file)),
            last_written_data_index: None,
            nb_bytes_written: 0,
            stats: IoStatistics::default(),
        })
    }

    /// Path of the data file
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Path of the index file
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Interval the shard must cover
    pub fn range(&self) -> (DataIndex, DataIndex) {
        (self.start_index, self.end_index)
    }

    /// End index of the last write
    pub fn last_written_data_index(&self) -> Option<DataIndex> {
        self.last_written_data_index
    }

    /// Total bytes written, framing and index lines included
    pub fn nb_bytes_written(&self) -> u64 {
        self.nb_bytes_written
    }

    /// Write a record given as a dictionary of its attributes
    pub fn write_dict(&mut self, data: &JsonValue, start: DataIndex, end: DataIndex) -> Result<()> {
        let mut record = self.format.new_record();
        record.from_dict(data, Casting::Safe, false)?;
        self.write(&record, start, end)
    }

    fn encode(&self, data: &dyn Record) -> Result<Vec<u8>> {
        match self.encoding {
            Encoding::Binary => data.pack(),
            Encoding::Json => {
                let mut encoded = json::to_pretty_vec(&data.as_dict())?;
                encoded.push(b'\n');
                Ok(encoded)
            }
        }
    }

    fn finish(&mut self, data_file: BufWriter<File>, index_file: BufWriter<File>) -> Result<()> {
        let data_file = data_file.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        let index_file = index_file.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        data_file.sync_all()?;
        index_file.sync_all()?;
        drop((data_file, index_file));

        let complete = self
            .last_written_data_index
            .is_some_and(|last| last >= self.end_index);
        if !complete {
            let reason = match self.last_written_data_index {
                None => "no data written".to_owned(),
                Some(last) => format!("last written {last} vs end {}", self.end_index),
            };
            tracing::warn!(
                target: "beat::sink",
                path = %self.data_path.display(),
                %reason,
                "removing partial cache files"
            );
            safe_rmfile(&self.data_path)?;
            safe_rmfile(&self.index_path)?;
            return Ok(());
        }

        for path in [&self.data_path, &self.index_path] {
            let checksum = hash_file_contents(path)?;
            let mut checksum_path = path.clone().into_os_string();
            checksum_path.push(".checksum");
            write_atomic(Path::new(&checksum_path), checksum.as_bytes())?;
            tracing::debug!(target: "beat::sink", path = %path.display(), %checksum, "wrote checksum");
        }
        Ok(())
    }
}

impl DataSink for CachedDataSink {
    fn write(&mut self, data: &dyn Record, start: DataIndex, end: DataIndex) -> Result<()> {
        if data.format_name() != self.format.name() {
            return Err(Error::SchemaMismatch {
                expected: self.format.name().to_owned(),
                actual: data.format_name().to_owned(),
            });
        }
        let encoded = self.encode(data)?;
        let Some((data_file, index_file)) = self.files.as_mut() else {
            return Err(Error::InvalidOperation(format!(
                "no destination file, `{}' is closed",
                self.data_path.display()
            )));
        };

        let frame = FrameLine {
            start,
            end,
            size: encoded.len(),
        }
        .to_string();
        let index_line = format!("{start} {end}\n");

        let started = Instant::now();
        data_file.write_all(frame.as_bytes())?;
        data_file.write_all(&encoded)?;
        data_file.flush()?;
        index_file.write_all(index_line.as_bytes())?;
        index_file.flush()?;

        let written = frame.len() + encoded.len() + index_line.len();
        self.stats.record(written, started.elapsed());
        self.nb_bytes_written += written as u64;
        self.last_written_data_index = Some(end);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.files.is_some()
    }

    fn close(&mut self) -> Result<()> {
        match self.files.take() {
            Some((data_file, index_file)) => self.finish(data_file, index_file),
            None => Ok(()),
        }
    }

    fn statistics(&self) -> IoStatistics {
        self.stats
    }
}

impl Drop for CachedDataSink {
    fn drop(&mut self) {
        if let Err(e) = DataSink::close(self) {
            tracing::warn!(
                target: "beat::sink",
                path = %self.data_path.display(),
                error = %e,
                "failed to close cache sink"
            );
        }
    }
}
