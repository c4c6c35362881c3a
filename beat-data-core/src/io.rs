//! Read handles on shard data files

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};

use crate::error::{Error, Result};

/// Memory-mapped file for zero-copy reads
pub struct MemoryMappedFile {
    /// The memory map
    mmap: Mmap,

    /// The path to the file
    path: PathBuf,

    /// The size of the file in bytes
    size: usize,
}

impl MemoryMappedFile {
    /// Open a file for memory-mapped reading
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len() as usize;

        // SAFETY: shards are immutable once their checksums are written.
        #[allow(unsafe_code)]
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        Ok(Self { mmap, path, size })
    }

    /// Get a slice of the whole file
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    /// Get a subslice of the file
    pub fn slice(&self, offset: usize, length: usize) -> Result<&[u8]> {
        let end = offset.checked_add(length).filter(|end| *end <= self.size);
        match end {
            Some(end) => Ok(&self.mmap[offset..end]),
            None => Err(Error::Format(format!(
                "truncated record in `{}': {length} byte(s) at offset {offset}, file has {}",
                self.path.display(),
                self.size
            ))),
        }
    }

    /// Get the path to the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the size of the file
    pub fn size(&self) -> usize {
        self.size
    }
}

impl std::fmt::Debug for MemoryMappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMappedFile")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

/// Open read handle on one shard data file
///
/// A handle either seeks through a buffered reader or slices a memory map.
#[derive(Debug)]
pub enum ShardHandle {
    /// Buffered reads with explicit seeks
    Buffered {
        /// Reader over the file
        reader: BufReader<File>,
        /// The path to the file
        path: PathBuf,
    },

    /// Slices of a memory map
    Mapped(MemoryMappedFile),
}

impl ShardHandle {
    /// Open a data file, memory-mapping it if requested
    pub fn open<P: AsRef<Path>>(path: P, memory_map: bool) -> Result<Self> {
        let path = path.as_ref();
        if memory_map {
            return Ok(ShardHandle::Mapped(MemoryMappedFile::open(path)?));
        }
        let file = File::open(path)?;
        Ok(ShardHandle::Buffered {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Path of the open file
    pub fn path(&self) -> &Path {
        match self {
            ShardHandle::Buffered { path, .. } => path,
            ShardHandle::Mapped(mmap) => mmap.path(),
        }
    }

    /// Read `size` bytes starting at `offset`
    pub fn read_at(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        match self {
            ShardHandle::Buffered { reader, path } => {
                reader.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; size];
                reader.read_exact(&mut buf).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        Error::Format(format!(
                            "truncated record in `{}': {size} byte(s) at offset {offset}",
                            path.display()
                        ))
                    } else {
                        Error::Io(e)
                    }
                })?;
                Ok(buf)
            }
            ShardHandle::Mapped(mmap) => {
                let offset = usize::try_from(offset).map_err(Error::format)?;
                Ok(mmap.slice(offset, size)?.to_vec())
            }
        }
    }
}
