//! File handles returned to the storage engine
//!
//! The variant is chosen once, when the file is opened, from the path's role
//! and the local-copy policy. Callers dispatch on the handle without ever
//! recovering a concrete type.

use crate::error::Result;
use crate::remote_file::{RemoteReadableFile, RemoteWritableFile};
use crate::tailer::LogSegmentWriter;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Access hints supplied when opening a file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileOptions {
    /// Memory-map the file for reads
    pub use_mmap_reads: bool,
    /// Memory-map the file for writes
    pub use_mmap_writes: bool,
}

impl FileOptions {
    /// Request memory-mapped reads
    pub fn with_mmap_reads(mut self) -> Self {
        self.use_mmap_reads = true;
        self
    }

    /// Whether any memory mapping is requested
    pub fn wants_mmap(&self) -> bool {
        self.use_mmap_reads || self.use_mmap_writes
    }
}

/// A local file opened for reading
pub struct LocalReadFile {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
    position: u64,
}

impl LocalReadFile {
    /// Open an existing file
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            position: 0,
        })
    }

    /// Path on local disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read up to `n` bytes at `offset`
    pub async fn read_at(&self, offset: u64, n: usize) -> Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = file.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    /// Read up to `n` bytes from the current position
    pub async fn read(&mut self, n: usize) -> Result<Bytes> {
        let data = self.read_at(self.position, n).await?;
        self.position += data.len() as u64;
        Ok(data)
    }

    /// Advance the sequential position
    pub fn skip(&mut self, n: u64) {
        self.position = self.position.saturating_add(n);
    }

    /// Current size on disk
    pub async fn size(&self) -> Result<u64> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }
}

/// A local file opened for writing
pub struct LocalWriteFile {
    path: PathBuf,
    file: tokio::fs::File,
    written: u64,
}

impl LocalWriteFile {
    /// Create or truncate a file
    pub async fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written: 0,
        })
    }

    /// Path on local disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append bytes
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Flush to stable storage
    pub async fn sync(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }
}

/// A file opened for sequential or random reads
pub enum ReadableFile {
    /// Plain local file, or a table file served from its local replica
    LocalFile(LocalReadFile),
    /// Table file read straight from the object store
    RemoteTableFile(RemoteReadableFile),
    /// Log segment read from the tailer's cache
    TailedLogFile(LocalReadFile),
}

impl ReadableFile {
    /// Read up to `n` bytes from the current position
    pub async fn read(&mut self, n: usize) -> Result<Bytes> {
        match self {
            ReadableFile::LocalFile(f) | ReadableFile::TailedLogFile(f) => f.read(n).await,
            ReadableFile::RemoteTableFile(f) => f.read(n).await,
        }
    }

    /// Read up to `n` bytes at `offset`
    pub async fn read_at(&self, offset: u64, n: usize) -> Result<Bytes> {
        match self {
            ReadableFile::LocalFile(f) | ReadableFile::TailedLogFile(f) => f.read_at(offset, n).await,
            ReadableFile::RemoteTableFile(f) => f.read_at(offset, n).await,
        }
    }

    /// Advance the sequential position
    pub fn skip(&mut self, n: u64) {
        match self {
            ReadableFile::LocalFile(f) | ReadableFile::TailedLogFile(f) => f.skip(n),
            ReadableFile::RemoteTableFile(f) => f.skip(n),
        }
    }

    /// Size of the file
    pub async fn size(&self) -> Result<u64> {
        match self {
            ReadableFile::LocalFile(f) | ReadableFile::TailedLogFile(f) => f.size().await,
            ReadableFile::RemoteTableFile(f) => Ok(f.size()),
        }
    }

    /// Read from the current position to the end
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read(64 * 1024).await?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }
}

/// A file opened for writing
pub enum WritableFile {
    /// Plain local file
    LocalFile(LocalWriteFile),
    /// Table file uploaded to the object store
    RemoteTableFile(RemoteWritableFile),
    /// Log segment published to the log stream
    TailedLogFile(LogSegmentWriter),
}

impl WritableFile {
    /// Append bytes
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        match self {
            WritableFile::LocalFile(f) => f.append(data).await,
            WritableFile::RemoteTableFile(f) => f.append(data).await,
            WritableFile::TailedLogFile(f) => f.append(data).await,
        }
    }

    /// Make appended bytes durable
    pub async fn sync(&mut self) -> Result<()> {
        match self {
            WritableFile::LocalFile(f) => f.sync().await,
            WritableFile::RemoteTableFile(f) => f.sync().await,
            WritableFile::TailedLogFile(f) => f.sync().await,
        }
    }

    /// Finish the file
    pub async fn close(&mut self) -> Result<()> {
        match self {
            WritableFile::LocalFile(f) => f.sync().await,
            WritableFile::RemoteTableFile(f) => f.close().await,
            WritableFile::TailedLogFile(f) => f.close().await,
        }
    }

    /// Bytes appended so far
    pub fn size(&self) -> u64 {
        match self {
            WritableFile::LocalFile(f) => f.written,
            WritableFile::RemoteTableFile(f) => f.size(),
            WritableFile::TailedLogFile(f) => f.size(),
        }
    }
}

/// A directory opened for syncing its entries
pub struct Directory {
    path: PathBuf,
}

impl Directory {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path on local disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush directory entries to stable storage
    pub async fn fsync(&self) -> Result<()> {
        let dir = tokio::fs::File::open(&self.path).await?;
        dir.sync_all().await?;
        Ok(())
    }
}

/// Token returned by `lock_file`; holds no remote lock
#[derive(Debug)]
pub struct FileLock {
    path: String,
}

impl FileLock {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }

    /// Path the lock was requested for
    pub fn path(&self) -> &str {
        &self.path
    }
}
