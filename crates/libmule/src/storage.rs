use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use parking_lot::RwLock;

/// Where a transfer's bytes live. All calls block and are run on the
/// blocking pool by the session.
pub trait TransferStorage: Send + Sync {
    fn pread_exact(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()>;

    fn pwrite_all(&self, offset: u64, buf: &[u8]) -> anyhow::Result<()>;

    fn ensure_len(&self, len: u64) -> anyhow::Result<()>;

    fn path(&self) -> Option<&Path> {
        None
    }
}

pub struct FilesystemStorage {
    filename: PathBuf,
    file: RwLock<File>,
}

impl std::fmt::Debug for FilesystemStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FilesystemStorage({:?})", self.filename)
    }
}

impl FilesystemStorage {
    /// Opens the file for read/write, creating it and its parent directory.
    pub fn open(filename: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let filename = filename.into();
        if let Some(parent) = filename.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("error creating directory {parent:?}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&filename)
            .with_context(|| format!("error opening {filename:?} in read/write mode"))?;
        Ok(Self {
            filename,
            file: RwLock::new(file),
        })
    }
}

impl TransferStorage for FilesystemStorage {
    fn pread_exact(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let mut g = self.file.write();
        g.seek(SeekFrom::Start(offset))?;
        g.read_exact(buf)
            .with_context(|| format!("error reading {} bytes at {offset}", buf.len()))?;
        Ok(())
    }

    fn pwrite_all(&self, offset: u64, buf: &[u8]) -> anyhow::Result<()> {
        let mut g = self.file.write();
        g.seek(SeekFrom::Start(offset))?;
        g.write_all(buf)
            .with_context(|| format!("error writing {} bytes at {offset}", buf.len()))?;
        Ok(())
    }

    fn ensure_len(&self, len: u64) -> anyhow::Result<()> {
        let g = self.file.write();
        let current = g.metadata()?.len();
        if current < len {
            g.set_len(len)
                .with_context(|| format!("error setting length of {:?} to {len}", self.filename))?;
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.filename)
    }
}

/// Keeps the whole file in memory.
#[derive(Default)]
pub struct InMemoryStorage {
    data: RwLock<Vec<u8>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl TransferStorage for InMemoryStorage {
    fn pread_exact(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let g = self.data.read();
        let start = offset as usize;
        let src = g
            .get(start..start + buf.len())
            .with_context(|| format!("read of {} bytes at {offset} out of bounds", buf.len()))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn pwrite_all(&self, offset: u64, buf: &[u8]) -> anyhow::Result<()> {
        let mut g = self.data.write();
        let start = offset as usize;
        let end = start + buf.len();
        if g.len() < end {
            g.resize(end, 0);
        }
        g[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn ensure_len(&self, len: u64) -> anyhow::Result<()> {
        let mut g = self.data.write();
        if (g.len() as u64) < len {
            g.resize(len as usize, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(s: &dyn TransferStorage) {
        s.ensure_len(100).unwrap();
        s.pwrite_all(10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        s.pread_exact(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        let mut buf = [0u8; 10];
        assert!(s.pread_exact(95, &mut buf).is_err());
    }

    #[test]
    fn test_in_memory() {
        roundtrip(&InMemoryStorage::new());
    }

    #[test]
    fn test_filesystem() {
        let dir = tempfile::TempDir::with_prefix("libmule-storage").unwrap();
        let s = FilesystemStorage::open(dir.path().join("sub").join("file.bin")).unwrap();
        roundtrip(&s);
        assert_eq!(std::fs::metadata(s.path().unwrap()).unwrap().len(), 100);
    }
}
