use crate::tree_store::page_store::FileBackend;
use crate::{Result, StorageBackend};
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::File;
use std::io;

/// Stores a tree in a memory-mapped file.
///
/// The mapping is recreated whenever the file length changes.
#[derive(Debug)]
pub struct MmapBackend {
    file: FileBackend,
    mmap: RwLock<Option<MmapMut>>,
}

impl MmapBackend {
    /// Creates a new backend which maps the given file. Takes the same exclusive lock as
    /// [`FileBackend`].
    pub fn new(file: File) -> Result<Self> {
        let file = FileBackend::new(file)?;
        let mmap = Self::map(file.file())?;
        Ok(Self {
            file,
            mmap: RwLock::new(mmap),
        })
    }

    fn map(file: &File) -> Result<Option<MmapMut>, io::Error> {
        if file.metadata()?.len() == 0 {
            // Zero length mappings are rejected by the OS
            return Ok(None);
        }
        // Safety: the file is exclusively locked by this process, and all access to the
        // mapping goes through the RwLock above
        Ok(Some(unsafe { MmapMut::map_mut(file)? }))
    }

    fn out_of_range() -> io::Error {
        io::Error::new(io::ErrorKind::InvalidInput, "Index out-of-range.")
    }
}

impl StorageBackend for MmapBackend {
    fn len(&self) -> Result<u64, io::Error> {
        Ok(self.mmap.read().as_ref().map_or(0, |m| m.len() as u64))
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), io::Error> {
        let guard = self.mmap.read();
        let mmap = guard.as_ref().ok_or_else(Self::out_of_range)?;
        let offset = usize::try_from(offset).map_err(|_| Self::out_of_range())?;
        if offset + out.len() <= mmap.len() {
            out.copy_from_slice(&mmap[offset..offset + out.len()]);
            Ok(())
        } else {
            Err(Self::out_of_range())
        }
    }

    fn set_len(&self, len: u64) -> Result<(), io::Error> {
        let mut guard = self.mmap.write();
        if let Some(mmap) = guard.take() {
            mmap.flush()?;
        }
        self.file.set_len(len)?;
        *guard = Self::map(self.file.file())?;
        Ok(())
    }

    fn sync_data(&self) -> Result<(), io::Error> {
        if let Some(mmap) = self.mmap.read().as_ref() {
            mmap.flush()?;
        }
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), io::Error> {
        let mut guard = self.mmap.write();
        let mmap = guard.as_mut().ok_or_else(Self::out_of_range)?;
        let offset = usize::try_from(offset).map_err(|_| Self::out_of_range())?;
        if offset + data.len() <= mmap.len() {
            mmap[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        } else {
            Err(Self::out_of_range())
        }
    }
}
