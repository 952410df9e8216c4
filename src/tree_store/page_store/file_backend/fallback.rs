use crate::{Result, StorageBackend};
use parking_lot::Mutex;
use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};

/// Stores a tree as a file on-disk.
///
/// No file lock is taken on this platform, so the caller must not open the same file twice.
#[derive(Debug)]
pub struct FileBackend {
    file: Mutex<File>,
}

impl FileBackend {
    /// Creates a new backend which stores data to the given file.
    pub fn new(file: File) -> Result<Self> {
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl StorageBackend for FileBackend {
    fn len(&self) -> Result<u64, io::Error> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), io::Error> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(out)
    }

    fn set_len(&self, len: u64) -> Result<(), io::Error> {
        self.file.lock().set_len(len)
    }

    fn sync_data(&self) -> Result<(), io::Error> {
        self.file.lock().sync_data()
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), io::Error> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }
}
