//! File-backed region provider.
//!
//! The table itself only needs a byte slice; this module covers the
//! common case of backing that slice with a memory-mapped file so the
//! table can be shared between processes or survive its creator. The
//! mapping is page-aligned, which satisfies the table's alignment rule.
//!
//! Locking stays with the caller: processes sharing a mapping must
//! serialize writers themselves (a lock on the backing file works).

use std::fs;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::Result;
use crate::layout;

/// A writable memory-mapped file sized for a table region.
pub struct MappedRegion {
    mmap: MmapMut,
    path: PathBuf,
}

impl MappedRegion {
    /// Create (or truncate) the backing file, sized for `max_slots`
    /// slots, and map it. The fresh mapping is zeroed and ready for
    /// [`crate::ShmTable::create`].
    pub fn create<P: AsRef<Path>>(path: P, max_slots: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(layout::region_size(max_slots) as u64)?;

        // Safety: the file was just created and is not shared yet.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap.fill(0);

        Ok(MappedRegion {
            mmap,
            path: path.to_path_buf(),
        })
    }

    /// Map an existing backing file for re-attach via
    /// [`crate::ShmTable::open`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;

        // Safety: concurrent writers are the caller's responsibility,
        // per the crate-level locking contract.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(MappedRegion {
            mmap,
            path: path.to_path_buf(),
        })
    }

    /// The mapped bytes, for attaching a table.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush dirty pages to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Remove the backing file. The mapping stays usable until drop.
    pub fn unlink(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ShmTable;
    use tempfile::TempDir;

    #[test]
    fn create_sizes_file_for_slots() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.shm");
        let mut region = MappedRegion::create(&path, 100).unwrap();
        assert_eq!(region.len(), layout::region_size(100));

        let table = ShmTable::create(region.bytes_mut()).unwrap();
        assert_eq!(table.stats().max_slots, 100);
    }

    #[test]
    fn reattach_through_backing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.shm");

        {
            let mut region = MappedRegion::create(&path, 50).unwrap();
            let mut table = ShmTable::create(region.bytes_mut()).unwrap();
            table.put_str("k1", "persisted").unwrap();
            table.put_int("k2", 1234).unwrap();
            region.flush().unwrap();
        }

        // A second mapping of the same file sees the same table.
        let mut region = MappedRegion::open(&path).unwrap();
        let table = ShmTable::open(region.bytes_mut()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get_str("k1").unwrap(), "persisted");
        assert_eq!(table.get_int("k2").unwrap(), 1234);
    }

    #[test]
    fn unlink_removes_backing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.shm");
        let region = MappedRegion::create(&path, 10).unwrap();
        assert!(path.exists());
        region.unlink().unwrap();
        assert!(!path.exists());
    }
}
