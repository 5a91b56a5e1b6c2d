//! Fixed-capacity hash table stored inline in caller-supplied memory.
//!
//! The whole table — header, keys, values, chain links — lives in one
//! contiguous byte region the caller provides, so the region can be a
//! plain buffer, a POSIX shared-memory segment, or a memory-mapped
//! file. Nothing in the region is a pointer; every link is a slot
//! index, and a second process can attach to an initialized region
//! with [`ShmTable::open`].
//!
//! Collisions are resolved by linear probing with a member counter on
//! the home slot; values larger than a slot spill across linked
//! fragment slots. Keys longer than the inline area are truncated and
//! compared by length, prefix and MD5 fingerprint, so a false match is
//! theoretically possible but requires all three to collide.
//!
//! The table is deliberately not thread-safe: callers sharing a region
//! serialize writers themselves (a lock on the backing file works).
//!
//! ```
//! use shmtable::{layout, ShmTable};
//!
//! # fn main() -> shmtable::Result<()> {
//! let mut memory = vec![0u8; layout::region_size(100)];
//! let mut table = ShmTable::create(&mut memory)?;
//!
//! table.put_str("e1", "a")?;
//! table.put_str("e2", "b")?;
//! table.put(b"blob", &[7u8; 100])?;
//!
//! assert_eq!(table.get_str("e2")?, "b");
//! assert_eq!(table.len(), 3);
//!
//! table.remove(b"blob")?;
//! assert_eq!(table.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod hash;
pub mod layout;
pub mod region;
mod table;
mod typed;

#[cfg(test)]
mod proptests;

pub use error::{Error, Result};
pub use region::MappedRegion;
pub use table::{Entries, Entry, ShmTable, TableStats};
