//! The table core: probing, lookup, insertion with home eviction,
//! multi-slot value chains, removal and iteration.
//!
//! A [`ShmTable`] is a thin handle over a caller-supplied byte region.
//! All state lives inline in the region (header + slot array); the
//! handle itself holds nothing but the base pointer, so destroying it
//! never touches the region and another process may re-attach with
//! [`ShmTable::open`].
//!
//! The table is intentionally not thread-safe. All operations mutate
//! shared header/slot state without synchronization; callers sharing a
//! region across threads or processes must serialize writers (and
//! writers against readers) themselves, for example with a file lock.

use std::marker::PhantomData;
use std::ptr;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::hash;
use crate::layout::{
    region_size, Header, Slot, EXT_INLINE, HEADER_SIZE, KEY_INLINE, SLOT_NONE, SLOT_SIZE,
    TAG_COLLISION, TAG_SPILL, VALUE_INLINE,
};

/// Fixed-capacity hash table stored inline in a borrowed memory region.
pub struct ShmTable<'a> {
    base: *mut u8,
    _region: PhantomData<&'a mut [u8]>,
}

// All &self methods only read the region; mutation requires &mut self.
// Writers sharing a region across processes must still serialize
// externally.
unsafe impl Send for ShmTable<'_> {}
unsafe impl Sync for ShmTable<'_> {}

/// One element yielded by [`ShmTable::get_next`].
///
/// `key` holds at most [`KEY_INLINE`] bytes: keys longer than the
/// inline area are returned truncated, with no terminator — the length
/// of the vector is the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Slot index the element was found at. Valid only until the next
    /// mutation; see [`ShmTable::remove_by_idx`] for the rewind rule.
    pub idx: usize,
}

/// Counters snapshot returned by [`ShmTable::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Distinct keys stored.
    pub num: usize,
    /// Occupied slots, spill fragments included.
    pub used_slots: usize,
    /// Fixed slot capacity of the region.
    pub max_slots: usize,
}

impl<'a> ShmTable<'a> {
    /// Initialize a new table in `mem`, zeroing it.
    ///
    /// Capacity is however many slots fit after the header. Fails with
    /// [`Error::Region`] if fewer than one slot fits or `mem` is not
    /// 4-byte aligned (mmap and POSIX shared memory always are).
    pub fn create(mem: &'a mut [u8]) -> Result<Self> {
        Self::check_alignment(mem)?;
        if mem.len() < region_size(1) {
            return Err(Error::Region("too small to hold a single slot"));
        }
        let max_slots = (mem.len() - HEADER_SIZE) / SLOT_SIZE;
        if max_slots > i32::MAX as usize {
            return Err(Error::Region("more slots than the header can count"));
        }

        mem.fill(0);
        let mut table = ShmTable {
            base: mem.as_mut_ptr(),
            _region: PhantomData,
        };
        let header = table.header_mut();
        header.maxslots = max_slots as i32;
        header.usedslots = 0;
        header.num = 0;
        debug!("created table with {max_slots} slots");
        Ok(table)
    }

    /// Re-attach to a region that already holds a table.
    ///
    /// The header is trusted, except for checks that keep index
    /// arithmetic sound: the base must be aligned, the declared slot
    /// count positive, and the declared geometry must fit in `mem`.
    pub fn open(mem: &'a mut [u8]) -> Result<Self> {
        Self::check_alignment(mem)?;
        if mem.len() < HEADER_SIZE {
            return Err(Error::Region("smaller than the table header"));
        }
        let table = ShmTable {
            base: mem.as_mut_ptr(),
            _region: PhantomData,
        };
        let max_slots = table.header().maxslots;
        if max_slots < 1 {
            return Err(Error::Region("header declares no slots"));
        }
        if region_size(max_slots as usize) > mem.len() {
            return Err(Error::Region("header geometry exceeds the region"));
        }
        Ok(table)
    }

    fn check_alignment(mem: &[u8]) -> Result<()> {
        if mem.as_ptr() as usize % std::mem::align_of::<Slot>() != 0 {
            return Err(Error::Region("base address is not 4-byte aligned"));
        }
        Ok(())
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.base as *const Header) }
    }

    fn header_mut(&mut self) -> &mut Header {
        unsafe { &mut *(self.base as *mut Header) }
    }

    fn slot_ptr(&self, idx: usize) -> *mut Slot {
        unsafe { self.base.add(HEADER_SIZE + idx * SLOT_SIZE) as *mut Slot }
    }

    pub(crate) fn slot(&self, idx: usize) -> &Slot {
        unsafe { &*self.slot_ptr(idx) }
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot {
        unsafe { &mut *self.slot_ptr(idx) }
    }

    pub(crate) fn max_slots(&self) -> usize {
        self.header().maxslots as usize
    }

    fn home_of(&self, key: &[u8]) -> usize {
        hash::murmur3_32(key) as usize % self.max_slots()
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArg("empty key"));
        }
        if key.len() > u16::MAX as usize {
            return Err(Error::InvalidArg("key longer than 65535 bytes"));
        }
        Ok(())
    }

    /// Store `value` under `key`, replacing any existing element with
    /// the same key.
    ///
    /// Values larger than a slot's inline area spill across additional
    /// slots; a failed spill allocation erases the partial chain and
    /// returns [`Error::NoSpace`] with the counters restored.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        Self::check_key(key)?;
        let home = self.home_of(key);
        let count = self.slot(home).count;

        if count == 0 {
            // Empty home: the element becomes a chain of one.
            self.put_data(home, home, key, value, 1)?;
            trace!("put: new head at {home}");
        } else if count > 0 {
            if let Some(existing) = self.get_idx(key, home) {
                // Same key: remove and retry so chain accounting stays
                // consistent (last write wins).
                self.remove_by_idx(existing)?;
                return self.put(key, value);
            }
            // Different key hashing to an owned home: chain by counter.
            let idx = self.find_avail(home).ok_or(Error::NoSpace)?;
            self.put_data(idx, home, key, value, TAG_COLLISION)?;
            self.slot_mut(home).count += 1;
            trace!("put: collision member for home {home} at {idx}");
        } else {
            // The home is squatted by a collision member or a spill
            // fragment of some other element. Relocate it, then claim
            // the home as a head.
            let idx = self.find_avail(home + 1).ok_or(Error::NoSpace)?;
            self.copy_slot(idx, home)?;
            self.remove_slot(home)?;

            if self.slot(idx).count == TAG_SPILL {
                // Splice the moved fragment back into its value chain:
                // the predecessor's forward link and the successor's
                // back link both still name the old index.
                let prev = self.slot(idx).hash as usize;
                self.slot_mut(prev).link = idx as i32;
                let next = self.slot(idx).link;
                if next != SLOT_NONE {
                    self.slot_mut(next as usize).hash = idx as i32;
                }
            } else {
                // A relocated collision member needs no chain repair of
                // its own, but if its value spills, the first fragment
                // still back-links to the vacated home.
                let link = self.slot(idx).link;
                if link != SLOT_NONE {
                    self.slot_mut(link as usize).hash = idx as i32;
                }
            }

            self.put_data(home, home, key, value, 1)?;
            debug!("put: evicted squatter from {home} to {idx}");
        }
        Ok(())
    }

    /// Look up `key` and return an owned copy of its value.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        Self::check_key(key)?;
        let home = self.home_of(key);
        let idx = self.get_idx(key, home).ok_or(Error::NotFound)?;
        self.get_data(idx)
    }

    /// Remove the element stored under `key`.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        Self::check_key(key)?;
        let home = self.home_of(key);
        let idx = self.get_idx(key, home).ok_or(Error::NotFound)?;
        self.remove_by_idx(idx)
    }

    /// Remove the element whose head-or-member slot is `idx`.
    ///
    /// This is the removal path for iteration, where long keys come
    /// back truncated and cannot be removed by name. After removing at
    /// an index obtained from [`ShmTable::get_next`], rewind the cursor
    /// to that index before the next call: removal may relocate a
    /// colliding sibling into the vacated slot.
    pub fn remove_by_idx(&mut self, idx: usize) -> Result<()> {
        let max_slots = self.max_slots();
        if idx >= max_slots {
            return Err(Error::InvalidArg("slot index out of range"));
        }

        let count = self.slot(idx).count;
        if count == 1 {
            // Sole element homed here: drop its whole chain.
            self.remove_data(idx)?;
            trace!("remove: head at {idx}");
        } else if count > 1 {
            // Head with collisions: promote a colliding sibling into
            // the vacated home so the chain stays rooted there.
            let home = self.slot(idx).hash;
            let mut sibling = idx + 1;
            loop {
                if sibling >= max_slots {
                    sibling = 0;
                }
                if sibling == idx {
                    return Err(Error::Corrupt("head with collisions has no sibling"));
                }
                let s = self.slot(sibling);
                if s.count == TAG_COLLISION && s.hash == home {
                    break;
                }
                sibling += 1;
            }

            self.remove_data(idx)?;
            self.copy_slot(idx, sibling)?;
            self.remove_slot(sibling)?;

            self.slot_mut(idx).count = count - 1;
            let link = self.slot(idx).link;
            if link != SLOT_NONE {
                // The promoted element's first spill fragment still
                // back-links to the old index.
                self.slot_mut(link as usize).hash = idx as i32;
            }
            trace!("remove: head at {idx}, promoted sibling from {sibling}");
        } else if count == TAG_COLLISION {
            let home = self.slot(idx).hash as usize;
            if self.slot(home).count <= 1 {
                return Err(Error::Corrupt("home counter of a collision member is not > 1"));
            }
            self.slot_mut(home).count -= 1;
            self.remove_data(idx)?;
            trace!("remove: collision member at {idx} homed at {home}");
        } else {
            // Empty slot or spill fragment: not an element.
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Yield the next element at or after `*cursor`, advancing the
    /// cursor past it. Returns `Ok(None)` at the end of the ring.
    ///
    /// Every element has exactly one head-or-member slot, so a full
    /// pass yields each element exactly once. Keys longer than
    /// [`KEY_INLINE`] come back truncated; remove those through
    /// [`ShmTable::remove_by_idx`].
    pub fn get_next(&self, cursor: &mut usize) -> Result<Option<Entry>> {
        let max_slots = self.max_slots();
        let mut idx = *cursor;
        while idx < max_slots {
            let s = self.slot(idx);
            if s.count != 0 && s.count != TAG_SPILL {
                let key_len = (s.key_len() as usize).min(KEY_INLINE);
                let mut key = Vec::new();
                key.try_reserve_exact(key_len)
                    .map_err(|_| Error::OutOfMemory)?;
                key.extend_from_slice(&s.pair_key()[..key_len]);
                let value = self.get_data(idx)?;
                *cursor = idx + 1;
                return Ok(Some(Entry { key, value, idx }));
            }
            idx += 1;
        }
        Ok(None)
    }

    /// Read-only iterator over all elements, in slot order.
    pub fn entries(&self) -> Entries<'_, 'a> {
        Entries {
            table: self,
            cursor: 0,
        }
    }

    /// Number of distinct keys stored.
    pub fn len(&self) -> usize {
        self.header().num as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the three header counters.
    pub fn stats(&self) -> TableStats {
        let header = self.header();
        TableStats {
            num: header.num as usize,
            used_slots: header.usedslots as usize,
            max_slots: header.maxslots as usize,
        }
    }

    /// Drop every element, keeping the capacity.
    pub fn clear(&mut self) {
        if self.header().usedslots == 0 {
            return;
        }
        let max_slots = self.max_slots();
        let header = self.header_mut();
        header.usedslots = 0;
        header.num = 0;
        unsafe {
            ptr::write_bytes(self.base.add(HEADER_SIZE), 0, max_slots * SLOT_SIZE);
        }
        debug!("cleared table");
    }

    // --- slot machinery ---

    /// Lowest empty slot at or after `start`, wrapping at the ring end.
    fn find_avail(&self, start: usize) -> Option<usize> {
        let max_slots = self.max_slots();
        let start = if start >= max_slots { 0 } else { start };
        let mut idx = start;
        loop {
            if self.slot(idx).count == 0 {
                return Some(idx);
            }
            idx += 1;
            if idx >= max_slots {
                idx = 0;
            }
            if idx == start {
                return None;
            }
        }
    }

    /// Find the slot holding `key` within the chain rooted at `home`.
    ///
    /// Walks forward from `home`, counting only slots that belong to
    /// this home, and stops once the home's member count is exhausted.
    /// Truncated keys compare by length, inline prefix and MD5 digest;
    /// a false positive requires all three to collide.
    fn get_idx(&self, key: &[u8], home: usize) -> Option<usize> {
        let want = self.slot(home).count;
        if want <= 0 {
            return None;
        }

        let max_slots = self.max_slots();
        let key_len = key.len();
        let digest = if key_len > KEY_INLINE {
            Some(hash::md5_digest(key))
        } else {
            None
        };

        let mut seen = 0;
        let mut idx = home;
        while seen < want {
            let s = self.slot(idx);
            if s.hash == home as i32 && (s.count > 0 || s.count == TAG_COLLISION) {
                seen += 1;
                if key_len == s.key_len() as usize {
                    let matched = match &digest {
                        None => &s.pair_key()[..key_len] == key,
                        Some(d) => {
                            s.pair_key() == &key[..KEY_INLINE] && s.key_md5() == &d[..]
                        }
                    };
                    if matched {
                        return Some(idx);
                    }
                }
            }
            idx += 1;
            if idx >= max_slots {
                idx = 0;
            }
            if idx == home {
                break;
            }
        }
        None
    }

    /// Reassemble an element's value by walking its slot chain.
    fn get_data(&self, idx: usize) -> Result<Vec<u8>> {
        let mut total = 0usize;
        let mut cur = idx;
        loop {
            let s = self.slot(cur);
            total += s.size as usize;
            if s.link == SLOT_NONE {
                break;
            }
            cur = s.link as usize;
        }

        let mut value = Vec::new();
        value.try_reserve_exact(total).map_err(|_| Error::OutOfMemory)?;

        cur = idx;
        loop {
            let s = self.slot(cur);
            if s.count == TAG_SPILL {
                let n = (s.size as usize).min(EXT_INLINE);
                value.extend_from_slice(&s.ext_value()[..n]);
            } else {
                let n = (s.size as usize).min(VALUE_INLINE);
                value.extend_from_slice(&s.pair_value()[..n]);
            }
            if s.link == SLOT_NONE {
                break;
            }
            cur = s.link as usize;
        }
        Ok(value)
    }

    /// Write a new element into the empty slot `idx`, spilling the
    /// value across further slots as needed.
    fn put_data(
        &mut self,
        idx: usize,
        home: usize,
        key: &[u8],
        value: &[u8],
        count: i32,
    ) -> Result<()> {
        if self.slot(idx).count != 0 {
            return Err(Error::Corrupt("destination slot is not empty"));
        }

        let digest = hash::md5_digest(key);
        let inline = key.len().min(KEY_INLINE);
        {
            let s = self.slot_mut(idx);
            s.count = count;
            s.hash = home as i32;
            s.link = SLOT_NONE;
            s.size = 0;
            s.pair_key_mut().fill(0);
            s.pair_key_mut()[..inline].copy_from_slice(&key[..inline]);
            s.key_md5_mut().copy_from_slice(&digest);
            s.set_key_len(key.len() as u16);
        }

        // Stream the value: head slot first, then spill fragments. A
        // zero-length value still writes the head slot once.
        let mut cur = idx;
        let mut written = 0usize;
        loop {
            if written > 0 {
                let next = match self.find_avail(cur + 1) {
                    Some(next) => next,
                    None => {
                        // Unwind the partial chain before reporting.
                        self.remove_data(idx)?;
                        return Err(Error::NoSpace);
                    }
                };
                {
                    let s = self.slot_mut(next);
                    s.count = TAG_SPILL;
                    s.hash = cur as i32; // back link
                    s.link = SLOT_NONE;
                    s.size = 0;
                    s.body.fill(0);
                }
                self.slot_mut(cur).link = next as i32;
                trace!("put: spill fragment at {next} chained after {cur}");
                cur = next;
            }

            let cap = if cur == idx { VALUE_INLINE } else { EXT_INLINE };
            let n = cap.min(value.len() - written);
            {
                let s = self.slot_mut(cur);
                if cur == idx {
                    s.pair_value_mut()[..n].copy_from_slice(&value[written..written + n]);
                } else {
                    s.ext_value_mut()[..n].copy_from_slice(&value[written..written + n]);
                }
                s.size = n as u32;
            }
            {
                let header = self.header_mut();
                if cur == idx {
                    header.num += 1;
                }
                header.usedslots += 1;
            }
            written += n;
            if written >= value.len() {
                break;
            }
        }
        Ok(())
    }

    /// Byte-copy an occupied slot into an empty one.
    fn copy_slot(&mut self, dst: usize, src: usize) -> Result<()> {
        if self.slot(dst).count != 0 || self.slot(src).count == 0 {
            return Err(Error::Corrupt("slot copy endpoints in wrong state"));
        }
        let copied = *self.slot(src);
        *self.slot_mut(dst) = copied;
        self.header_mut().usedslots += 1;
        Ok(())
    }

    /// Mark an occupied slot empty.
    fn remove_slot(&mut self, idx: usize) -> Result<()> {
        if self.slot(idx).count == 0 {
            return Err(Error::Corrupt("removing an already-empty slot"));
        }
        self.slot_mut(idx).count = 0;
        self.header_mut().usedslots -= 1;
        Ok(())
    }

    /// Remove an element's whole slot chain and decrement the key count.
    fn remove_data(&mut self, idx: usize) -> Result<()> {
        if self.slot(idx).count == 0 {
            return Err(Error::Corrupt("removing data from an empty slot"));
        }
        let mut cur = idx;
        loop {
            let link = self.slot(cur).link;
            self.remove_slot(cur)?;
            if link == SLOT_NONE {
                break;
            }
            cur = link as usize;
        }
        self.header_mut().num -= 1;
        Ok(())
    }

    /// Walk every slot and assert the structural invariants: counter
    /// ordering, collision counts, spill chain connectivity and home
    /// placement. Test-only; panics on violation.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let max_slots = self.max_slots();
        let header = self.header();
        assert!(header.num >= 0);
        assert!(header.num <= header.usedslots);
        assert!(header.usedslots <= header.maxslots);

        let mut used = 0i32;
        let mut num = 0i32;
        let mut members = vec![0i32; max_slots];

        for i in 0..max_slots {
            let s = self.slot(i);
            match s.count {
                0 => {}
                TAG_SPILL => used += 1,
                TAG_COLLISION => {
                    used += 1;
                    num += 1;
                    let home = s.hash as usize;
                    assert!(home < max_slots, "member {i} points outside the ring");
                    assert!(
                        self.slot(home).count > 1,
                        "member {i} not counted at home {home}"
                    );
                    members[home] += 1;
                    let key_len = s.key_len() as usize;
                    if key_len <= KEY_INLINE {
                        let computed =
                            hash::murmur3_32(&s.pair_key()[..key_len]) as usize % max_slots;
                        assert_eq!(computed, home, "member {i} stored under wrong home");
                    }
                }
                c if c > 0 => {
                    used += 1;
                    num += 1;
                    assert_eq!(s.hash as usize, i, "head at {i} is not its own home");
                    let key_len = s.key_len() as usize;
                    if key_len <= KEY_INLINE {
                        let computed =
                            hash::murmur3_32(&s.pair_key()[..key_len]) as usize % max_slots;
                        assert_eq!(computed, i, "head at {i} stored under wrong home");
                    }
                }
                other => panic!("slot {i} carries invalid tag {other}"),
            }
        }

        for i in 0..max_slots {
            let s = self.slot(i);
            if s.count > 0 {
                assert_eq!(members[i], s.count - 1, "collision count wrong at head {i}");
            } else {
                assert_eq!(members[i], 0, "members point at non-head slot {i}");
            }

            if s.count == TAG_SPILL {
                // Prev-links must reach a non-spill slot...
                let mut cur = i;
                let mut steps = 0;
                let head = loop {
                    let prev = self.slot(cur).hash as usize;
                    assert!(prev < max_slots, "spill {i} prev-link out of range");
                    if self.slot(prev).count != TAG_SPILL {
                        assert_ne!(self.slot(prev).count, 0, "spill {i} rooted at empty slot");
                        break prev;
                    }
                    cur = prev;
                    steps += 1;
                    assert!(steps <= max_slots, "spill {i} prev-chain cycles");
                };
                // ...and the forward chain from that head must come back.
                let mut cur = self.slot(head).link;
                let mut steps = 0;
                let mut found = false;
                while cur != SLOT_NONE {
                    if cur as usize == i {
                        found = true;
                        break;
                    }
                    cur = self.slot(cur as usize).link;
                    steps += 1;
                    assert!(steps <= max_slots, "spill chain from {head} cycles");
                }
                assert!(found, "spill {i} unreachable from head {head}");
            }
        }

        assert_eq!(used, header.usedslots, "usedslots counter drifted");
        assert_eq!(num, header.num, "num counter drifted");
    }
}

/// Iterator over a table's elements; see [`ShmTable::entries`].
pub struct Entries<'t, 'a> {
    table: &'t ShmTable<'a>,
    cursor: usize,
}

impl Iterator for Entries<'_, '_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.table.get_next(&mut self.cursor) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
