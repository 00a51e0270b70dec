//! Key-indexed entry table laid out in shared memory
//!
//! # Design
//! - Fixed-stride slots, each with a state byte, a fixed key area and a
//!   payload area sized at segment creation
//! - Writers: find free slot -> `WRITING` -> copy -> publish `READY`
//! - Consumers may claim (`READY -> CLAIMED`) or dead-letter (`-> DEAD`)
//! - Removal is a single store back to `EMPTY`
//!
//! A `QueueTable` is only a view over the mapped memory. Every method assumes
//! the caller holds the segment lock.

use crate::error::{QueueError, Result};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Maximum key size in bytes
pub const MAX_KEY_LEN: usize = 64;

/// Largest payload area a table may be configured with
pub const MAX_PAYLOAD_LIMIT: usize = 64 * 1024 * 1024;

const SLOT_ALIGN: usize = 8;

/// Slot states
mod slot_state {
    pub const EMPTY: u8 = 0;
    pub const WRITING: u8 = 1;
    pub const READY: u8 = 2;
    pub const CLAIMED: u8 = 3;
    pub const DEAD: u8 = 4;
}

#[inline]
const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Per-slot header; payload bytes follow it directly
#[repr(C)]
struct SlotHeader {
    state: AtomicU8,
    _pad: [u8; 3],
    key_len: u32,
    payload_len: u32,
    /// Pid that claimed the entry, zero otherwise
    claimant: u32,
    /// Insertion order
    sequence: u64,
    key: [u8; MAX_KEY_LEN],
}

/// Table header in shared memory
#[repr(C)]
pub struct TableHeader {
    capacity: u32,
    max_payload: u32,
    slot_stride: u64,
    next_sequence: AtomicU64,
}

/// Lifecycle state of a live entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Committed and offered to consumers
    Ready,
    /// Taken by a consumer that has not finished with it yet
    Claimed { pid: u32 },
    /// Parked after a processing failure; never offered again
    DeadLettered,
}

impl EntryState {
    fn from_raw(state: u8, claimant: u32) -> Option<Self> {
        match state {
            slot_state::READY => Some(EntryState::Ready),
            slot_state::CLAIMED => Some(EntryState::Claimed { pid: claimant }),
            slot_state::DEAD => Some(EntryState::DeadLettered),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Ready => "ready",
            EntryState::Claimed { .. } => "claimed",
            EntryState::DeadLettered => "dead-lettered",
        }
    }
}

/// A committed queue entry, copied out of shared memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub payload: Vec<u8>,
    pub sequence: u64,
    pub state: EntryState,
}

impl Entry {
    /// Payload as UTF-8 text
    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| QueueError::malformed(format!("payload is not UTF-8: {e}")))
    }
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.as_bytes().contains(&0) {
        return Err(QueueError::InvalidKey(key.to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(QueueError::KeyTooLong {
            max: MAX_KEY_LEN,
            got: key.len(),
        });
    }
    Ok(())
}

/// View over one table inside the mapped segment
pub struct QueueTable {
    header: *mut TableHeader,
    slots: *mut u8,
}

// SAFETY: access is serialized by the segment lock
unsafe impl Send for QueueTable {}
unsafe impl Sync for QueueTable {}

impl QueueTable {
    fn header_size() -> usize {
        align_up(std::mem::size_of::<TableHeader>(), SLOT_ALIGN)
    }

    fn stride_for(max_payload: usize) -> Option<usize> {
        let raw = std::mem::size_of::<SlotHeader>().checked_add(max_payload)?;
        Some(raw.checked_add(SLOT_ALIGN - 1)? & !(SLOT_ALIGN - 1))
    }

    /// Size of a table in bytes (header + slots)
    ///
    /// `None` when the geometry does not fit the address space or the
    /// payload exceeds [`MAX_PAYLOAD_LIMIT`].
    pub fn size_for(capacity: usize, max_payload: usize) -> Option<usize> {
        if max_payload > MAX_PAYLOAD_LIMIT || capacity > u32::MAX as usize {
            return None;
        }
        let slots = capacity.checked_mul(Self::stride_for(max_payload)?)?;
        let size = Self::header_size().checked_add(slots)?;
        (size <= isize::MAX as usize).then_some(size)
    }

    /// Whether the stored header describes exactly this geometry
    pub(crate) fn has_geometry(&self, capacity: usize, max_payload: usize) -> bool {
        let header = self.header();
        header.capacity as usize == capacity
            && header.max_payload as usize == max_payload
            && Self::stride_for(max_payload).map(|s| s as u64) == Some(header.slot_stride)
    }

    /// Initialize an empty table
    ///
    /// # Safety
    /// `size_for(capacity, max_payload)` must be `Some`, and `ptr` must be
    /// valid for that many bytes, 8-byte aligned and zeroed.
    pub unsafe fn init(ptr: *mut u8, capacity: usize, max_payload: usize) -> Self {
        let header = ptr as *mut TableHeader;
        std::ptr::write(
            header,
            TableHeader {
                capacity: capacity as u32,
                max_payload: max_payload as u32,
                slot_stride: Self::stride_for(max_payload).unwrap_or(0) as u64,
                next_sequence: AtomicU64::new(1),
            },
        );
        let table = Self::from_raw(ptr);
        for i in 0..capacity {
            (*table.slot(i)).state.store(slot_state::EMPTY, Ordering::Relaxed);
        }
        table
    }

    /// Create a view over an initialized table
    ///
    /// # Safety
    /// `ptr` must point to a table set up by [`QueueTable::init`]
    pub unsafe fn from_raw(ptr: *mut u8) -> Self {
        Self {
            header: ptr as *mut TableHeader,
            slots: ptr.add(Self::header_size()),
        }
    }

    #[inline]
    fn header(&self) -> &TableHeader {
        unsafe { &*self.header }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    #[inline]
    pub fn max_payload(&self) -> usize {
        self.header().max_payload as usize
    }

    #[inline]
    fn slot(&self, index: usize) -> *mut SlotHeader {
        let stride = self.header().slot_stride as usize;
        unsafe { self.slots.add(index * stride) as *mut SlotHeader }
    }

    #[inline]
    fn payload_ptr(slot: *mut SlotHeader) -> *mut u8 {
        unsafe { (slot as *mut u8).add(std::mem::size_of::<SlotHeader>()) }
    }

    #[inline]
    fn state(&self, index: usize) -> u8 {
        unsafe { (*self.slot(index)).state.load(Ordering::Acquire) }
    }

    fn is_live(state: u8) -> bool {
        matches!(
            state,
            slot_state::READY | slot_state::CLAIMED | slot_state::DEAD
        )
    }

    fn key_matches(&self, index: usize, key: &[u8]) -> bool {
        let slot = self.slot(index);
        unsafe {
            let len = (*slot).key_len as usize;
            let stored: &[u8; MAX_KEY_LEN] = &*std::ptr::addr_of!((*slot).key);
            len == key.len() && len <= MAX_KEY_LEN && stored[..len] == *key
        }
    }

    fn find(&self, key: &str) -> Option<usize> {
        (0..self.capacity())
            .find(|&i| Self::is_live(self.state(i)) && self.key_matches(i, key.as_bytes()))
    }

    fn find_live(&self, key: &str) -> Result<usize> {
        self.find(key)
            .ok_or_else(|| QueueError::KeyNotFound(key.to_string()))
    }

    fn entry_at(&self, index: usize) -> Option<Entry> {
        let slot = self.slot(index);
        unsafe {
            let state = EntryState::from_raw((*slot).state.load(Ordering::Acquire), (*slot).claimant)?;
            let key_len = ((*slot).key_len as usize).min(MAX_KEY_LEN);
            let payload_len = ((*slot).payload_len as usize).min(self.max_payload());
            let payload =
                std::slice::from_raw_parts(Self::payload_ptr(slot), payload_len).to_vec();
            Some(Entry {
                key: String::from_utf8_lossy(&(&*std::ptr::addr_of!((*slot).key))[..key_len])
                    .into_owned(),
                payload,
                sequence: (*slot).sequence,
                state,
            })
        }
    }

    /// Insert a new entry, returning its sequence number
    pub fn insert(&self, key: &str, payload: &[u8]) -> Result<u64> {
        validate_key(key)?;
        if payload.len() > self.max_payload() {
            return Err(QueueError::PayloadTooLarge {
                max: self.max_payload(),
                got: payload.len(),
            });
        }

        let mut free = None;
        for i in 0..self.capacity() {
            let state = self.state(i);
            if Self::is_live(state) {
                if self.key_matches(i, key.as_bytes()) {
                    return Err(QueueError::DuplicateKey(key.to_string()));
                }
            } else if state == slot_state::EMPTY && free.is_none() {
                free = Some(i);
            }
        }

        let index = free.ok_or(QueueError::QueueFull {
            capacity: self.capacity(),
        })?;

        let sequence = self.header().next_sequence.fetch_add(1, Ordering::Relaxed);
        let slot = self.slot(index);
        unsafe {
            (*slot).state.store(slot_state::WRITING, Ordering::Release);
            let key_area = std::ptr::addr_of_mut!((*slot).key) as *mut u8;
            std::ptr::write_bytes(key_area, 0, MAX_KEY_LEN);
            std::ptr::copy_nonoverlapping(key.as_ptr(), key_area, key.len());
            (*slot).key_len = key.len() as u32;
            std::ptr::copy_nonoverlapping(payload.as_ptr(), Self::payload_ptr(slot), payload.len());
            (*slot).payload_len = payload.len() as u32;
            (*slot).claimant = 0;
            (*slot).sequence = sequence;
            // Publish
            (*slot).state.store(slot_state::READY, Ordering::Release);
        }
        Ok(sequence)
    }

    /// Oldest entry still offered to consumers
    pub fn oldest_ready(&self) -> Option<Entry> {
        (0..self.capacity())
            .filter(|&i| self.state(i) == slot_state::READY)
            .min_by_key(|&i| unsafe { (*self.slot(i)).sequence })
            .and_then(|i| self.entry_at(i))
    }

    /// Entry with this key, in any live state
    pub fn get(&self, key: &str) -> Option<Entry> {
        self.find(key).and_then(|i| self.entry_at(i))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    /// All live entries in insertion order
    pub fn entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = (0..self.capacity())
            .filter_map(|i| self.entry_at(i))
            .collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    pub fn len(&self) -> usize {
        (0..self.capacity())
            .filter(|&i| Self::is_live(self.state(i)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the entry with this key
    pub fn remove(&self, key: &str) -> Result<()> {
        let index = self.find_live(key)?;
        unsafe {
            (*self.slot(index)).state.store(slot_state::EMPTY, Ordering::Release);
        }
        Ok(())
    }

    /// `READY -> CLAIMED`, recording the claimant
    pub fn claim(&self, key: &str, pid: u32) -> Result<Entry> {
        let index = self.find_live(key)?;
        let slot = self.slot(index);
        unsafe {
            match (*slot).state.load(Ordering::Acquire) {
                slot_state::READY => {
                    (*slot).claimant = pid;
                    (*slot).state.store(slot_state::CLAIMED, Ordering::Release);
                }
                slot_state::CLAIMED => {
                    return Err(QueueError::AlreadyClaimed {
                        key: key.to_string(),
                        pid: (*slot).claimant,
                    });
                }
                _ => {
                    return Err(QueueError::InvalidState {
                        key: key.to_string(),
                        state: EntryState::DeadLettered.as_str(),
                    });
                }
            }
        }
        self.entry_at(index)
            .ok_or_else(|| QueueError::KeyNotFound(key.to_string()))
    }

    /// `CLAIMED -> READY`
    pub fn release(&self, key: &str) -> Result<()> {
        let index = self.find_live(key)?;
        let slot = self.slot(index);
        unsafe {
            let state = (*slot).state.load(Ordering::Acquire);
            if state != slot_state::CLAIMED {
                let state = EntryState::from_raw(state, 0).map_or("empty", |s| s.as_str());
                return Err(QueueError::InvalidState {
                    key: key.to_string(),
                    state,
                });
            }
            (*slot).claimant = 0;
            (*slot).state.store(slot_state::READY, Ordering::Release);
        }
        Ok(())
    }

    /// Park an entry so it is no longer offered by `oldest_ready`
    pub fn dead_letter(&self, key: &str) -> Result<()> {
        let index = self.find_live(key)?;
        unsafe {
            (*self.slot(index)).state.store(slot_state::DEAD, Ordering::Release);
        }
        Ok(())
    }

    /// Keys of claimed entries with their claimant pid
    pub fn claims(&self) -> Vec<(String, u32)> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e.state {
                EntryState::Claimed { pid } => Some((e.key, pid)),
                _ => None,
            })
            .collect()
    }

    /// Empty every slot
    pub fn clear(&self) {
        for i in 0..self.capacity() {
            unsafe {
                (*self.slot(i)).state.store(slot_state::EMPTY, Ordering::Release);
            }
        }
    }

    /// Leave a slot as a writer that died mid-copy would
    #[cfg(test)]
    pub(crate) fn mark_writing(&self, index: usize) {
        unsafe {
            (*self.slot(index)).state.store(slot_state::WRITING, Ordering::Release);
        }
    }

    /// Reset slots left mid-write by a writer that died holding the lock
    pub fn repair(&self) -> usize {
        let mut repaired = 0;
        for i in 0..self.capacity() {
            if self.state(i) == slot_state::WRITING {
                unsafe {
                    (*self.slot(i)).state.store(slot_state::EMPTY, Ordering::Release);
                }
                repaired += 1;
            }
        }
        repaired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct HeapTable {
        ptr: *mut u8,
        layout: Layout,
        table: QueueTable,
    }

    impl HeapTable {
        fn new(capacity: usize, max_payload: usize) -> Self {
            let size = QueueTable::size_for(capacity, max_payload).unwrap();
            let layout = Layout::from_size_align(size, 64).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            let table = unsafe { QueueTable::init(ptr, capacity, max_payload) };
            Self { ptr, layout, table }
        }
    }

    impl Drop for HeapTable {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let heap = HeapTable::new(4, 64);
        let t = &heap.table;

        t.insert("k1", b"hello").unwrap();
        let e = t.get("k1").unwrap();
        assert_eq!(e.payload, b"hello");
        assert_eq!(e.state, EntryState::Ready);
        assert_eq!(t.len(), 1);

        t.remove("k1").unwrap();
        assert!(t.get("k1").is_none());
        assert!(matches!(t.remove("k1"), Err(QueueError::KeyNotFound(_))));
        assert!(t.is_empty());
    }

    #[test]
    fn test_exact_key_match() {
        let heap = HeapTable::new(4, 16);
        let t = &heap.table;
        t.insert("abc", b"1").unwrap();
        assert!(t.get("ab").is_none());
        assert!(t.get("abcd").is_none());
        assert!(matches!(t.remove("ab"), Err(QueueError::KeyNotFound(_))));
    }

    #[test]
    fn test_duplicate_key_keeps_original() {
        let heap = HeapTable::new(4, 16);
        let t = &heap.table;
        t.insert("k", b"first").unwrap();
        assert!(matches!(
            t.insert("k", b"second"),
            Err(QueueError::DuplicateKey(_))
        ));
        assert_eq!(t.get("k").unwrap().payload, b"first");
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_full_table_unchanged() {
        let heap = HeapTable::new(3, 16);
        let t = &heap.table;
        for i in 0..3 {
            t.insert(&format!("k{i}"), b"x").unwrap();
        }
        let before = t.entries();
        assert!(matches!(
            t.insert("k3", b"x"),
            Err(QueueError::QueueFull { capacity: 3 })
        ));
        assert_eq!(t.entries(), before);
    }

    #[test]
    fn test_fifo_order_survives_slot_reuse() {
        let heap = HeapTable::new(3, 16);
        let t = &heap.table;
        t.insert("a", b"1").unwrap();
        t.insert("b", b"2").unwrap();
        t.remove("a").unwrap();
        // Lands in slot 0 but is newer than "b"
        t.insert("c", b"3").unwrap();

        assert_eq!(t.oldest_ready().unwrap().key, "b");
        let keys: Vec<_> = t.entries().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn test_limits() {
        let heap = HeapTable::new(2, 8);
        let t = &heap.table;
        assert!(matches!(
            t.insert("k", b"123456789"),
            Err(QueueError::PayloadTooLarge { max: 8, got: 9 })
        ));
        assert!(matches!(
            t.insert(&"k".repeat(MAX_KEY_LEN + 1), b"x"),
            Err(QueueError::KeyTooLong { .. })
        ));
        assert!(matches!(t.insert("", b"x"), Err(QueueError::InvalidKey(_))));
        t.insert(&"k".repeat(MAX_KEY_LEN), b"12345678").unwrap();
        t.insert("empty", b"").unwrap();
        assert!(t.get("empty").unwrap().payload.is_empty());
    }

    #[test]
    fn test_claim_release_dead_letter() {
        let heap = HeapTable::new(4, 16);
        let t = &heap.table;
        t.insert("a", b"1").unwrap();
        t.insert("b", b"2").unwrap();

        let claimed = t.claim("a", 77).unwrap();
        assert_eq!(claimed.state, EntryState::Claimed { pid: 77 });
        assert!(matches!(
            t.claim("a", 78),
            Err(QueueError::AlreadyClaimed { pid: 77, .. })
        ));
        // Claimed entries are not offered
        assert_eq!(t.oldest_ready().unwrap().key, "b");
        assert_eq!(t.claims(), vec![("a".to_string(), 77)]);

        t.release("a").unwrap();
        assert_eq!(t.oldest_ready().unwrap().key, "a");

        t.dead_letter("a").unwrap();
        assert_eq!(t.get("a").unwrap().state, EntryState::DeadLettered);
        assert_eq!(t.oldest_ready().unwrap().key, "b");
        assert!(matches!(t.claim("a", 1), Err(QueueError::InvalidState { .. })));
        assert!(matches!(t.release("b"), Err(QueueError::InvalidState { .. })));

        // Dead letters are still removable and still block their key
        assert!(matches!(t.insert("a", b"x"), Err(QueueError::DuplicateKey(_))));
        t.remove("a").unwrap();
        t.insert("a", b"x").unwrap();
    }

    #[test]
    fn test_repair_resets_half_written_slots() {
        let heap = HeapTable::new(2, 16);
        let t = &heap.table;
        t.insert("a", b"1").unwrap();
        unsafe {
            (*t.slot(1)).state.store(slot_state::WRITING, Ordering::Release);
        }
        // Never visible
        assert_eq!(t.len(), 1);
        assert!(matches!(t.insert("b", b"2"), Err(QueueError::QueueFull { .. })));

        assert_eq!(t.repair(), 1);
        t.insert("b", b"2").unwrap();
    }

    #[test]
    fn test_size_for_rejects_unrepresentable_geometry() {
        assert!(QueueTable::size_for(4, 64).is_some());
        assert!(QueueTable::size_for(4, MAX_PAYLOAD_LIMIT).is_some());
        assert!(QueueTable::size_for(4, MAX_PAYLOAD_LIMIT + 1).is_none());
        assert!(QueueTable::size_for(u32::MAX as usize, u32::MAX as usize).is_none());
        assert!(QueueTable::size_for(usize::MAX, 64).is_none());
    }

    #[test]
    fn test_has_geometry() {
        let heap = HeapTable::new(3, 40);
        assert!(heap.table.has_geometry(3, 40));
        assert!(!heap.table.has_geometry(4, 40));
        assert!(!heap.table.has_geometry(3, 41));
    }

    #[test]
    fn test_clear() {
        let heap = HeapTable::new(4, 16);
        let t = &heap.table;
        t.insert("a", b"1").unwrap();
        t.insert("b", b"2").unwrap();
        t.claim("b", 5).unwrap();
        t.clear();
        assert!(t.is_empty());
        assert!(t.oldest_ready().is_none());
        assert!(t.get("a").is_none());
    }
}
