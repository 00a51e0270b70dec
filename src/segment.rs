//! Shared memory segment holding the input and output queues
//!
//! # Layout
//!
//! ```text
//! +------------------+  0
//! | SegmentHeader    |  magic, version, geometry, lock
//! +------------------+  input_offset  (cache line aligned)
//! | QueueTable       |  requests
//! +------------------+  output_offset (cache line aligned)
//! | QueueTable       |  responses
//! +------------------+
//! ```
//!
//! The segment is long-lived: one process creates it, any number attach, and
//! it disappears only through an explicit [`Segment::teardown`].

use crate::config::SegmentConfig;
use crate::error::{QueueError, Result};
use crate::lock::{current_pid, process_alive, LockHolder, ShmLock, ShmLockGuard};
use crate::queue::{Direction, QueueManager};
use crate::shm::ShmRegion;
use crate::table::{EntryState, QueueTable, MAX_PAYLOAD_LIMIT};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic number for segment validation
const SEGMENT_MAGIC: u32 = 0x564E5155; // "VNQU"
const SEGMENT_VERSION: u32 = 1;

/// Cache line size
const CACHE_LINE_SIZE: usize = 64;

#[inline]
fn align(size: usize) -> Option<usize> {
    Some(size.checked_add(CACHE_LINE_SIZE - 1)? & !(CACHE_LINE_SIZE - 1))
}

/// Where the tables live for a given geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    input_offset: usize,
    output_offset: usize,
    total_size: usize,
}

impl Geometry {
    fn compute(capacity: usize, max_payload: usize) -> Option<Self> {
        let table = align(QueueTable::size_for(capacity, max_payload)?)?;
        let input_offset = align(std::mem::size_of::<SegmentHeader>())?;
        let output_offset = input_offset.checked_add(table)?;
        let total_size = output_offset.checked_add(table)?;
        Some(Self {
            input_offset,
            output_offset,
            total_size,
        })
    }
}

/// Segment header stored at the beginning of shared memory
#[repr(C)]
struct SegmentHeader {
    /// Stored last during creation; attachers never see a half-built header
    magic: AtomicU32,
    version: u32,
    capacity: u32,
    max_payload: u32,
    total_size: u64,
    input_offset: u64,
    output_offset: u64,
    creator_pid: u32,
    _pad: u32,
    clears: AtomicU64,
    lock: ShmLock,
}

/// Result of a reconciliation scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Input entries dropped because their response already exists
    pub completed_inputs: Vec<String>,
    /// Claims returned to the queue because the claimant is gone
    pub released_claims: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.completed_inputs.is_empty() && self.released_claims.is_empty()
    }
}

/// Point-in-time view of a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    pub descriptor: String,
    pub capacity: usize,
    pub max_payload: usize,
    pub input_len: usize,
    pub output_len: usize,
    pub creator_pid: u32,
    pub clears: u64,
    pub lock_recoveries: u64,
    pub lock_holder: Option<LockHolder>,
}

/// A mapped segment; one per process per segment
pub struct Segment {
    shm: ShmRegion,
    header: *mut SegmentHeader,
    input: QueueTable,
    output: QueueTable,
}

// SAFETY: all mutation of the mapped tables happens under the segment lock
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create and initialize a new segment
    pub fn create(name: &str, config: &SegmentConfig) -> Result<Self> {
        if config.capacity == 0 || config.capacity > u32::MAX as usize {
            return Err(QueueError::InvalidConfig(format!(
                "capacity must be between 1 and {}, got {}",
                u32::MAX,
                config.capacity
            )));
        }
        if config.max_payload == 0 || config.max_payload > MAX_PAYLOAD_LIMIT {
            return Err(QueueError::InvalidConfig(format!(
                "max_payload must be between 1 and {}, got {}",
                MAX_PAYLOAD_LIMIT,
                config.max_payload
            )));
        }
        let Some(Geometry {
            input_offset,
            output_offset,
            total_size,
        }) = Geometry::compute(config.capacity, config.max_payload)
        else {
            return Err(QueueError::InvalidConfig(format!(
                "{} entries of {} bytes per queue do not fit in memory",
                config.capacity, config.max_payload
            )));
        };

        let shm = ShmRegion::create(name, total_size)?;

        let base = shm.as_ptr();
        let header = base as *mut SegmentHeader;

        unsafe {
            (*header).version = SEGMENT_VERSION;
            (*header).capacity = config.capacity as u32;
            (*header).max_payload = config.max_payload as u32;
            (*header).total_size = total_size as u64;
            (*header).input_offset = input_offset as u64;
            (*header).output_offset = output_offset as u64;
            (*header).creator_pid = current_pid();
            (*header).clears = AtomicU64::new(0);
            ShmLock::init(
                std::ptr::addr_of_mut!((*header).lock),
                config.stale_lock_timeout(),
            );

            let input = QueueTable::init(base.add(input_offset), config.capacity, config.max_payload);
            let output =
                QueueTable::init(base.add(output_offset), config.capacity, config.max_payload);

            (*header).magic.store(SEGMENT_MAGIC, Ordering::Release);

            tracing::debug!(
                name,
                capacity = config.capacity,
                max_payload = config.max_payload,
                total_size,
                "segment created"
            );

            Ok(Self {
                shm,
                header,
                input,
                output,
            })
        }
    }

    /// Create a segment under a freshly generated name
    pub fn create_unique(config: &SegmentConfig) -> Result<Self> {
        let name = format!("seg_{}", uuid::Uuid::new_v4().simple());
        Self::create(&name, config)
    }

    /// Attach to an existing segment
    pub fn attach(name: &str) -> Result<Self> {
        let shm = ShmRegion::open(name)?;
        let base = shm.as_ptr();
        let header = base as *mut SegmentHeader;

        if shm.size() < std::mem::size_of::<SegmentHeader>() {
            return Err(QueueError::Truncated {
                need: std::mem::size_of::<SegmentHeader>(),
                got: shm.size(),
            });
        }

        unsafe {
            let magic = (*header).magic.load(Ordering::Acquire);
            if magic != SEGMENT_MAGIC {
                return Err(QueueError::InvalidMagic {
                    expected: SEGMENT_MAGIC,
                    got: magic,
                });
            }
            let version = (*header).version;
            if version != SEGMENT_VERSION {
                return Err(QueueError::IncompatibleVersion {
                    expected: SEGMENT_VERSION,
                    got: version,
                });
            }
            let capacity = (*header).capacity as usize;
            let max_payload = (*header).max_payload as usize;
            let geometry = Geometry::compute(capacity, max_payload).ok_or_else(|| {
                QueueError::CorruptHeader(format!(
                    "{capacity} entries of {max_payload} bytes is not a valid geometry"
                ))
            })?;
            let stored = Geometry {
                input_offset: (*header).input_offset as usize,
                output_offset: (*header).output_offset as usize,
                total_size: (*header).total_size as usize,
            };
            if stored != geometry {
                return Err(QueueError::CorruptHeader(format!(
                    "layout {stored:?} does not match {capacity} x {max_payload} ({geometry:?})"
                )));
            }
            if geometry.total_size > shm.size() {
                return Err(QueueError::Truncated {
                    need: geometry.total_size,
                    got: shm.size(),
                });
            }

            let input = QueueTable::from_raw(base.add(geometry.input_offset));
            let output = QueueTable::from_raw(base.add(geometry.output_offset));
            if !input.has_geometry(capacity, max_payload) || !output.has_geometry(capacity, max_payload)
            {
                return Err(QueueError::CorruptHeader(
                    "table header disagrees with segment header".into(),
                ));
            }

            tracing::debug!(name, creator_pid = (*header).creator_pid, "segment attached");

            Ok(Self {
                shm,
                header,
                input,
                output,
            })
        }
    }

    #[inline]
    fn header(&self) -> &SegmentHeader {
        unsafe { &*self.header }
    }

    /// Name other processes use to attach
    pub fn descriptor(&self) -> &str {
        self.shm.name()
    }

    /// Whether this handle created the segment
    pub fn is_owner(&self) -> bool {
        self.shm.is_owner()
    }

    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    pub fn max_payload(&self) -> usize {
        self.header().max_payload as usize
    }

    /// Take the segment lock, repairing the tables if it was recovered
    pub(crate) fn lock(&self) -> ShmLockGuard<'_> {
        let guard = self.header().lock.lock();
        if guard.recovered() {
            let repaired = self.input.repair() + self.output.repair();
            if repaired > 0 {
                tracing::warn!(repaired, "reset half-written slots after lock recovery");
            }
        }
        guard
    }

    pub(crate) fn table(&self, direction: Direction) -> &QueueTable {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    pub fn queue(&self, direction: Direction) -> QueueManager<'_> {
        QueueManager::new(self, direction)
    }

    /// Request queue
    pub fn input(&self) -> QueueManager<'_> {
        self.queue(Direction::Input)
    }

    /// Response queue
    pub fn output(&self) -> QueueManager<'_> {
        self.queue(Direction::Output)
    }

    /// Empty both queues in one critical section
    pub fn clear(&self) {
        let _guard = self.lock();
        self.input.clear();
        self.output.clear();
        self.header().clears.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(name = self.descriptor(), "segment cleared");
    }

    /// Publish the response for `key` and drop the matching request
    ///
    /// Both steps happen under one lock hold, so no participant ever sees a
    /// response without its request having been consumed. The request must
    /// still be present; the output write is rejected with the usual
    /// duplicate/full errors and then nothing changes.
    pub fn commit_response(&self, key: &str, payload: &[u8]) -> Result<()> {
        let _guard = self.lock();
        if !self.input.contains(key) {
            return Err(QueueError::KeyNotFound(key.to_string()));
        }
        self.output.insert(key, payload)?;
        self.input.remove(key)?;
        tracing::trace!(key, len = payload.len(), "response committed");
        Ok(())
    }

    /// Publish an error response for `key` and dead-letter the request
    ///
    /// The request stays in the input queue for inspection but is no longer
    /// offered to consumers.
    pub fn reject(&self, key: &str, payload: &[u8]) -> Result<()> {
        let _guard = self.lock();
        if !self.input.contains(key) {
            return Err(QueueError::KeyNotFound(key.to_string()));
        }
        self.output.insert(key, payload)?;
        self.input.dead_letter(key)?;
        tracing::warn!(key, "request rejected and dead-lettered");
        Ok(())
    }

    /// Restart-time repair
    ///
    /// Drops requests whose response is already present and releases claims
    /// held by processes that no longer exist. Dead-lettered requests are
    /// kept even when an error response exists for them.
    pub fn reconcile(&self) -> ReconcileReport {
        let _guard = self.lock();
        let mut report = ReconcileReport::default();

        for entry in self.input.entries() {
            if entry.state == EntryState::DeadLettered {
                continue;
            }
            if self.output.contains(&entry.key) && self.input.remove(&entry.key).is_ok() {
                report.completed_inputs.push(entry.key);
            }
        }

        for (key, pid) in self.input.claims() {
            if !process_alive(pid) && self.input.release(&key).is_ok() {
                report.released_claims.push(key);
            }
        }

        if !report.is_clean() {
            tracing::info!(
                completed = report.completed_inputs.len(),
                released = report.released_claims.len(),
                "reconciled segment"
            );
        }
        report
    }

    pub fn stats(&self) -> SegmentStats {
        let (input_len, output_len) = {
            let _guard = self.lock();
            (self.input.len(), self.output.len())
        };
        let header = self.header();
        SegmentStats {
            descriptor: self.descriptor().to_string(),
            capacity: self.capacity(),
            max_payload: self.max_payload(),
            input_len,
            output_len,
            creator_pid: header.creator_pid,
            clears: header.clears.load(Ordering::Relaxed),
            lock_recoveries: header.lock.recoveries(),
            lock_holder: header.lock.holder(),
        }
    }

    /// Unmap and unlink the segment
    ///
    /// Other processes keep their mappings but can no longer attach. The
    /// caller must know that nobody still relies on the segment.
    pub fn teardown(self) -> Result<()> {
        let name = self.descriptor().to_string();
        if !self.is_owner() {
            tracing::debug!(name = %name, "tearing down a segment this handle did not create");
        }
        drop(self);
        ShmRegion::unlink(&name)?;
        tracing::debug!(name = %name, "segment torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SegmentConfig {
        SegmentConfig {
            capacity: 4,
            max_payload: 128,
            ..SegmentConfig::default()
        }
    }

    #[test]
    fn test_create_attach_teardown() {
        let seg = Segment::create_unique(&small()).unwrap();
        assert!(seg.is_owner());

        let other = Segment::attach(seg.descriptor()).unwrap();
        assert!(!other.is_owner());
        assert_eq!(other.capacity(), 4);
        assert_eq!(other.max_payload(), 128);

        seg.input().write("k", b"v").unwrap();
        assert_eq!(other.input().read_by_key("k").unwrap().payload, b"v");

        let name = seg.descriptor().to_string();
        drop(other);
        seg.teardown().unwrap();
        assert!(Segment::attach(&name).err().unwrap().is_not_found());
    }

    #[test]
    fn test_attach_missing() {
        let err = Segment::attach("seg_does_not_exist_anywhere").err().unwrap();
        assert!(matches!(err, QueueError::SegmentNotFound { .. }));
    }

    #[test]
    fn test_attach_rejects_foreign_region() {
        let name = format!("test_foreign_{}", uuid::Uuid::new_v4().simple());
        let region = ShmRegion::create(&name, 4096).unwrap();
        let err = Segment::attach(&name).err().unwrap();
        assert!(matches!(err, QueueError::InvalidMagic { got: 0, .. }));
        drop(region);
        ShmRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_invalid_config() {
        let configs = [
            SegmentConfig {
                capacity: 0,
                ..SegmentConfig::default()
            },
            SegmentConfig {
                max_payload: MAX_PAYLOAD_LIMIT + 1,
                ..SegmentConfig::default()
            },
            SegmentConfig {
                capacity: u32::MAX as usize,
                max_payload: u32::MAX as usize,
                ..SegmentConfig::default()
            },
            SegmentConfig {
                capacity: usize::MAX,
                ..SegmentConfig::default()
            },
        ];
        for config in configs {
            assert!(matches!(
                Segment::create_unique(&config),
                Err(QueueError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_attach_rejects_corrupt_geometry() {
        let seg = Segment::create_unique(&small()).unwrap();

        unsafe { (*seg.header).output_offset = u64::MAX / 2 };
        let err = Segment::attach(seg.descriptor()).err().unwrap();
        assert!(matches!(err, QueueError::CorruptHeader(_)));

        let output_offset = Geometry::compute(4, 128).unwrap().output_offset;
        unsafe {
            (*seg.header).output_offset = output_offset as u64;
            (*seg.header).capacity = u32::MAX;
        }
        let err = Segment::attach(seg.descriptor()).err().unwrap();
        assert!(matches!(err, QueueError::CorruptHeader(_)));

        unsafe { (*seg.header).capacity = 4 };
        assert!(Segment::attach(seg.descriptor()).is_ok());
        seg.teardown().unwrap();
    }

    #[test]
    fn test_lock_recovery_repairs_half_written_slot() {
        let seg = Segment::create_unique(&SegmentConfig {
            capacity: 2,
            max_payload: 64,
            ..SegmentConfig::default()
        })
        .unwrap();
        seg.input().write("a", b"1").unwrap();

        // Writer died between claiming slot 1 and publishing it, lock held
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        seg.input.mark_writing(1);
        seg.header().lock.force_owner(dead_pid);
        assert_eq!(seg.header().lock.holder().map(|h| h.pid), Some(dead_pid));

        let other = Segment::attach(seg.descriptor()).unwrap();
        other.input().write("b", b"2").unwrap();

        let stats = seg.stats();
        assert_eq!(stats.lock_recoveries, 1);
        assert!(stats.lock_holder.is_none());
        assert_eq!(stats.input_len, 2);
        assert_eq!(seg.input().read_by_key("b").unwrap().payload, b"2");
        seg.teardown().unwrap();
    }

    #[test]
    fn test_clear_empties_both_queues() {
        let seg = Segment::create_unique(&small()).unwrap();
        seg.input().write("a", b"1").unwrap();
        seg.output().write("b", b"2").unwrap();

        seg.clear();

        assert!(seg.input().read_one().is_none());
        assert!(seg.output().read_one().is_none());
        assert!(seg.output().read_by_key("b").err().unwrap().is_not_found());
        assert_eq!(seg.stats().clears, 1);
        seg.teardown().unwrap();
    }

    #[test]
    fn test_commit_response() {
        let seg = Segment::create_unique(&small()).unwrap();
        seg.input().write("u1", b"request").unwrap();

        seg.commit_response("u1", b"response").unwrap();
        assert!(seg.input().read_by_key("u1").is_err());
        assert_eq!(seg.output().read_by_key("u1").unwrap().payload, b"response");

        // Request gone: nothing to commit against
        assert!(matches!(
            seg.commit_response("u1", b"again"),
            Err(QueueError::KeyNotFound(_))
        ));
        seg.teardown().unwrap();
    }

    #[test]
    fn test_commit_response_failure_leaves_request() {
        let seg = Segment::create_unique(&small()).unwrap();
        seg.input().write("u1", b"request").unwrap();
        seg.output().write("u1", b"stale").unwrap();

        assert!(matches!(
            seg.commit_response("u1", b"fresh"),
            Err(QueueError::DuplicateKey(_))
        ));
        assert!(seg.input().read_by_key("u1").is_ok());
        assert_eq!(seg.output().read_by_key("u1").unwrap().payload, b"stale");
        seg.teardown().unwrap();
    }

    #[test]
    fn test_reject() {
        let seg = Segment::create_unique(&small()).unwrap();
        seg.input().write("u1", b"request").unwrap();

        seg.reject("u1", b"error").unwrap();
        let parked = seg.input().read_by_key("u1").unwrap();
        assert_eq!(parked.state, EntryState::DeadLettered);
        assert!(seg.input().read_one().is_none());
        assert_eq!(seg.output().read_by_key("u1").unwrap().payload, b"error");
        seg.teardown().unwrap();
    }

    #[test]
    fn test_reconcile_keeps_dead_letters() {
        let seg = Segment::create_unique(&small()).unwrap();
        seg.input().write("u1", b"request").unwrap();
        seg.input().claim("u1").unwrap();
        seg.reject("u1", b"error").unwrap();

        let report = seg.reconcile();
        assert!(report.is_clean());
        let parked = seg.input().read_by_key("u1").unwrap();
        assert_eq!(parked.state, EntryState::DeadLettered);
        assert_eq!(seg.output().read_by_key("u1").unwrap().payload, b"error");
        seg.teardown().unwrap();
    }

    #[test]
    fn test_reconcile() {
        let seg = Segment::create_unique(&small()).unwrap();

        // Crash after writing the output but before removing the input
        seg.input().write("done", b"req").unwrap();
        seg.output().write("done", b"resp").unwrap();

        // Claimed by a process that has exited
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        seg.input().write("stuck", b"req").unwrap();
        {
            let _guard = seg.lock();
            seg.input.claim("stuck", dead_pid).unwrap();
        }

        // Claimed by us: left alone
        seg.input().write("mine", b"req").unwrap();
        seg.input().claim("mine").unwrap();

        let report = seg.reconcile();
        assert_eq!(report.completed_inputs, vec!["done".to_string()]);
        assert_eq!(report.released_claims, vec!["stuck".to_string()]);

        assert!(seg.input().read_by_key("done").is_err());
        assert_eq!(seg.output().read_by_key("done").unwrap().payload, b"resp");
        assert_eq!(seg.input().read_one().unwrap().key, "stuck");

        assert!(seg.reconcile().is_clean());
        seg.teardown().unwrap();
    }
}
