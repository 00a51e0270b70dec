//! Per-direction operation surface over a segment's tables
//!
//! Every operation takes the segment lock for exactly one table access, so
//! each call is atomic with respect to every other call from any process.

use crate::error::{QueueError, Result};
use crate::lock::current_pid;
use crate::segment::Segment;
use crate::table::Entry;
use std::fmt;

/// Which of the two queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Direction {
    /// Requests, caller to worker
    Input = 0,
    /// Responses, worker to caller
    Output = 1,
}

impl Direction {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Direction::Input),
            1 => Some(Direction::Output),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Input => "input",
            Direction::Output => "output",
        })
    }
}

/// Handle to one queue of a segment
#[derive(Clone, Copy)]
pub struct QueueManager<'a> {
    segment: &'a Segment,
    direction: Direction,
}

impl<'a> QueueManager<'a> {
    pub(crate) fn new(segment: &'a Segment, direction: Direction) -> Self {
        Self { segment, direction }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Insert a new entry
    ///
    /// Fails with [`QueueError::DuplicateKey`] if `key` is live (it is never
    /// overwritten) and with [`QueueError::QueueFull`] if no slot is free.
    pub fn write(&self, key: &str, payload: &[u8]) -> Result<()> {
        let _guard = self.segment.lock();
        let sequence = self.segment.table(self.direction).insert(key, payload)?;
        tracing::trace!(queue = %self.direction, key, sequence, len = payload.len(), "entry written");
        Ok(())
    }

    /// Oldest entry offered to consumers, without removing it
    pub fn read_one(&self) -> Option<Entry> {
        let _guard = self.segment.lock();
        self.segment.table(self.direction).oldest_ready()
    }

    /// Entry with `key`, without removing it
    pub fn read_by_key(&self, key: &str) -> Result<Entry> {
        let _guard = self.segment.lock();
        self.segment
            .table(self.direction)
            .get(key)
            .ok_or_else(|| QueueError::KeyNotFound(key.to_string()))
    }

    /// Like [`QueueManager::read_by_key`], mapping absence to `None`
    pub fn try_read_by_key(&self, key: &str) -> Option<Entry> {
        let _guard = self.segment.lock();
        self.segment.table(self.direction).get(key)
    }

    /// All live entries in insertion order, whatever their state
    pub fn scan(&self) -> Vec<Entry> {
        let _guard = self.segment.lock();
        self.segment.table(self.direction).entries()
    }

    /// Delete the entry with `key`
    pub fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.segment.lock();
        self.segment.table(self.direction).remove(key)?;
        tracing::trace!(queue = %self.direction, key, "entry removed");
        Ok(())
    }

    /// Read and remove the entry with `key` in one step
    pub fn take(&self, key: &str) -> Result<Entry> {
        let _guard = self.segment.lock();
        let table = self.segment.table(self.direction);
        let entry = table
            .get(key)
            .ok_or_else(|| QueueError::KeyNotFound(key.to_string()))?;
        table.remove(key)?;
        tracing::trace!(queue = %self.direction, key, "entry taken");
        Ok(entry)
    }

    /// Mark the entry as owned by this process
    ///
    /// Exactly one of several racing claimers succeeds; the rest get
    /// [`QueueError::AlreadyClaimed`]. Claimed entries are no longer returned
    /// by [`QueueManager::read_one`].
    pub fn claim(&self, key: &str) -> Result<Entry> {
        let _guard = self.segment.lock();
        self.segment.table(self.direction).claim(key, current_pid())
    }

    /// Give a claimed entry back to other consumers
    pub fn release(&self, key: &str) -> Result<()> {
        let _guard = self.segment.lock();
        self.segment.table(self.direction).release(key)
    }

    /// Park an entry that cannot be processed
    pub fn dead_letter(&self, key: &str) -> Result<()> {
        let _guard = self.segment.lock();
        self.segment.table(self.direction).dead_letter(key)?;
        tracing::warn!(queue = %self.direction, key, "entry dead-lettered");
        Ok(())
    }

    pub fn len(&self) -> usize {
        let _guard = self.segment.lock();
        self.segment.table(self.direction).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty this queue only
    pub fn clear(&self) {
        let _guard = self.segment.lock();
        self.segment.table(self.direction).clear();
        tracing::debug!(queue = %self.direction, "queue cleared");
    }
}
