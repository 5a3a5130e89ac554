//! Time identifiers for committed history events

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a point in history: wall-clock second plus an
/// intra-second sequence number. Ordered by `(secs, seq)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TimeId {
    /// Seconds since Unix epoch
    pub secs: i64,
    /// Sequence within the second
    pub seq: u32,
}

impl TimeId {
    /// Time of the root event
    pub const ROOT: TimeId = TimeId { secs: 0, seq: 0 };

    /// "Old time" passed to collaborators when objects are rebuilt on load
    pub const BEFORE_LOAD: TimeId = TimeId { secs: -1, seq: 0 };

    /// Create a time id
    pub fn new(secs: i64, seq: u32) -> Self {
        Self { secs, seq }
    }

    /// Whether this is the root time
    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    /// Subfile-name form, `"{secs}_{seq}"`
    pub fn to_key(&self) -> String {
        format!("{}_{}", self.secs, self.seq)
    }

    /// Parse the subfile-name form
    pub fn from_key(key: &str) -> Result<Self> {
        let (secs, seq) = key
            .split_once('_')
            .ok_or_else(|| Error::Storage(format!("Invalid time id key: {}", key)))?;
        let secs = secs
            .parse()
            .map_err(|_| Error::Storage(format!("Invalid time id seconds: {}", key)))?;
        let seq = seq
            .parse()
            .map_err(|_| Error::Storage(format!("Invalid time id sequence: {}", key)))?;
        Ok(Self { secs, seq })
    }

    /// Convert to chrono DateTime (sequence is dropped)
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.secs, 0)
    }
}

impl fmt::Display for TimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.secs, self.seq)
    }
}

impl FromStr for TimeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.replacen('.', "_", 1);
        Self::from_key(&normalized)
    }
}

/// Produces strictly increasing [`TimeId`]s from the wall clock.
#[derive(Debug, Clone, Default)]
pub struct TimeIdGenerator {
    last: Option<TimeId>,
}

impl TimeIdGenerator {
    /// Create a generator with no issued ids
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Next id for the current wall-clock second
    pub fn next(&mut self) -> TimeId {
        self.next_at(Utc::now().timestamp())
    }

    /// Next id given the wall-clock second `secs`.
    ///
    /// A clock that stands still or moves backwards keeps the last second
    /// and bumps the sequence. An exhausted sequence spills into the next
    /// second.
    pub fn next_at(&mut self, secs: i64) -> TimeId {
        let id = match self.last {
            Some(last) if secs <= last.secs => match last.seq.checked_add(1) {
                Some(seq) => TimeId::new(last.secs, seq),
                None => TimeId::new(last.secs + 1, 0),
            },
            _ => TimeId::new(secs.max(1), 0),
        };
        self.last = Some(id);
        id
    }

    /// Raise the floor so that future ids are greater than `id`
    pub fn observe(&mut self, id: TimeId) {
        if self.last.map(|last| id > last).unwrap_or(true) {
            self.last = Some(id);
        }
    }

    /// Last issued or observed id
    pub fn last(&self) -> Option<TimeId> {
        self.last
    }
}
