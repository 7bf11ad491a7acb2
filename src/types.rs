//! Core identifiers and state enums shared by every node role.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

/// Current unix time in seconds.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

macro_rules! id_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            pub const ZERO: $name = $name(0);

            pub const fn new(raw: u64) -> Self {
                $name(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }

            pub fn is_zero(self) -> bool {
                self.0 == 0
            }

            pub fn to_bytes(self) -> [u8; 8] {
                self.0.to_be_bytes()
            }

            pub fn from_bytes(bytes: [u8; 8]) -> Self {
                $name(u64::from_be_bytes(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0.to_be_bytes()))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

id_type!(Oid, "8-byte object identifier, opaque, compared bytewise.");
id_type!(Tid, "8-byte transaction identifier, monotonic cluster-wide.");
id_type!(Ptid, "Partition-table revision identifier.");
id_type!(NodeId, "8-byte node identity, assigned by the primary master.");

impl Oid {
    /// Successor OID, used when handing out allocation batches.
    pub fn next(self) -> Oid {
        Oid(self.0 + 1)
    }
}

impl Tid {
    /// Smallest TID strictly greater than `self`.
    pub fn next(self) -> Tid {
        Tid(self.0 + 1)
    }
}

/// Role of a node in the cluster.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum NodeType {
    Master,
    Storage,
    Client,
    Admin,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Master => "master",
            NodeType::Storage => "storage",
            NodeType::Client => "client",
            NodeType::Admin => "admin",
        };
        f.write_str(s)
    }
}

/// Liveness / administrative state of a node, as decided by the primary.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum NodeState {
    Running,
    TemporarilyDown,
    Down,
    Broken,
    Hidden,
    Pending,
    Unknown,
}

impl NodeState {
    /// A node in this state may participate in the cluster.
    pub fn is_running(self) -> bool {
        matches!(self, NodeState::Running)
    }
}

/// State of one partition assignment on one storage node.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum CellState {
    UpToDate,
    OutOfDate,
    Feeding,
    Discarded,
}

impl CellState {
    pub fn is_readable(self) -> bool {
        matches!(self, CellState::UpToDate | CellState::Feeding)
    }

    pub fn is_writable(self) -> bool {
        matches!(
            self,
            CellState::UpToDate | CellState::OutOfDate | CellState::Feeding
        )
    }
}

/// Cluster-wide state machine, held by the primary master.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ClusterState {
    Recovering,
    Verifying,
    Running,
    Stopping,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterState::Recovering => "recovering",
            ClusterState::Verifying => "verifying",
            ClusterState::Running => "running",
            ClusterState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// SHA3-256 digest of an object payload as stored on the wire and on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    pub fn of(data: &[u8]) -> Checksum {
        let mut hasher = Sha3_256::new();
        hasher.update(data);
        Checksum(hasher.finalize().into())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", &hex::encode(self.0)[..12])
    }
}

/// TID generator backed by the real-time clock.
///
/// The high 32 bits pack the UTC `(year, month, day, hour, minute)`; the low
/// 32 bits scale seconds-within-minute by `2^32 / 60`. TIDs stay strictly
/// increasing even when the clock steps backwards: the low word is bumped
/// past the last issued value.
#[derive(Debug, Default)]
pub struct TidClock {
    last: Tid,
}

impl TidClock {
    pub fn new() -> TidClock {
        TidClock { last: Tid::ZERO }
    }

    /// Highest TID issued or observed so far.
    pub fn last(&self) -> Tid {
        self.last
    }

    /// Raise the floor, e.g. after recovering a last TID from storages.
    pub fn observe(&mut self, tid: Tid) {
        if tid > self.last {
            self.last = tid;
        }
    }

    /// Issue the next TID, strictly greater than everything seen before.
    pub fn next(&mut self) -> Tid {
        let candidate = tid_from_datetime(Utc::now());
        self.last = if candidate > self.last {
            candidate
        } else {
            self.last.next()
        };
        self.last
    }
}

/// Pack a wall-clock instant into the 64-bit TID encoding.
pub fn tid_from_datetime(at: DateTime<Utc>) -> Tid {
    let minutes = ((((at.year() as u64 * 12 + at.month() as u64 - 1) * 31
        + at.day() as u64
        - 1)
        * 24
        + at.hour() as u64)
        * 60)
        + at.minute() as u64;
    let in_minute =
        at.second() as f64 + f64::from(at.nanosecond().min(999_999_999)) / 1_000_000_000.0;
    let low = ((in_minute / 60.0) * (1u64 << 32) as f64) as u64 & 0xffff_ffff;
    Tid::new((minutes << 32) | low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn id_ordering_matches_byte_ordering() {
        let a = Tid::new(0x0100);
        let b = Tid::new(0x0200);
        assert!(a < b);
        assert!(a.to_bytes() < b.to_bytes());
        assert_eq!(Tid::from_bytes(a.to_bytes()), a);
    }

    #[test]
    fn zero_is_sentinel() {
        assert!(Oid::ZERO.is_zero());
        assert!(!Oid::new(1).is_zero());
    }

    #[test]
    fn tid_encoding_is_time_ordered() {
        let early = Utc.with_ymd_and_hms(2024, 3, 1, 10, 20, 30).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 3, 1, 10, 21, 0).unwrap();
        assert!(tid_from_datetime(early) < tid_from_datetime(late));
    }

    #[test]
    fn tid_clock_is_strictly_monotonic() {
        let mut clock = TidClock::new();
        let mut prev = Tid::ZERO;
        for _ in 0..1000 {
            let tid = clock.next();
            assert!(tid > prev);
            prev = tid;
        }
    }

    #[test]
    fn tid_clock_survives_clock_regression() {
        let mut clock = TidClock::new();
        // Observe a TID from far in the future, as if the wall clock
        // regressed afterwards.
        let future = tid_from_datetime(Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap());
        clock.observe(future);
        let tid = clock.next();
        assert!(tid > future);
    }

    #[test]
    fn checksum_detects_corruption() {
        let sum = Checksum::of(b"hello");
        assert_eq!(sum, Checksum::of(b"hello"));
        assert_ne!(sum, Checksum::of(b"hellp"));
    }
}
