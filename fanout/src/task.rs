// Copyright © 2026 The Fanout Contributors
//
// This file is part of fanout, distributed under the GPLv3 or later.

//! Task identity and the externally visible task snapshots.

use std::{
    fmt,
    str::FromStr,
    time::{Duration, SystemTime},
};

use rand::Rng as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Opaque handle for a submitted task.
///
/// Twelve bytes: a big-endian seconds-since-epoch prefix followed by eight
/// random bytes, so ids sort roughly by submission time while remaining
/// collision-free for the lifetime of a process. Rendered as 24 lowercase hex
/// characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId([u8; 12]);

impl TaskId {
    pub(crate) fn generate() -> Self {
        let mut bytes = [0u8; 12];
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        bytes[..4].copy_from_slice(&(secs as u32).to_be_bytes());
        rand::thread_rng().fill(&mut bytes[4..]);
        Self(bytes)
    }

    /// The all-zero id, used for records that describe no task at all.
    pub const fn nil() -> Self {
        Self([0; 12])
    }

    #[cfg(test)]
    pub(crate) const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TaskId({})", self)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid task id `{0}`")]
pub struct ParseTaskIdError(String);

impl FromStr for TaskId {
    type Err = ParseTaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.is_ascii() {
            return Err(ParseTaskIdError(s.to_owned()));
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| ParseTaskIdError(s.to_owned()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle state of a task.
///
/// Transitions are monotonic within one task: `Deferred` (defer only) to
/// `Pending` to `Running` to one of the terminal states. A task may jump from
/// `Pending` straight to `Canceled` if its scope fires before a worker slot is
/// acquired. `Unknown` is only ever reported for lookups of ids that are not
/// in the tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Deferred,
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
    Unknown,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deferred => "deferred",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of one task.
///
/// `result` is only present once the task completed, `error` only when it
/// failed, panicked or was canceled. The serialized form is what the
/// embedding boundary's `info` operation returns; the result payload is
/// marshaled separately and therefore skipped here.
#[derive(Clone, Debug, Serialize)]
#[serde(bound = "")]
pub struct TaskRecord<T> {
    pub id: TaskId,
    #[serde(skip)]
    pub result: Option<T>,
    #[serde(rename = "error_message", skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    #[serde(serialize_with = "epoch_millis", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<SystemTime>,
    #[serde(
        rename = "duration_ms",
        serialize_with = "duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,
    pub status: Status,
}

impl<T> TaskRecord<T> {
    /// A record describing no task: nil id, unknown status, no error.
    pub(crate) fn empty() -> Self {
        Self {
            id: TaskId::nil(),
            result: None,
            error: None,
            start_time: None,
            duration: None,
            status: Status::Unknown,
        }
    }

    pub(crate) fn not_found(id: TaskId) -> Self {
        Self {
            id,
            result: None,
            error: Some(Error::NotFound(id)),
            start_time: None,
            duration: None,
            status: Status::Unknown,
        }
    }

    pub(crate) fn deferred(id: TaskId) -> Self {
        Self {
            id,
            result: None,
            error: None,
            start_time: None,
            duration: None,
            status: Status::Deferred,
        }
    }
}

fn epoch_millis<S: Serializer>(
    time: &Option<SystemTime>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match time.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok()) {
        Some(since) => serializer.serialize_u64(since.as_millis() as u64),
        None => serializer.serialize_none(),
    }
}

fn duration_millis<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
        None => serializer.serialize_none(),
    }
}

/// Per-status totals over the current contents of the task tables.
///
/// The snapshot is consistent per entry but not atomic across the whole
/// table: a task transitioning while the counters are summed is counted in
/// exactly one of its two states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub deferred: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    pub total: usize,
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn id_roundtrips_through_display_and_parse() {
        let id = TaskId::generate();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 24);
        assert_eq!(rendered.parse::<TaskId>().unwrap(), id);
    }

    #[test]
    fn id_rejects_malformed_input() {
        assert!("".parse::<TaskId>().is_err());
        assert!("zz".parse::<TaskId>().is_err());
        assert!("0123456789abcdef0123456g".parse::<TaskId>().is_err());
        assert!("0123456789abcdef01234567ff".parse::<TaskId>().is_err());
    }

    #[test]
    fn id_generation_does_not_collide() {
        let ids = (0..1024).map(|_| TaskId::generate()).collect::<std::collections::HashSet<_>>();
        assert_eq!(ids.len(), 1024);
    }

    #[test]
    fn id_orders_by_time_prefix() {
        let earlier = TaskId::from_bytes([0, 0, 0, 1, 0xff, 0xff, 0, 0, 0, 0, 0, 0]);
        let later = TaskId::from_bytes([0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(earlier < later);
    }

    #[test]
    fn status_renders_lowercase() {
        assert_eq!(Status::Deferred.to_string(), "deferred");
        assert_eq!(Status::Running.to_string(), "running");
        assert_eq!(Status::Canceled.to_string(), "canceled");
    }

    #[test]
    fn terminal_statuses() {
        assert!(Status::Completed.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(Status::Canceled.is_terminal());
        assert!(!Status::Deferred.is_terminal());
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(!Status::Unknown.is_terminal());
    }

    #[test]
    fn record_serializes_boundary_shape() {
        let record = TaskRecord::<String> {
            id: TaskId::nil(),
            result: Some("ignored".to_owned()),
            error: Some(Error::Canceled),
            start_time: None,
            duration: Some(Duration::from_millis(1500)),
            status: Status::Canceled,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "000000000000000000000000");
        assert_eq!(json["status"], "canceled");
        assert_eq!(json["duration_ms"], 1500);
        assert_eq!(json["error_message"], "task canceled");
        assert!(json.get("result").is_none());
    }
}
