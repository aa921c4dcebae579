//! Queue and entry records.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::ActorId;
use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, Result};

/// Identifies what a queue gates, e.g. `("timedeal", 12)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub event_type: String,
    pub event_id: i64,
}

impl QueueKey {
    pub fn new(event_type: impl Into<String>, event_id: i64) -> Self {
        Self {
            event_type: event_type.into(),
            event_id,
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.event_type, self.event_id)
    }
}

/// How many actors a queue lets through, and how fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Maximum number of actors admitted at the same time.
    pub max_capacity: usize,
    /// Maximum number of actors admitted per batch.
    pub batch_size: usize,
    /// Time between batches.
    pub batch_interval: Duration,
}

impl QueueSettings {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_capacity == 0 || self.batch_size == 0 {
            return Err(AdmissionError::InvalidSettings(
                "capacity and batch size must be positive".to_string(),
            ));
        }
        if self.batch_interval.is_zero() {
            return Err(AdmissionError::InvalidSettings(
                "batch interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_capacity: 100,
            batch_size: 10,
            batch_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Waiting,
    Admitted,
    Expired,
    Left,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Waiting => "WAITING",
            EntryStatus::Admitted => "ADMITTED",
            EntryStatus::Expired => "EXPIRED",
            EntryStatus::Left => "LEFT",
        }
    }

    /// Waiting or admitted.
    pub fn is_live(&self) -> bool {
        matches!(self, EntryStatus::Waiting | EntryStatus::Admitted)
    }
}

/// One actor's place in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub token: String,
    pub queue: QueueKey,
    pub actor: ActorId,
    pub status: EntryStatus,
    pub enqueued_at: DateTime<Utc>,
    pub admitted_at: Option<DateTime<Utc>>,
    /// End of the token's validity window. Moves forward on admission.
    pub expires_at: DateTime<Utc>,
    /// When the entry became EXPIRED or LEFT.
    pub closed_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub(crate) fn close(&mut self, status: EntryStatus, now: DateTime<Utc>) {
        self.status = status;
        self.closed_at = Some(now);
    }
}

/// What a caller sees when it polls or subscribes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryStatusView {
    pub token: String,
    pub status: EntryStatus,
    /// 1-based rank among waiting entries; `None` unless waiting.
    pub position: Option<u64>,
    pub estimated_wait_secs: Option<u64>,
    pub total_waiting: u64,
}

/// A queue's settings and its live membership.
#[derive(Debug)]
pub(crate) struct Queue {
    pub(crate) settings: QueueSettings,
    pub(crate) active: bool,
    /// Waiting tokens, oldest first.
    pub(crate) waiting: VecDeque<String>,
    pub(crate) admitted: HashSet<String>,
    pub(crate) last_batch_at: Option<tokio::time::Instant>,
}

impl Queue {
    pub(crate) fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            active: true,
            waiting: VecDeque::new(),
            admitted: HashSet::new(),
            last_batch_at: None,
        }
    }

    pub(crate) fn position_of(&self, token: &str) -> Option<u64> {
        self.waiting
            .iter()
            .position(|t| t == token)
            .map(|rank| rank as u64 + 1)
    }

    pub(crate) fn estimated_wait_secs(&self, position: u64) -> u64 {
        position / self.settings.batch_size as u64 * self.settings.batch_interval.as_secs()
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.settings
            .max_capacity
            .saturating_sub(self.admitted.len())
    }

    pub(crate) fn batch_due(&self, now: tokio::time::Instant) -> bool {
        match self.last_batch_at {
            None => true,
            Some(last) => now.duration_since(last) >= self.settings.batch_interval,
        }
    }

    pub(crate) fn remove(&mut self, token: &str) {
        self.waiting.retain(|t| t != token);
        self.admitted.remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(batch_size: usize, interval_secs: u64) -> Queue {
        Queue::new(QueueSettings {
            max_capacity: 2,
            batch_size,
            batch_interval: Duration::from_secs(interval_secs),
        })
    }

    #[test]
    fn position_is_one_based() {
        let mut q = queue(1, 1);
        q.waiting.extend(["a".to_string(), "b".to_string()]);
        assert_eq!(q.position_of("a"), Some(1));
        assert_eq!(q.position_of("b"), Some(2));
        assert_eq!(q.position_of("c"), None);
    }

    #[test]
    fn estimated_wait_uses_whole_batches() {
        let q = queue(10, 5);
        assert_eq!(q.estimated_wait_secs(1), 0);
        assert_eq!(q.estimated_wait_secs(25), 10);
    }

    #[test]
    fn free_slots_never_underflow() {
        let mut q = queue(1, 1);
        q.admitted.extend(["a", "b", "c"].map(String::from));
        assert_eq!(q.free_slots(), 0);
    }

    #[test]
    fn zero_batch_size_is_invalid() {
        let settings = QueueSettings {
            batch_size: 0,
            ..QueueSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(AdmissionError::InvalidSettings(_))
        ));
    }
}
