//! Admission error types.

use common::ErrorKind;
use thiserror::Error;

/// Errors that can occur in the admission controller.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// No queue has been configured for the event.
    #[error("No queue for {event_type} {event_id}")]
    QueueNotFound { event_type: String, event_id: i64 },

    /// The queue exists but is not accepting entries.
    #[error("Queue for {event_type} {event_id} is not active")]
    QueueInactive { event_type: String, event_id: i64 },

    #[error("Queue entry not found: {0}")]
    EntryNotFound(String),

    /// The entry holds no admitted slot.
    #[error("Queue entry {0} has not been admitted")]
    NotAdmitted(String),

    /// The entry is expired and can no longer change.
    #[error("Queue entry {token} is {status}")]
    EntryClosed { token: String, status: &'static str },

    #[error("Invalid queue settings: {0}")]
    InvalidSettings(String),
}

impl AdmissionError {
    /// Returns the user-visible class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdmissionError::QueueNotFound { .. }
            | AdmissionError::QueueInactive { .. }
            | AdmissionError::EntryNotFound(_) => ErrorKind::NotFound,
            AdmissionError::NotAdmitted(_) => ErrorKind::Capacity,
            AdmissionError::EntryClosed { .. } => ErrorKind::Conflict,
            AdmissionError::InvalidSettings(_) => ErrorKind::Invariant,
        }
    }
}

/// Convenience type alias for admission results.
pub type Result<T> = std::result::Result<T, AdmissionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_admitted_is_capacity() {
        assert_eq!(
            AdmissionError::NotAdmitted("t".into()).kind(),
            ErrorKind::Capacity
        );
        assert_eq!(
            AdmissionError::EntryNotFound("t".into()).to_string(),
            "Queue entry not found: t"
        );
    }
}
