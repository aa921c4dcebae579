//! Error classes shared by every component.

use serde::{Deserialize, Serialize};

/// The user-visible class of a rejected operation.
///
/// Component errors map themselves onto one of these so that callers
/// (and the HTTP layer) can decide how to present a failure without
/// matching on every concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Insufficient stock, exhausted resource, admission not granted,
    /// lock contention. "Try later / sold out".
    Capacity,
    /// Stale client view: invalid transition, duplicate payment,
    /// already cancelled. "Refresh and retry".
    Conflict,
    /// The payment adapter failed or timed out and the charge was compensated.
    Adapter,
    /// Caller passed an argument that can never be valid.
    Invariant,
    /// The referenced record does not exist.
    NotFound,
    /// Infrastructure failure (database, counter store) or an
    /// unrecoverable compensation failure.
    Internal,
}

impl ErrorKind {
    /// Returns the class name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Capacity => "capacity",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Adapter => "adapter",
            ErrorKind::Invariant => "invariant",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }
}
