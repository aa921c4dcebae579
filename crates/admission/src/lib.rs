//! Admission control for high-traffic events.
//!
//! A waiting room in front of the purchase flow: actors enter a queue per
//! event, are admitted oldest-first in fixed-size batches on a fixed
//! interval, and never more than the queue's capacity at once. Status is
//! available by polling or as a pushed [`Subscription`] stream.

pub mod config;
pub mod controller;
pub mod error;
pub mod queue;
pub mod stream;

pub use config::AdmissionConfig;
pub use controller::AdmissionController;
pub use error::{AdmissionError, Result};
pub use queue::{EntryStatus, EntryStatusView, QueueEntry, QueueKey, QueueSettings};
pub use stream::Subscription;
