//! Shared types for the resource reservation and order fulfillment engine.
//!
//! Every component crate depends on this one for identifiers, money,
//! the user-facing error classes and the outbound event sink.

pub mod error;
pub mod events;
pub mod types;

pub use error::ErrorKind;
pub use events::{DomainEvent, EventPublisher, InMemoryEventPublisher, LoggingEventPublisher};
pub use types::{ActorId, Money, ProductId, short_code};
