//! Issuer error types.

use common::{ErrorKind, ProductId};
use thiserror::Error;

/// Errors that can occur while issuing or redeeming limited resources.
#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("Coupon not found: {0}")]
    CouponNotFound(i64),

    #[error("Coupon grant not found: {0}")]
    GrantNotFound(i64),

    #[error("Time deal not found: {0}")]
    TimeDealNotFound(i64),

    #[error("Product {product_id} is not part of time deal {deal_id}")]
    TimeDealProductNotFound { deal_id: i64, product_id: ProductId },

    #[error("Time deal purchase not found: {0}")]
    PurchaseNotFound(i64),

    /// Coupon deactivated or time deal not running.
    #[error("{resource} {id} is not active")]
    NotActive { resource: &'static str, id: i64 },

    #[error("{resource} {id} has not started yet")]
    NotStarted { resource: &'static str, id: i64 },

    #[error("{resource} {id} has expired")]
    Expired { resource: &'static str, id: i64 },

    /// No capacity left.
    #[error("{resource} {id} is exhausted")]
    Exhausted { resource: &'static str, id: i64 },

    /// The actor already holds this coupon.
    #[error("Coupon {coupon_id} already issued to {actor}")]
    AlreadyIssued { coupon_id: i64, actor: String },

    /// The actor reached the time deal's per-actor limit.
    #[error("Purchase limit of {limit} reached for product {product_id} in time deal {deal_id}")]
    PurchaseLimitExceeded {
        deal_id: i64,
        product_id: ProductId,
        limit: i64,
    },

    #[error("Coupon grant {0} has already been used")]
    GrantAlreadyUsed(i64),

    #[error("Coupon grant {0} has expired")]
    GrantExpired(i64),

    /// The grant is not currently redeemed against this order.
    #[error("Coupon grant {grant_id} is not held by order {order_number}")]
    GrantNotHeld { grant_id: i64, order_number: String },

    #[error("{resource} {id} does not belong to {actor}")]
    NotOwner {
        resource: &'static str,
        id: i64,
        actor: String,
    },

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i64),

    #[error("Invalid validity period: start must be before end")]
    InvalidPeriod,

    #[error("Invalid discount: {0}")]
    InvalidDiscount(String),

    /// Restore asked to return more than the actor holds.
    #[error("Nothing to restore for {actor} on {key}")]
    NothingToRestore { key: String, actor: String },

    #[error("Time deal {id} cannot change from {status}")]
    InvalidTimeDealStatus { id: i64, status: &'static str },

    /// Counter store error.
    #[error("Counter store error: {0}")]
    CounterStore(#[from] redis::RedisError),

    /// The counter store replied with something the script never returns.
    #[error("Unexpected counter store reply: {0}")]
    UnexpectedReply(i64),
}

impl IssuerError {
    /// Returns the user-visible class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IssuerError::CouponNotFound(_)
            | IssuerError::GrantNotFound(_)
            | IssuerError::TimeDealNotFound(_)
            | IssuerError::TimeDealProductNotFound { .. }
            | IssuerError::PurchaseNotFound(_) => ErrorKind::NotFound,
            IssuerError::NotActive { .. }
            | IssuerError::NotStarted { .. }
            | IssuerError::Expired { .. }
            | IssuerError::Exhausted { .. }
            | IssuerError::PurchaseLimitExceeded { .. } => ErrorKind::Capacity,
            IssuerError::AlreadyIssued { .. }
            | IssuerError::GrantAlreadyUsed(_)
            | IssuerError::GrantExpired(_)
            | IssuerError::GrantNotHeld { .. }
            | IssuerError::NotOwner { .. }
            | IssuerError::InvalidTimeDealStatus { .. } => ErrorKind::Conflict,
            IssuerError::InvalidQuantity(_)
            | IssuerError::InvalidPeriod
            | IssuerError::InvalidDiscount(_)
            | IssuerError::NothingToRestore { .. } => ErrorKind::Invariant,
            IssuerError::CounterStore(_) | IssuerError::UnexpectedReply(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience type alias for issuer results.
pub type Result<T> = std::result::Result<T, IssuerError>;
