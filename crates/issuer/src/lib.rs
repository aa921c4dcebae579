//! Limited-resource issuance.
//!
//! Coupons and time-deal units share one allocation discipline:
//!
//! 1. cheap local checks (active, inside the validity window);
//! 2. one atomic check-and-decrement against a [`CounterStore`], which
//!    also enforces the per-actor limit and yields a sentinel outcome
//!    instead of blocking;
//! 3. only then the durable grant or purchase record and the durable
//!    counter mirror are written.

pub mod counter;
pub mod coupon;
pub mod coupon_service;
pub mod error;
pub mod redis_store;
pub mod store;
pub mod timedeal;
pub mod timedeal_service;

pub use counter::{CounterKeys, CounterStore, InMemoryCounterStore, IssueOutcome, IssueRequest};
pub use coupon::{Coupon, CouponGrant, CouponStatus, DiscountType, GrantStatus, NewCoupon};
pub use coupon_service::CouponIssuer;
pub use error::{IssuerError, Result};
pub use redis_store::RedisCounterStore;
pub use store::IssuanceStore;
pub use timedeal::{
    NewTimeDeal, NewTimeDealProduct, TimeDeal, TimeDealProduct, TimeDealPurchase, TimeDealStatus,
};
pub use timedeal_service::TimeDealService;
