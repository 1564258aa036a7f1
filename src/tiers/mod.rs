pub mod expiry;
pub mod limits;

pub use expiry::{ExpiryConfig, ExpiryScheduler, ExpirySummary};
pub use limits::TierEngine;
