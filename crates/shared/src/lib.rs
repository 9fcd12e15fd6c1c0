//! Common types shared across BoxHQ crates

pub mod types;

pub use types::{BoxId, BoxStatus, MemberRole, PlanTier, UserId};
