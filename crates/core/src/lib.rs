//! `drainq-core`: queue foundation building blocks.
//!
//! This crate contains **pure** primitives shared by the extraction and queue crates
//! (identifiers, errors, optimistic-concurrency tokens, time). No IO lives here.

pub mod clock;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, OwnerId};
pub use version::ExpectedVersion;
