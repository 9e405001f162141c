//! # MyDigest Core
//!
//! Shared vocabulary for the digest workspace: domain types, the error
//! taxonomy, configuration, and the collaborator traits the scheduler is
//! written against.
//!
//! ```text
//! Store ──────────────┐
//! FetchTransport ─────┤
//! TextGenerator ──────┼──► mydigest-scheduler (UserTaskScheduler)
//! DeliveryTransport ──┘
//! ```

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::MyDigestConfig;
pub use error::{DigestError, Result, parse_retry_after};
pub use traits::{DeliveryTransport, FetchTransport, Store, TextGenerator};
pub use types::{
    AggregatedItem, Digest, FetchedItem, RawItem, SendOutcome, Source, UserId,
};
