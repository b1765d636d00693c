//! `civic-core`: identifiers and the domain error model shared by every crate
//! of the job pipeline.
//!
//! Nothing here touches storage or the async runtime.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, OwnerId};
