//! # vmlease-id
//!
//! Identifier types for the vmlease broker.
//!
//! - [`UserId`] is handed to us by whatever authenticated the caller. We never
//!   interpret it beyond checking that it is a sane, non-empty token.
//! - [`ResourceId`] is a small integer drawn from the allocator domain. Backends
//!   embed its decimal form in the names of the cloud objects they create.
//! - [`ConnectionId`] and [`RequestId`] are ULID-backed, prefixed ids
//!   (`conn_01HV…`, `req_01HV…`) generated locally for handles and log
//!   correlation.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
