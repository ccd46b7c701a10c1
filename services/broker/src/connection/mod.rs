//! Client connections.
//!
//! - [`ConnectionRegistry`]: admission (one live connection per user) and
//!   last-activity tracking, read by the idle reaper
//! - [`ConnectionStateMachine`]: turns a connection's requests into manager
//!   calls and manager outcomes into outbound messages
//! - [`protocol`]: the JSON messages exchanged with the client

mod machine;
pub mod protocol;
mod registry;

pub use machine::{ConnectionState, ConnectionStateMachine, RequestOutcome};
pub use protocol::{Inbound, Outbound, ProtocolError};
pub use registry::{AdmissionError, ConnectionEntry, ConnectionRegistry};
