//! Connection-management core: the state machine and the policies it
//! consults. Everything here is transport-agnostic; the wire lives in
//! [`crate::transport`].

pub mod admission;
pub mod arbitration;
pub mod backoff;
pub mod connection;
pub mod memory;
pub mod queue;

pub use admission::{AdmissionConfig, AdmissionController};
pub use arbitration::ArbitrationPolicy;
pub use backoff::{AuthDecision, Backoff, BackoffConfig};
pub use connection::{CloudConnection, ConnectionConfig, ConnectionState, Credentials};
pub use memory::{MemoryBudget, MemoryProbe, MemoryReading};
pub use queue::{OutboundQueue, PendingMessage, QueueConfig};
