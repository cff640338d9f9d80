//! Cloud-relay gateway for the machine controller: pairing, registration,
//! and a supervised WebSocket connection with memory-aware admission
//! control.

// Declare the modules to re-export
pub mod core;
pub mod pairing;
pub mod transport;

// Re-export the surface the binaries wire together
pub use crate::core::admission::{AdmissionConfig, AdmissionController};
pub use crate::core::arbitration::ArbitrationPolicy;
pub use crate::core::backoff::{AuthDecision, Backoff, BackoffConfig};
pub use crate::core::connection::{CloudConnection, ConnectionConfig, ConnectionState, Credentials};
pub use crate::core::memory::{MemoryBudget, MemoryProbe, MemoryReading};
pub use crate::core::queue::{OutboundQueue, PendingMessage, QueueConfig};
pub use pairing::{PairingConfig, PairingError, PairingManager};
pub use transport::ws::WsTransport;
pub use transport::{Frame, SessionHandle, Transport, TransportError, TransportEvent};
