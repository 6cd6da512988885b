//! Shared vocabulary for the palaver messaging server: ids, access modes,
//! topic naming, the client/server envelope model, and the error taxonomy.

pub mod access;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod topic;

pub use access::AccessMode;
pub use envelope::{ClientEnvelope, ClientPayload, ServerEnvelope, ServerPayload};
pub use error::EngineError;
pub use ids::{Fingerprint, NodeId, SessionId, UserId};
pub use topic::{TopicCategory, TopicStatus};
