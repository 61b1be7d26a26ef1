//! Bridge orchestration
//!
//! The orchestrator:
//! 1. Validates requests against the chain registry and fee model
//! 2. Creates transactions and spawns one lifecycle task per transaction
//! 3. Routes validator quorum signals to the owning lifecycle
//! 4. Resumes unresolved transactions on startup

pub mod engine;
pub mod lifecycle;

pub use engine::{AttestationAck, BridgeOrchestrator, InitiateReceipt, InitiateRequest};
