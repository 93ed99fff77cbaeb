//! phasesync - Phase synchronization for multi-party secure computation
//!
//! Coordinates a fixed set of parties through the phases of an MPC protocol.
//! Each party runs the same control logic under a distinct role; parties only
//! ever talk through a shared study document held by a coordination store.
//!
//! # Architecture
//!
//! - **Coordination store**: in-memory, or a small TCP service shared by all parties
//! - **Parameter resolution**: per-role network addresses, ports and paths
//! - **Phase barrier**: no party advances until every party has reached the phase
//! - **Process orchestration**: protocol executables, optionally behind a SOCKS proxy
//! - **Phase sequencer**: drives one party from parameter resolution to `finished`

pub mod barrier;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod params;
pub mod sequencer;
pub mod store;
pub mod study;
pub mod wait;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use sequencer::{PhaseSequencer, SequencerState};
pub use store::CoordinationStore;
pub use study::{Phase, Role, StoreUpdate, StudyState};
