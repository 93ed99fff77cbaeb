//! Coordination store
//!
//! Parties never talk to each other directly; everything they share goes
//! through one study document held by a coordination store.
//!
//! # Modules
//!
//! - `memory`: in-process store (tests, single-host runs)
//! - `protocol`: wire messages and framing for the networked store
//! - `service`: TCP service hosting a study document
//! - `remote`: blocking client for the service

pub mod memory;
pub mod protocol;
pub mod remote;
pub mod service;

use std::sync::Arc;

use crate::error::Result;
use crate::study::{Phase, Role, StoreUpdate, StudyState};

pub use memory::MemoryStore;
pub use remote::RemoteStore;
pub use service::StoreService;

/// Read/patch access to the shared study document
///
/// Updates are per-field, last write wins. Implementations make no promise
/// of atomicity across fields.
pub trait CoordinationStore: Send + Sync {
    /// Full snapshot of the study document
    fn get_state(&self) -> Result<StudyState>;

    /// Apply one field assignment
    fn update(&self, update: &StoreUpdate) -> Result<()>;
}

/// Publishes this party's status, task and personal fields
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn CoordinationStore>,
    role: Role,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn CoordinationStore>, role: Role) -> Self {
        Self { store, role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn status(&self, phase: Phase) -> Result<()> {
        tracing::debug!(role = %self.role, "publishing status '{}'", phase);
        self.store.update(&StoreUpdate::status(self.role, phase))
    }

    /// Publish `not ready`, replacing any status left by an earlier run
    pub fn reset(&self) -> Result<()> {
        tracing::debug!(role = %self.role, "resetting status");
        self.store.update(&StoreUpdate::not_ready(self.role))
    }

    pub fn task(&self, label: &str) -> Result<()> {
        tracing::info!(role = %self.role, "task: {}", label);
        self.store.update(&StoreUpdate::task(self.role, label))
    }

    pub fn personal(&self, key: &str, value: &str) -> Result<()> {
        tracing::debug!(role = %self.role, "publishing {}={}", key, value);
        self.store.update(&StoreUpdate::personal(self.role, key, value))
    }
}
