//! In-process coordination store
//!
//! Holds the study document behind a mutex. Cloning shares the document, so
//! several parties running as threads of one process (tests, a local demo)
//! coordinate exactly as they would through the networked store.

use std::sync::{Arc, Mutex};

use super::CoordinationStore;
use crate::error::{Error, Result};
use crate::study::{StoreUpdate, StudyState};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StudyState>>,
}

impl MemoryStore {
    pub fn new(state: StudyState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Run `f` against the document, bypassing role scoping
    ///
    /// Used to stage what an external actor (the study website, an operator)
    /// would write.
    pub fn edit<R>(&self, f: impl FnOnce(&mut StudyState) -> R) -> Result<R> {
        let mut state = self.state.lock().map_err(|_| Error::store("study document lock poisoned"))?;
        Ok(f(&mut state))
    }
}

impl CoordinationStore for MemoryStore {
    fn get_state(&self) -> Result<StudyState> {
        let state = self.state.lock().map_err(|_| Error::store("study document lock poisoned"))?;
        Ok(state.clone())
    }

    fn update(&self, update: &StoreUpdate) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::store("study document lock poisoned"))?;
        state.apply(update)?;
        state.last_update = Some(chrono::Utc::now().to_rfc3339());
        Ok(())
    }
}
