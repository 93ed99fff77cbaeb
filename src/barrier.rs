//! Phase barrier
//!
//! A party publishes its arrival at a phase, then polls the study document
//! until every participant has reached that phase. Returning from
//! [`PhaseBarrier::arrive`] means the party has *observed* full convergence,
//! not merely announced its own arrival.
//!
//! A participant counts as arrived while its status lies between the target
//! phase and the next barrier phase (see [`Phase::arrived_at`]). Statuses
//! outside that window, such as `finished` from an earlier run, keep it
//! pending.
//!
//! A participant that publishes `FAILED` aborts the wait once it has stayed
//! `FAILED` for the failure grace period. A restarted peer replaces the
//! status within that period and the barrier keeps waiting for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::store::{CoordinationStore, StatusReporter};
use crate::study::{Phase, Role, StudyState};
use crate::wait::{Poll, Poller};

/// Task label published while waiting at a barrier
pub const SYNC_TASK: &str = "Syncing up machines";

/// How long a peer must stay `FAILED` before a barrier gives up on it
pub const DEFAULT_FAILURE_GRACE: Duration = Duration::from_secs(30);

pub struct PhaseBarrier {
    reporter: StatusReporter,
    poller: Poller,
    abort_on_peer_failure: bool,
    failure_grace: Duration,
}

/// Where the participants stand relative to a target phase
#[derive(Debug, PartialEq, Eq)]
enum Convergence {
    Complete,
    /// `failed` is the subset of `pending` currently published as `FAILED`
    Waiting { pending: Vec<String>, failed: Vec<String> },
}

impl PhaseBarrier {
    pub fn new(store: Arc<dyn CoordinationStore>, role: Role, poller: Poller) -> Self {
        Self {
            reporter: StatusReporter::new(store, role),
            poller,
            abort_on_peer_failure: true,
            failure_grace: DEFAULT_FAILURE_GRACE,
        }
    }

    /// Keep polling when a peer publishes `FAILED` instead of aborting
    pub fn with_abort_on_peer_failure(mut self, abort: bool) -> Self {
        self.abort_on_peer_failure = abort;
        self
    }

    /// Time a peer may stay `FAILED` before the barrier aborts
    pub fn with_failure_grace(mut self, grace: Duration) -> Self {
        self.failure_grace = grace;
        self
    }

    /// Announce arrival at `phase` and block until all participants reached it
    pub fn arrive(&self, phase: Phase) -> Result<()> {
        self.reporter.status(phase)?;
        self.reporter.task(SYNC_TASK)?;
        tracing::info!("begin syncing up at phase '{}'", phase);

        let store = self.reporter.store();
        let mut failed_since: HashMap<String, Instant> = HashMap::new();
        self.poller.wait(&format!("all participants at '{}'", phase), || {
            let state = store.get_state()?;
            let (pending, failed) = match convergence(&state, phase) {
                Convergence::Complete => return Ok(Poll::Ready(())),
                Convergence::Waiting { pending, failed } => (pending, failed),
            };

            failed_since.retain(|participant, _| failed.contains(participant));
            for participant in &failed {
                let since = *failed_since
                    .entry(participant.clone())
                    .or_insert_with(Instant::now);
                if self.abort_on_peer_failure && since.elapsed() >= self.failure_grace {
                    tracing::error!("participant {} reported FAILED, abandoning barrier", participant);
                    return Err(Error::PeerFailed {
                        participant: participant.clone(),
                        phase,
                    });
                }
            }

            if failed.is_empty() {
                Ok(Poll::Pending(format!(
                    "Waiting for all participants to sync up ({} pending: {})...",
                    pending.len(),
                    pending.join(", ")
                )))
            } else {
                Ok(Poll::Pending(format!(
                    "Participants {} reported FAILED; still waiting at '{}'...",
                    failed.join(", "),
                    phase
                )))
            }
        })?;

        tracing::info!("finished syncing up at phase '{}'", phase);
        Ok(())
    }
}

fn convergence(state: &StudyState, phase: Phase) -> Convergence {
    let mut pending = Vec::new();
    let mut failed = Vec::new();

    for participant in &state.participants {
        match state.phase_of(participant) {
            Some(current) if current.arrived_at(phase) => {}
            Some(Phase::Failed) => {
                failed.push(participant.clone());
                pending.push(participant.clone());
            }
            _ => pending.push(participant.clone()),
        }
    }

    if pending.is_empty() {
        Convergence::Complete
    } else {
        Convergence::Waiting { pending, failed }
    }
}
