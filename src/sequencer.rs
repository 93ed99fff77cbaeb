//! Phase sequencer
//!
//! Top-level driver for one party:
//!
//! ```text
//! INIT -> PARAMS_RESOLVED -> SYNCED -> DATA_SHARED -> SYNCED_2 -> COMPUTED -> DONE
//! ```
//!
//! Any error moves the machine to `FAILED`, publishes the `FAILED` status
//! (best effort) and aborts the run. There is no automatic retry.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::barrier::PhaseBarrier;
use crate::error::Result;
use crate::orchestrator::{Invocation, ProcessOrchestrator};
use crate::params::{DataRoot, ParameterPreview, ParameterResolver};
use crate::store::{CoordinationStore, StatusReporter};
use crate::study::{Phase, Role};
use crate::wait::Poller;

pub const DATA_SHARING_TASK: &str = "Performing data sharing protocol";
pub const COMPUTATION_TASK: &str = "Performing computation protocol";

/// Which roles compute and which hand their data path to the data-sharing step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolePolicy {
    /// Roles below this run the computation executable
    pub computation_threshold: u8,
    /// Roles that append the data root to the data-sharing invocation
    pub data_provider_roles: Vec<u8>,
}

impl Default for RolePolicy {
    fn default() -> Self {
        Self {
            computation_threshold: 3,
            data_provider_roles: vec![3],
        }
    }
}

impl RolePolicy {
    pub fn computes(&self, role: Role) -> bool {
        role.get() < self.computation_threshold
    }

    pub fn provides_data(&self, role: Role) -> bool {
        self.data_provider_roles.contains(&role.get())
    }
}

/// Executables, relative to the executables directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Executables {
    pub data_sharing: PathBuf,
    pub computation: PathBuf,
    /// Parameter file directory as seen from the executables directory
    pub par_dir: PathBuf,
}

impl Default for Executables {
    fn default() -> Self {
        Self {
            data_sharing: PathBuf::from("bin/ShareData"),
            computation: PathBuf::from("bin/TrainSecureDTI"),
            par_dir: PathBuf::from("../par"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Init,
    ParamsResolved,
    Synced,
    DataShared,
    Synced2,
    Computed,
    Done,
    Failed,
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SequencerState::Init => "INIT",
            SequencerState::ParamsResolved => "PARAMS_RESOLVED",
            SequencerState::Synced => "SYNCED",
            SequencerState::DataShared => "DATA_SHARED",
            SequencerState::Synced2 => "SYNCED_2",
            SequencerState::Computed => "COMPUTED",
            SequencerState::Done => "DONE",
            SequencerState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

pub struct PhaseSequencer {
    reporter: StatusReporter,
    resolver: ParameterResolver,
    barrier: PhaseBarrier,
    orchestrator: ProcessOrchestrator,
    executables: Executables,
    policy: RolePolicy,
    data_root: DataRoot,
    demo: bool,
    state: SequencerState,
}

impl PhaseSequencer {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        role: Role,
        data_root: DataRoot,
        poller: Poller,
        orchestrator: ProcessOrchestrator,
    ) -> Self {
        Self {
            reporter: StatusReporter::new(store.clone(), role),
            resolver: ParameterResolver::new(store.clone(), role, data_root.clone(), poller.clone()),
            barrier: PhaseBarrier::new(store, role, poller),
            orchestrator,
            executables: Executables::default(),
            policy: RolePolicy::default(),
            data_root,
            demo: false,
            state: SequencerState::Init,
        }
    }

    /// Use the seeded `demo.par.{role}.txt` file and skip parameter resolution
    pub fn with_demo(mut self, demo: bool) -> Self {
        self.demo = demo;
        self
    }

    pub fn with_executables(mut self, executables: Executables) -> Self {
        self.executables = executables;
        self
    }

    pub fn with_role_policy(mut self, policy: RolePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_port_slots(mut self, port_slots: usize) -> Self {
        self.resolver = self.resolver.with_port_slots(port_slots);
        self
    }

    pub fn with_abort_on_peer_failure(mut self, abort: bool) -> Self {
        self.barrier = self.barrier.with_abort_on_peer_failure(abort);
        self
    }

    pub fn with_peer_failure_grace(mut self, grace: Duration) -> Self {
        self.barrier = self.barrier.with_failure_grace(grace);
        self
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.reporter.role()
    }

    pub fn is_demo(&self) -> bool {
        self.demo
    }

    /// Parameter file path handed to the executables
    pub fn par_file(&self) -> PathBuf {
        let prefix = if self.demo { "demo" } else { "test" };
        self.executables
            .par_dir
            .join(format!("{}.par.{}.txt", prefix, self.role()))
    }

    /// Parameter file path as seen from this process
    pub fn local_par_file(&self) -> PathBuf {
        self.orchestrator.work_dir().join(self.par_file())
    }

    /// Resolve from the current document without publishing, for dry runs
    pub fn preview_parameters(&self) -> Result<ParameterPreview> {
        self.resolver.preview()
    }

    pub fn data_sharing_invocation(&self) -> Invocation {
        let invocation = Invocation::new(
            Phase::DataSharing,
            &self.executables.data_sharing,
            self.role(),
            self.par_file(),
        );
        if self.policy.provides_data(self.role()) {
            invocation.with_arg(self.data_root.as_str())
        } else {
            invocation
        }
    }

    /// `None` for roles the policy excludes from the computation
    pub fn computation_invocation(&self) -> Option<Invocation> {
        self.policy.computes(self.role()).then(|| {
            Invocation::new(
                Phase::Computation,
                &self.executables.computation,
                self.role(),
                self.par_file(),
            )
        })
    }

    pub fn orchestrator(&self) -> &ProcessOrchestrator {
        &self.orchestrator
    }

    /// Drive the party through every phase
    pub fn run(&mut self) -> Result<()> {
        match self.drive() {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(role = %self.role(), "run failed in state {}: {}", self.state, e);
                self.state = SequencerState::Failed;
                if let Err(publish) = self.reporter.status(Phase::Failed) {
                    tracing::warn!("could not publish FAILED status: {}", publish);
                }
                Err(e)
            }
        }
    }

    fn drive(&mut self) -> Result<()> {
        self.reporter.reset()?;
        if self.demo {
            tracing::info!("demo mode: using seeded parameter file {}", self.par_file().display());
        } else {
            let par_file = self.local_par_file();
            let resolved = self.resolver.resolve_into(&par_file)?;
            tracing::info!("wrote {} parameters to {}", resolved.len(), par_file.display());
        }
        self.advance(SequencerState::ParamsResolved);

        self.barrier.arrive(Phase::SyncingUp)?;
        self.advance(SequencerState::Synced);

        self.reporter.task(DATA_SHARING_TASK)?;
        self.reporter.status(Phase::DataSharing)?;
        self.orchestrator.run(&self.data_sharing_invocation())?;
        self.advance(SequencerState::DataShared);

        self.barrier.arrive(Phase::DataShared)?;
        self.advance(SequencerState::Synced2);

        self.reporter.task(COMPUTATION_TASK)?;
        self.reporter.status(Phase::Computation)?;
        match self.computation_invocation() {
            Some(invocation) => self.orchestrator.run(&invocation)?,
            None => tracing::info!(role = %self.role(), "role does not compute, skipping"),
        }
        self.advance(SequencerState::Computed);

        self.reporter.status(Phase::Finished)?;
        self.advance(SequencerState::Done);
        Ok(())
    }

    fn advance(&mut self, next: SequencerState) {
        tracing::debug!("{} -> {}", self.state, next);
        self.state = next;
    }
}
