//! Shared study document and the types derived from it
//!
//! A [`StudyState`] is the coordination document every party reads and patches
//! through the coordination store. Parties are identified by their position
//! in `participants` (their [`Role`]); phase progress is published as a
//! [`Phase`] label in `status`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Participant identifier (an email address in hosted studies)
pub type ParticipantId = String;

/// Parameter key as it appears in the parameter file (e.g. `NUM_THREADS`)
pub type ParamKey = String;

/// Personal parameter holding a party's network address
pub const IP_ADDRESS: &str = "IP_ADDRESS";

/// Personal parameter holding a party's comma-separated port list
pub const PORTS: &str = "PORTS";

/// A single parameter value as stored in the study document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamValue {
    #[serde(default)]
    pub value: String,
}

impl ParamValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }
}

/// Coordination document for one study
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyState {
    #[serde(default)]
    pub title: String,
    /// Ordered participants; index is the role number
    pub participants: Vec<ParticipantId>,
    /// Published phase label per participant
    #[serde(default)]
    pub status: BTreeMap<ParticipantId, String>,
    /// Human-readable task label per participant
    #[serde(default)]
    pub tasks: BTreeMap<ParticipantId, String>,
    /// Shared parameters
    #[serde(default)]
    pub parameters: BTreeMap<ParamKey, ParamValue>,
    /// Overrides merged over `parameters`
    #[serde(default)]
    pub advanced_parameters: BTreeMap<ParamKey, ParamValue>,
    /// Per-participant parameters (IP address, ports, results path, ...)
    #[serde(default)]
    pub personal_parameters: BTreeMap<ParticipantId, BTreeMap<ParamKey, ParamValue>>,
    /// RFC 3339 stamp of the last applied update
    #[serde(default)]
    pub last_update: Option<String>,
}

impl StudyState {
    /// Create a study with the given participants and empty personal records
    pub fn new(title: impl Into<String>, participants: Vec<ParticipantId>) -> Self {
        let personal_parameters = participants
            .iter()
            .map(|p| (p.clone(), BTreeMap::new()))
            .collect();

        Self {
            title: title.into(),
            participants,
            personal_parameters,
            ..Default::default()
        }
    }

    /// Participant holding `role`
    pub fn participant(&self, role: Role) -> Result<&ParticipantId> {
        self.participants
            .get(role.index())
            .ok_or(Error::UnknownRole {
                role: role.get(),
                participants: self.participants.len(),
            })
    }

    /// Personal parameter value, `None` if the record or key is absent
    pub fn personal(&self, participant: &str, key: &str) -> Option<&str> {
        self.personal_parameters
            .get(participant)
            .and_then(|params| params.get(key))
            .map(|p| p.value.as_str())
    }

    /// Published phase of a participant, if it parses as a known phase
    pub fn phase_of(&self, participant: &str) -> Option<Phase> {
        self.status.get(participant).and_then(|label| Phase::from_label(label))
    }

    /// Apply one role-scoped update (last write wins per field)
    pub fn apply(&mut self, update: &StoreUpdate) -> Result<()> {
        let participant = self.participant(update.role)?.clone();

        match &update.field {
            UpdateField::Status(label) => {
                self.status.insert(participant, label.clone());
            }
            UpdateField::Task(label) => {
                self.tasks.insert(participant, label.clone());
            }
            UpdateField::Personal { key, value } => {
                self.personal_parameters
                    .entry(participant)
                    .or_default()
                    .insert(key.clone(), ParamValue::new(value.clone()));
            }
        }

        Ok(())
    }
}

/// Party position in the protocol, `0..=Role::MAX`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Role(u8);

impl Role {
    /// Highest role number the protocol supports
    pub const MAX: u8 = 3;

    pub fn new(role: u8) -> Result<Self> {
        if role > Self::MAX {
            return Err(Error::InvalidRole(role));
        }
        Ok(Self(role))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u8> for Role {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Role::new(value)
    }
}

impl From<Role> for u8 {
    fn from(role: Role) -> u8 {
        role.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol phase as published in the study `status` map
///
/// Variants are declared in protocol order; the derived ordering is the
/// order parties move through them. `Failed` is terminal and sorts last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    SyncingUp,
    DataSharing,
    DataShared,
    Computation,
    Finished,
    Failed,
}

impl Phase {
    /// Label written to and read from the study `status` map
    pub fn label(self) -> &'static str {
        match self {
            Phase::SyncingUp => "syncing up",
            Phase::DataSharing => "data sharing",
            Phase::DataShared => "data sharing complete",
            Phase::Computation => "starting computation",
            Phase::Finished => "finished",
            Phase::Failed => "FAILED",
        }
    }

    /// Parse a status label; labels outside the protocol (e.g. `not ready`) yield `None`
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "syncing up" => Some(Phase::SyncingUp),
            "data sharing" => Some(Phase::DataSharing),
            "data sharing complete" => Some(Phase::DataShared),
            "starting computation" => Some(Phase::Computation),
            "finished" => Some(Phase::Finished),
            "FAILED" => Some(Phase::Failed),
            _ => None,
        }
    }

    /// Whether a live party published as `self` has arrived at `barrier`
    ///
    /// A party may run ahead of a barrier, but never past the next one,
    /// since that would need this party's own arrival. Anything outside that
    /// window is left over from an earlier run. `Failed` arrives nowhere.
    pub fn arrived_at(self, barrier: Phase) -> bool {
        let upper = BARRIER_PHASES
            .iter()
            .copied()
            .find(|&next| next > barrier)
            .unwrap_or(Phase::Finished);
        (barrier..=upper).contains(&self)
    }
}

/// Phases a party publishes by arriving at a barrier, in protocol order
pub const BARRIER_PHASES: [Phase; 2] = [Phase::SyncingUp, Phase::DataShared];

/// Status label a party publishes before it has entered the protocol
pub const NOT_READY: &str = "not ready";

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Field assigned by a [`StoreUpdate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateField {
    Status(String),
    Task(String),
    Personal { key: ParamKey, value: String },
}

/// One field assignment scoped to the publishing role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUpdate {
    pub role: Role,
    pub field: UpdateField,
}

/// Prefix of the textual update command
const COMMAND_PREFIX: &str = "update_firestore::";

impl StoreUpdate {
    pub fn status(role: Role, phase: Phase) -> Self {
        Self {
            role,
            field: UpdateField::Status(phase.label().to_string()),
        }
    }

    /// Status update clearing whatever an earlier run left behind
    pub fn not_ready(role: Role) -> Self {
        Self {
            role,
            field: UpdateField::Status(NOT_READY.to_string()),
        }
    }

    pub fn task(role: Role, label: impl Into<String>) -> Self {
        Self {
            role,
            field: UpdateField::Task(label.into()),
        }
    }

    pub fn personal(role: Role, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            role,
            field: UpdateField::Personal {
                key: key.into(),
                value: value.into(),
            },
        }
    }

    /// Textual command form, `update_firestore::KEY=value`
    pub fn to_command(&self) -> String {
        let (key, value) = match &self.field {
            UpdateField::Status(v) => ("status", v.as_str()),
            UpdateField::Task(v) => ("task", v.as_str()),
            UpdateField::Personal { key, value } => (key.as_str(), value.as_str()),
        };
        format!("{}{}={}", COMMAND_PREFIX, key, value)
    }

    /// Parse a textual command issued on behalf of `role`
    pub fn parse_command(role: Role, command: &str) -> Option<Self> {
        let body = command.strip_prefix(COMMAND_PREFIX)?;
        let (key, value) = body.split_once('=')?;
        if key.is_empty() {
            return None;
        }

        Some(match key {
            "status" => Self {
                role,
                field: UpdateField::Status(value.to_string()),
            },
            "task" => Self::task(role, value),
            _ => Self::personal(role, key, value),
        })
    }
}
