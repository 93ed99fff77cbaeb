//! Parameter resolution
//!
//! Builds the role-specific parameter set handed to the external
//! executables and writes it into the party's parameter file.
//!
//! # Merge order
//!
//! 1. Shared `parameters`
//! 2. `advanced_parameters` (win on key collision)
//! 3. Derived keys:
//!    - `NUM_THREADS`: host CPU count
//!    - `IP_ADDR_P{i}` for every participant `i`
//!    - `PORT_P{i}_P{j}` for `j > i`, entry `j` of party `i`'s port list
//!    - data file paths under the local data root
//!
//! Peers publish their network details asynchronously, so resolution waits
//! (polling the store) until every participant has a non-empty IP address and
//! a port list long enough for the pairs it owns.

pub mod data_root;
pub mod file;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store::{CoordinationStore, StatusReporter};
use crate::study::{Role, StudyState, IP_ADDRESS, PORTS};
use crate::wait::{Poll, Poller};

pub use data_root::DataRoot;

/// Flattened `key -> value` parameters for one role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedParameterSet {
    values: BTreeMap<String, String>,
}

impl ResolvedParameterSet {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Rewrite the matching lines of a parameter file
    pub fn write_to(&self, par_file: &Path) -> Result<()> {
        file::rewrite_file(par_file, &self.values)
    }

    fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

/// Parameters resolvable right now, and the peer entries still missing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterPreview {
    pub parameters: ResolvedParameterSet,
    /// `(participant, key)` pairs not yet published
    pub missing: Vec<(String, &'static str)>,
}

/// Network details a participant has published
#[derive(Debug, Clone)]
struct PeerRecord {
    ip: String,
    ports: Vec<String>,
}

/// Resolves the parameter set for one role from the study document
pub struct ParameterResolver {
    reporter: StatusReporter,
    data_root: DataRoot,
    poller: Poller,
    port_slots: usize,
    cpu_count: usize,
}

impl ParameterResolver {
    pub fn new(store: Arc<dyn CoordinationStore>, role: Role, data_root: DataRoot, poller: Poller) -> Self {
        Self {
            reporter: StatusReporter::new(store, role),
            data_root,
            poller,
            port_slots: Role::MAX as usize + 1,
            cpu_count: num_cpus::get(),
        }
    }

    /// Number of role slots a port list covers (protocol-defined, 4 by default)
    pub fn with_port_slots(mut self, port_slots: usize) -> Self {
        self.port_slots = port_slots;
        self
    }

    /// Override the detected CPU count
    pub fn with_cpu_count(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count;
        self
    }

    /// Resolve and write into `par_file`
    pub fn resolve_into(&self, par_file: &Path) -> Result<ResolvedParameterSet> {
        tracing::info!("updating parameters in '{}'", par_file.display());
        let resolved = self.resolve()?;
        resolved.write_to(par_file)?;
        Ok(resolved)
    }

    /// Resolve the parameter set, waiting for peers as needed
    pub fn resolve(&self) -> Result<ResolvedParameterSet> {
        let mut state = self.reporter.store().get_state()?;
        state.participant(self.reporter.role())?;

        let mut resolved = self.base_parameters(&state);
        let cpus = self.cpu_count.to_string();
        self.reporter.personal("NUM_THREADS", &cpus)?;
        self.reporter.personal("NUM_CPUS", &cpus)?;

        let num_parties = state.participants.len();
        for i in 0..num_parties {
            let (peer, latest) = self.wait_for_peer(i, state)?;
            state = latest;
            self.insert_peer(&mut resolved, i, &peer, num_parties);
        }

        self.insert_data_paths(&mut resolved);
        Ok(resolved)
    }

    /// Resolve from a single snapshot without publishing or waiting
    ///
    /// Peers that have not published their network details yet are listed
    /// in [`ParameterPreview::missing`] instead of blocking.
    pub fn preview(&self) -> Result<ParameterPreview> {
        let state = self.reporter.store().get_state()?;
        state.participant(self.reporter.role())?;

        let mut parameters = self.base_parameters(&state);
        let mut missing = Vec::new();
        let num_parties = state.participants.len();
        for (i, participant) in state.participants.iter().enumerate() {
            match peer_record(&state, participant, i, num_parties) {
                Ok(peer) => self.insert_peer(&mut parameters, i, &peer, num_parties),
                Err(key) => missing.push((participant.clone(), key)),
            }
        }

        self.insert_data_paths(&mut parameters);
        Ok(ParameterPreview { parameters, missing })
    }

    /// Shared and advanced parameters plus `NUM_THREADS`
    fn base_parameters(&self, state: &StudyState) -> ResolvedParameterSet {
        let mut resolved = ResolvedParameterSet::default();
        for (key, param) in state.parameters.iter().chain(state.advanced_parameters.iter()) {
            resolved.insert(key.clone(), param.value.clone());
        }
        resolved.insert("NUM_THREADS", self.cpu_count.to_string());
        resolved
    }

    fn insert_peer(&self, resolved: &mut ResolvedParameterSet, i: usize, peer: &PeerRecord, num_parties: usize) {
        resolved.insert(format!("IP_ADDR_P{}", i), peer.ip.clone());
        for j in (i + 1)..self.port_slots.max(num_parties) {
            // Pairs with a role outside the study are optional
            if let Some(port) = peer.ports.get(j).filter(|p| !p.is_empty()) {
                resolved.insert(format!("PORT_P{}_P{}", i, j), port.clone());
            }
        }
    }

    fn insert_data_paths(&self, resolved: &mut ResolvedParameterSet) {
        resolved.insert("FEATURES_FILE", self.data_root.join("X"));
        resolved.insert("LABELS_FILE", self.data_root.join("y"));
        resolved.insert("TRAIN_SUFFIXES", self.data_root.join("train_suffixes.txt"));
        resolved.insert("TEST_SUFFIXES", self.data_root.join("test_suffixes.txt"));
    }

    /// Block until participant `index` has published what its pairs need
    ///
    /// Returns the record together with the snapshot it was read from.
    fn wait_for_peer(&self, index: usize, state: StudyState) -> Result<(PeerRecord, StudyState)> {
        let participant = state.participants[index].clone();
        let num_parties = state.participants.len();
        let mut first = Some(state);
        let mut missing_key = IP_ADDRESS;

        let waited = self.poller.wait(&format!("{} of {}", IP_ADDRESS, participant), || {
            let state = match first.take() {
                Some(state) => state,
                None => self.reporter.store().get_state()?,
            };

            match peer_record(&state, &participant, index, num_parties) {
                Ok(record) => Ok(Poll::Ready((record, state))),
                Err(key) => {
                    missing_key = key;
                    let what = if key == IP_ADDRESS { "IP address" } else { "port list" };
                    Ok(Poll::Pending(format!("{} for {} is empty. Waiting...", what, participant)))
                }
            }
        });

        match waited {
            Err(Error::Timeout { .. }) => Err(Error::MissingParameter {
                participant,
                key: missing_key.to_string(),
            }),
            other => other,
        }
    }
}

/// Read a participant's network details, or the key that is still missing
fn peer_record(
    state: &StudyState,
    participant: &str,
    index: usize,
    num_parties: usize,
) -> std::result::Result<PeerRecord, &'static str> {
    let ip = state.personal(participant, IP_ADDRESS).unwrap_or("").trim();
    if ip.is_empty() {
        return Err(IP_ADDRESS);
    }

    let ports: Vec<String> = match state.personal(participant, PORTS) {
        Some(list) if !list.trim().is_empty() => list.split(',').map(|p| p.trim().to_string()).collect(),
        _ => Vec::new(),
    };

    // Owns pairs (index, j) for every later participant j
    let required = (index + 1..num_parties).all(|j| ports.get(j).map_or(false, |p| !p.is_empty()));
    if !required {
        return Err(PORTS);
    }

    Ok(PeerRecord {
        ip: ip.to_string(),
        ports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::study::{ParamValue, StoreUpdate};
    use crate::wait::PollPolicy;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn poller(deadline_ms: Option<u64>) -> Poller {
        let mut policy = PollPolicy::new(Duration::from_millis(20));
        if let Some(ms) = deadline_ms {
            policy = policy.with_deadline(Duration::from_millis(ms));
        }
        Poller::new(policy)
    }

    fn role(r: u8) -> Role {
        Role::new(r).unwrap()
    }

    fn publish(store: &MemoryStore, r: u8, key: &str, value: &str) {
        store.update(&StoreUpdate::personal(role(r), key, value)).unwrap();
    }

    fn study(n: usize) -> MemoryStore {
        let participants = (0..n).map(|i| format!("party{}@example.org", i)).collect();
        let mut state = StudyState::new("dti", participants);
        state.parameters.insert("NUM_FEATURES".into(), ParamValue::new("100"));
        state.parameters.insert("ITERATIONS".into(), ParamValue::new("10"));
        state.advanced_parameters.insert("ITERATIONS".into(), ParamValue::new("20"));
        MemoryStore::new(state)
    }

    fn resolver(store: &MemoryStore, r: u8, deadline_ms: Option<u64>) -> ParameterResolver {
        ParameterResolver::new(
            Arc::new(store.clone()),
            role(r),
            DataRoot::new("/data/party"),
            poller(deadline_ms),
        )
        .with_cpu_count(8)
    }

    #[test]
    fn test_two_party_scenario() {
        let store = study(2);
        publish(&store, 0, IP_ADDRESS, "10.0.0.1");
        publish(&store, 0, PORTS, "1000,2000,3000,4000");
        publish(&store, 1, IP_ADDRESS, "10.0.0.2");

        let resolved = resolver(&store, 1, Some(1000)).resolve().unwrap();

        assert_eq!(resolved.get("IP_ADDR_P0"), Some("10.0.0.1"));
        assert_eq!(resolved.get("IP_ADDR_P1"), Some("10.0.0.2"));
        assert_eq!(resolved.get("PORT_P0_P1"), Some("2000"));
        assert_eq!(resolved.get("PORT_P0_P3"), Some("4000"));
        assert_eq!(resolved.get("PORT_P1_P2"), None);
    }

    #[test]
    fn test_merge_order_and_derived_keys() {
        let store = study(2);
        publish(&store, 0, IP_ADDRESS, "10.0.0.1");
        publish(&store, 0, PORTS, "1000,2000");
        publish(&store, 1, IP_ADDRESS, "10.0.0.2");

        let resolved = resolver(&store, 0, Some(1000)).resolve().unwrap();

        assert_eq!(resolved.get("NUM_FEATURES"), Some("100"));
        assert_eq!(resolved.get("ITERATIONS"), Some("20"));
        assert_eq!(resolved.get("NUM_THREADS"), Some("8"));
        assert_eq!(resolved.get("FEATURES_FILE"), Some("/data/party/X"));
        assert_eq!(resolved.get("LABELS_FILE"), Some("/data/party/y"));
        assert_eq!(resolved.get("TRAIN_SUFFIXES"), Some("/data/party/train_suffixes.txt"));
        assert_eq!(resolved.get("TEST_SUFFIXES"), Some("/data/party/test_suffixes.txt"));

        let state = store.get_state().unwrap();
        assert_eq!(state.personal("party0@example.org", "NUM_THREADS"), Some("8"));
        assert_eq!(state.personal("party0@example.org", "NUM_CPUS"), Some("8"));
    }

    #[test]
    fn test_port_assignment_complete() {
        let store = study(4);
        for r in 0..4u8 {
            publish(&store, r, IP_ADDRESS, &format!("10.0.0.{}", r + 1));
            let ports: Vec<String> = (0..4).map(|j| format!("{}{}", r, j)).collect();
            publish(&store, r, PORTS, &ports.join(","));
        }

        let resolved = resolver(&store, 2, Some(1000)).resolve().unwrap();

        let port_keys: Vec<&str> = resolved.iter().filter(|(k, _)| k.starts_with("PORT_")).map(|(k, _)| k).collect();
        assert_eq!(port_keys.len(), 6);
        for i in 0..4 {
            for j in (i + 1)..4 {
                assert_eq!(
                    resolved.get(&format!("PORT_P{}_P{}", i, j)),
                    Some(format!("{}{}", i, j).as_str())
                );
                assert_eq!(resolved.get(&format!("PORT_P{}_P{}", j, i)), None);
            }
        }
    }

    #[test]
    fn test_waits_for_empty_ip() {
        let store = study(2);
        publish(&store, 0, IP_ADDRESS, "10.0.0.1");
        publish(&store, 0, PORTS, "1000,2000");
        publish(&store, 1, IP_ADDRESS, "");

        let writer = store.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            publish(&writer, 1, IP_ADDRESS, "10.0.0.2");
            Instant::now()
        });

        let resolved = resolver(&store, 0, Some(5000)).resolve().unwrap();
        let done = Instant::now();
        let published = handle.join().unwrap();

        assert_eq!(resolved.get("IP_ADDR_P1"), Some("10.0.0.2"));
        // Completes within about one polling interval of the publish
        assert!(done.duration_since(published) < Duration::from_millis(500));
    }

    #[test]
    fn test_missing_ip_after_deadline() {
        let store = study(2);
        publish(&store, 0, IP_ADDRESS, "10.0.0.1");
        publish(&store, 0, PORTS, "1000,2000");

        let start = Instant::now();
        let err = resolver(&store, 0, Some(100)).resolve().unwrap_err();

        assert!(start.elapsed() >= Duration::from_millis(100));
        match err {
            Error::MissingParameter { participant, key } => {
                assert_eq!(participant, "party1@example.org");
                assert_eq!(key, IP_ADDRESS);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_short_port_list_is_missing() {
        let store = study(3);
        for r in 0..3u8 {
            publish(&store, r, IP_ADDRESS, "10.0.0.1");
        }
        publish(&store, 0, PORTS, "1000,2000");

        let err = resolver(&store, 1, Some(60)).resolve().unwrap_err();
        assert!(matches!(err, Error::MissingParameter { ref key, .. } if key == PORTS));
    }

    #[test]
    fn test_preview_reports_missing_without_publishing() {
        let store = study(3);
        publish(&store, 0, IP_ADDRESS, "10.0.0.1");
        publish(&store, 0, PORTS, "1000,2000,3000");
        publish(&store, 1, IP_ADDRESS, "10.0.0.2");

        let start = Instant::now();
        let preview = resolver(&store, 0, None).preview().unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));

        assert_eq!(preview.parameters.get("IP_ADDR_P0"), Some("10.0.0.1"));
        assert_eq!(preview.parameters.get("PORT_P0_P2"), Some("3000"));
        assert_eq!(preview.parameters.get("NUM_THREADS"), Some("8"));
        assert_eq!(preview.parameters.get("IP_ADDR_P2"), None);
        assert_eq!(
            preview.missing,
            vec![
                ("party1@example.org".to_string(), PORTS),
                ("party2@example.org".to_string(), IP_ADDRESS),
            ]
        );

        let state = store.get_state().unwrap();
        assert_eq!(state.personal("party0@example.org", "NUM_THREADS"), None);
        assert_eq!(state.personal("party0@example.org", "NUM_CPUS"), None);
    }

    #[test]
    fn test_unknown_role() {
        let store = study(2);
        let err = resolver(&store, 3, Some(50)).resolve().unwrap_err();
        assert!(matches!(err, Error::UnknownRole { role: 3, .. }));
    }

    #[test]
    fn test_resolve_into_is_deterministic() {
        let store = study(2);
        publish(&store, 0, IP_ADDRESS, "10.0.0.1");
        publish(&store, 0, PORTS, "1000,2000,3000,4000");
        publish(&store, 1, IP_ADDRESS, "10.0.0.2");

        let dir = TempDir::new().unwrap();
        let par = dir.path().join("test.par.1.txt");
        std::fs::write(
            &par,
            "ITERATIONS 1\nIP_ADDR_P0 127.0.0.1\nPORT_P0_P1 8000\nCACHE_FILE_PREFIX ../cache/test\n",
        )
        .unwrap();

        let r = resolver(&store, 1, Some(1000));
        r.resolve_into(&par).unwrap();
        let first = std::fs::read(&par).unwrap();
        r.resolve_into(&par).unwrap();
        let second = std::fs::read(&par).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            String::from_utf8(first).unwrap(),
            "ITERATIONS 20\nIP_ADDR_P0 10.0.0.1\nPORT_P0_P1 2000\nCACHE_FILE_PREFIX ../cache/test\n"
        );
    }
}
