//! Coordination store service
//!
//! Hosts one study document for all parties of a study. The service:
//! - Accepts connections from parties (one task per connection)
//! - Answers snapshot requests
//! - Applies role-scoped updates under a single lock (last write wins)
//! - Optionally persists the document to JSON after every update

use crate::store::protocol::*;
use crate::study::StudyState;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};

/// Store service
pub struct StoreService {
    /// Study document shared by all connections
    state: Arc<Mutex<StudyState>>,

    /// Write the document here after every update
    persist_path: Option<PathBuf>,

    /// Node identifier (hostname)
    node_id: String,
}

impl StoreService {
    /// Create a service hosting `state`
    pub fn new(state: StudyState, persist_path: Option<PathBuf>) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            persist_path,
            node_id: get_node_id(),
        }
    }

    /// Create a service from a JSON study document
    pub fn from_study_file(path: &Path, persist: bool) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read study file: {}", path.display()))?;
        let state: StudyState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse study file: {}", path.display()))?;

        if state.participants.len() < 2 {
            anyhow::bail!(
                "Study '{}' needs at least 2 participants, found {}",
                state.title,
                state.participants.len()
            );
        }

        let persist_path = persist.then(|| path.to_path_buf());
        Ok(Self::new(state, persist_path))
    }

    /// Bind to `0.0.0.0:listen_port` and serve until the process exits
    pub async fn run(self, listen_port: u16) -> Result<()> {
        let addr = format!("0.0.0.0:{}", listen_port);
        let listener = TcpListener::bind(&addr).await
            .context("Failed to bind store service")?;

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        {
            let state = self.lock_state()?;
            tracing::info!(
                node = %self.node_id,
                "store service for study '{}' listening on {} ({} participants)",
                state.title,
                listener.local_addr()?,
                state.participants.len()
            );
        }

        let service = Arc::new(self);
        loop {
            let (stream, peer) = listener.accept().await
                .context("Failed to accept connection")?;
            tracing::debug!("party connected from {}", peer);

            let service = service.clone();
            tokio::spawn(async move {
                if let Err(e) = service.handle_connection(stream).await {
                    tracing::warn!("connection from {} failed: {:#}", peer, e);
                }
            });
        }
    }

    /// Handle requests on one connection until the party disconnects
    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        while let Some(msg) = read_message(&mut stream).await? {
            let reply = self.handle_message(msg);
            write_message(&mut stream, &reply).await?;
        }
        Ok(())
    }

    fn handle_message(&self, msg: Message) -> Message {
        match msg {
            Message::GetState(req) => {
                if let Some(err) = self.check_version(req.protocol_version) {
                    return err;
                }
                self.snapshot()
            }
            Message::Update(req) => {
                if let Some(err) = self.check_version(req.protocol_version) {
                    return err;
                }
                match self.apply_update(&req) {
                    Ok(()) => Message::Ack,
                    Err(e) => self.error(format!("{:#}", e)),
                }
            }
            other => self.error(format!("Expected GET_STATE or UPDATE, got {:?}", other)),
        }
    }

    fn snapshot(&self) -> Message {
        let state = match self.lock_state() {
            Ok(state) => state.clone(),
            Err(e) => return self.error(format!("{:#}", e)),
        };
        Message::State(StateMessage { state })
    }

    fn apply_update(&self, req: &UpdateMessage) -> Result<()> {
        let mut state = self.lock_state()?;
        state.apply(&req.update)?;
        state.last_update = Some(chrono::Utc::now().to_rfc3339());
        tracing::info!("role {}: {}", req.update.role, req.update.to_command());

        // Persisted under the lock: file contents follow update order
        if let Some(ref path) = self.persist_path {
            let json = serde_json::to_string_pretty(&*state)
                .context("Failed to serialize study document")?;
            std::fs::write(path, json)
                .with_context(|| format!("Failed to persist study document: {}", path.display()))?;
        }

        Ok(())
    }

    fn check_version(&self, version: u32) -> Option<Message> {
        (version != PROTOCOL_VERSION).then(|| {
            self.error(format!(
                "Protocol version mismatch: party={}, service={}",
                version, PROTOCOL_VERSION
            ))
        })
    }

    fn error(&self, error: String) -> Message {
        tracing::warn!("rejecting request: {}", error);
        Message::Error(ErrorMessage {
            node_id: self.node_id.clone(),
            error,
        })
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, StudyState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("study document lock poisoned"))
    }
}

/// Get node identifier (hostname)
fn get_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
