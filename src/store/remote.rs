//! Blocking client for the store service
//!
//! The phase sequencer is synchronous, so the client drives its own
//! current-thread tokio runtime and blocks on each request. Every request
//! opens a fresh connection; a store that is briefly unreachable only fails
//! the request in flight.

use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;

use super::protocol::*;
use super::CoordinationStore;
use crate::error::{Error, Result};
use crate::study::{StoreUpdate, StudyState};

/// Per-request connect and round-trip limit
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RemoteStore {
    addr: String,
    timeout: Duration,
    runtime: tokio::runtime::Runtime,
}

impl RemoteStore {
    /// Client for the service at `addr` (`host:port`)
    pub fn connect(addr: impl Into<String>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::io("Failed to create tokio runtime", e))?;

        Ok(Self {
            addr: addr.into(),
            timeout: REQUEST_TIMEOUT,
            runtime,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn request(&self, msg: Message) -> Result<Message> {
        let reply = self.runtime.block_on(async {
            let exchange = async {
                let mut stream = TcpStream::connect(&self.addr).await
                    .with_context(|| format!("Failed to connect to {}", self.addr))?;
                write_message(&mut stream, &msg).await?;
                read_message(&mut stream).await?
                    .ok_or_else(|| anyhow::anyhow!("{} closed the connection without replying", self.addr))
            };

            match tokio::time::timeout(self.timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("no reply from {} within {:?}", self.addr, self.timeout)),
            }
        });

        let reply = reply.map_err(Error::store)?;
        if let Message::Error(err) = reply {
            return Err(Error::store(format!("{} rejected request: {}", err.node_id, err.error)));
        }
        Ok(reply)
    }
}

impl CoordinationStore for RemoteStore {
    fn get_state(&self) -> Result<StudyState> {
        let reply = self.request(Message::GetState(GetStateMessage {
            protocol_version: PROTOCOL_VERSION,
        }))?;

        match reply {
            Message::State(msg) => Ok(msg.state),
            other => Err(Error::store(format!("expected STATE, got {:?}", other))),
        }
    }

    fn update(&self, update: &StoreUpdate) -> Result<()> {
        let reply = self.request(Message::Update(UpdateMessage {
            protocol_version: PROTOCOL_VERSION,
            update: update.clone(),
        }))?;

        match reply {
            Message::Ack => Ok(()),
            other => Err(Error::store(format!("expected ACK, got {:?}", other))),
        }
    }
}
