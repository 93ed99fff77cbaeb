//! Coordination store protocol
//!
//! Messages exchanged between a party (client) and the store service. The
//! protocol uses MessagePack (rmp-serde) for compact binary serialization.
//!
//! # Message Flow
//!
//! ```text
//! Party                          Store Service
//!   |                                  |
//!   |-------- GET_STATE -------------->|
//!   |<------- STATE(document) ---------|
//!   |                                  |
//!   |-------- UPDATE(field) ---------->|
//!   |<------- ACK | ERROR -------------|
//! ```
//!
//! # Message Framing
//!
//! Each message is prefixed with a 4-byte length field (little-endian u32):
//!
//! ```text
//! [4 bytes: message length][N bytes: MessagePack-serialized message]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::study::{StoreUpdate, StudyState};

/// Protocol version
///
/// Increment this when making breaking changes to the protocol.
/// Parties and the service must have matching protocol versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame accepted from the wire (study documents are small)
const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Snapshot request (Party → Service)
    GetState(GetStateMessage),

    /// Snapshot reply (Service → Party)
    State(StateMessage),

    /// Field assignment (Party → Service)
    Update(UpdateMessage),

    /// Update applied (Service → Party)
    Ack,

    /// Request rejected (Service → Party)
    Error(ErrorMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStateMessage {
    /// Protocol version (must match)
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    pub state: StudyState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMessage {
    /// Protocol version (must match)
    pub protocol_version: u32,
    pub update: StoreUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Service node identifier
    pub node_id: String,
    /// Error description
    pub error: String,
}

/// Serialize a message to bytes
///
/// Prepends a 4-byte length field for framing.
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let msg_bytes = rmp_serde::to_vec(msg)
        .context("Failed to serialize message")?;

    let msg_len = msg_bytes.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Read a complete message from a stream
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before a
/// new frame started.
pub async fn read_message<R>(stream: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read message length"),
    }

    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_BYTES {
        anyhow::bail!("Message too large: {} bytes (max {})", msg_len, MAX_MESSAGE_BYTES);
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await
        .context("Failed to read message body")?;

    let msg = rmp_serde::from_slice(&msg_buf)
        .context("Failed to deserialize message")?;

    Ok(Some(msg))
}

/// Write a message to a stream
pub async fn write_message<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = serialize_message(msg)?;

    stream.write_all(&framed).await
        .context("Failed to write message")?;

    // Flush to ensure message is sent immediately
    stream.flush().await
        .context("Failed to flush stream")?;

    Ok(())
}
