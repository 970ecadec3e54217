//! # Wire Format & Transport Framer
//!
//! Turns a raw byte stream into discrete, typed [`Message`]s and back.
//! Pure codec: no synchronization state, no disconnect authority. When a
//! frame is malformed the framer reports a [`FrameError`] and the connection
//! manager decides what to do about the connection.
//!
//! ## Frame Layout
//!
//! ```text
//! [magic: u32 LE][len: u32 LE][payload: len bytes]
//! ```
//!
//! The magic preamble lets peers reject foreign traffic without parsing
//! further. `len` is the bincode-encoded payload length and is checked
//! against [`config::MAX_FRAME_BYTES`] *before* any allocation — a malicious
//! peer cannot make us reserve gigabytes by lying in the prefix.
//!
//! Decoding is restartable per connection: [`read_frame`] yields one message
//! per call until the stream closes, at which point it yields `Ok(None)`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chain::{Block, ChainHead, Hash, ItemKind, Transaction};
use crate::config;

// ---------------------------------------------------------------------------
// Disconnect Reasons
// ---------------------------------------------------------------------------

/// Why a connection was (or is about to be) closed. Sent as the final frame
/// where possible; exit signaling at the connection boundary is a reason
/// code, never an application-level error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The peer sent a malformed or out-of-protocol message.
    BadProtocol,
    /// Handshake advertised an incompatible wire version.
    IncompatibleVersion,
    /// A connection to this node identity already exists.
    DuplicatePeer,
    /// Connection or per-IP cap exceeded.
    TooManyPeers,
    /// Evicted from the sync pool to make room for a better peer.
    PoolFull,
    /// The peer repeatedly missed request deadlines.
    Unresponsive,
    /// Local shutdown or operator request.
    Requested,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Every message that can cross a KESTREL connection.
///
/// Announce/request/response correlation is hash-based: `Inventory`
/// advertises availability, `GetData` pulls payloads, `Blocks` /
/// `Transactions` deliver them. `GetInventory` is the catch-up probe — a
/// node that is behind asks for the hashes of the next contiguous blocks it
/// lacks, because an announce-only protocol cannot express "everything
/// after height N".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First frame in both directions on a new connection.
    Handshake {
        /// Random per-process node identity; detects duplicate and
        /// self-connections.
        node_id: Hash,
        /// Wire protocol version; mismatch is grounds for rejection.
        protocol_version: u16,
        /// Port the peer's own listener accepts connections on (the
        /// connecting socket's port is ephemeral and useless for dial-back).
        listen_port: u16,
        /// The peer's best chain tip at connect time.
        chain_head: ChainHead,
    },
    /// Final frame before the sender closes the connection.
    Disconnect {
        /// Why the sender is leaving.
        reason: DisconnectReason,
    },
    /// "I have these items." Announce without payloads.
    Inventory {
        /// Category of every hash in the list.
        kind: ItemKind,
        /// Content hashes being advertised.
        hashes: Vec<Hash>,
    },
    /// "Send me these items' payloads."
    GetData {
        /// Category of every hash in the list.
        kind: ItemKind,
        /// Content hashes being requested.
        hashes: Vec<Hash>,
    },
    /// Catch-up probe: "what are the hashes of your main-chain blocks at
    /// heights [from_height, from_height + limit)?"
    GetInventory {
        /// First height the requester lacks.
        from_height: u64,
        /// Maximum number of hashes wanted.
        limit: u64,
    },
    /// Block payloads, in the order they were requested.
    Blocks(Vec<Block>),
    /// Transaction payloads, in the order they were requested.
    Transactions(Vec<Transaction>),
    /// Addresses of other nodes the sender knows about.
    PeerExchange {
        /// Listener addresses suitable for dialing.
        addresses: Vec<SocketAddr>,
    },
}

impl Message {
    /// Short tag for log lines.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Disconnect { .. } => "disconnect",
            Self::Inventory { .. } => "inventory",
            Self::GetData { .. } => "get_data",
            Self::GetInventory { .. } => "get_inventory",
            Self::Blocks(_) => "blocks",
            Self::Transactions(_) => "transactions",
            Self::PeerExchange { .. } => "peer_exchange",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Framing and decoding failures. All of them are grounds for the owning
/// connection to be scheduled for disconnect — by the connection manager,
/// never by the framer itself.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The preamble was not [`config::PROTOCOL_MAGIC`].
    #[error("bad frame magic: {0:#010x}")]
    BadMagic(u32),

    /// The length prefix exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    Oversize {
        /// Claimed payload length.
        len: u32,
        /// Configured ceiling.
        max: u32,
    },

    /// The payload did not decode to a known message.
    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),

    /// The underlying stream failed mid-frame.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Encode / Decode
// ---------------------------------------------------------------------------

/// Encodes a message into a complete frame (preamble + length + payload).
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(message)?;
    debug_assert!(payload.len() <= config::MAX_FRAME_BYTES as usize);

    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&config::PROTOCOL_MAGIC.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes one complete frame from a buffer. Returns the message and the
/// number of bytes consumed. Pure counterpart of [`read_frame`], used by
/// tests and anywhere frames arrive pre-buffered.
pub fn decode_frame(buf: &[u8]) -> Result<(Message, usize), FrameError> {
    if buf.len() < 8 {
        return Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "frame header truncated",
        )));
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != config::PROTOCOL_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if len > config::MAX_FRAME_BYTES {
        return Err(FrameError::Oversize {
            len,
            max: config::MAX_FRAME_BYTES,
        });
    }
    let end = 8 + len as usize;
    if buf.len() < end {
        return Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "frame payload truncated",
        )));
    }
    let message = bincode::deserialize(&buf[8..end])?;
    Ok((message, end))
}

/// Reads one frame from an async stream.
///
/// Returns `Ok(None)` when the stream closes cleanly at a frame boundary.
/// EOF in the middle of a frame is an error — the peer hung up mid-sentence.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, FrameError>
where
    R: AsyncRead + Unpin,
{
    // Filled byte by byte rather than with read_exact: only an EOF before
    // the first header byte is a clean close. An EOF after a partial
    // header is a mid-frame hangup and must surface as an error.
    let mut header = [0u8; 8];
    let mut filled = 0usize;
    while filled < header.len() {
        let n = reader
            .read(&mut header[filled..])
            .await
            .map_err(FrameError::Io)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "frame header truncated",
            )));
        }
        filled += n;
    }

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != config::PROTOCOL_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > config::MAX_FRAME_BYTES {
        return Err(FrameError::Oversize {
            len,
            max: config::MAX_FRAME_BYTES,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Some(bincode::deserialize(&payload)?))
}

/// Writes one complete frame to an async stream and flushes it.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
