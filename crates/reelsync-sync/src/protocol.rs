//! # Peer Wire Protocol
//!
//! Message types and framing for device-to-device TCP connections.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Peer Protocol Messages                             │
//! │                                                                         │
//! │  HANDSHAKE (both sides, immediately after connect/accept)              │
//! │  ─────────                                                             │
//! │  Both      ───► HELLO { deviceId, deviceName, port, timestamp }        │
//! │  (never sent in reply to a HELLO)                                      │
//! │                                                                         │
//! │  PUSH NOTIFICATION                                                     │
//! │  ─────────────────                                                     │
//! │  Editor    ───► CHANGE_NOTIFY { projectId, deviceId, timestamp }       │
//! │  (receiver reads the change logs itself; no item payload)              │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  ─────────                                                             │
//! │  Both      ◄──► PING { timestamp }                                     │
//! │  Both      ◄──► PONG { pingTimestamp, timestamp }                      │
//! │                                                                         │
//! │  DISCONNECT                                                            │
//! │  ──────────                                                            │
//! │  Either    ───► GOODBYE { deviceId, timestamp }                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────────┐
//! │ length: u32 BE       │ UTF-8 JSON: {"type": <u32>, "payload": {…}}  │
//! └──────────────────────┴──────────────────────────────────────────────┘
//! ```
//! A length above the frame limit closes the connection. A length of zero
//! is a malformed frame; too many of them in a row close the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

// =============================================================================
// Message Types
// =============================================================================

/// Numeric message type carried in the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Hello = 1,
    ChangeNotify = 2,
    Ping = 3,
    Pong = 4,
    Goodbye = 5,
}

impl TryFrom<u32> for MessageType {
    type Error = SyncError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Hello),
            2 => Ok(MessageType::ChangeNotify),
            3 => Ok(MessageType::Ping),
            4 => Ok(MessageType::Pong),
            5 => Ok(MessageType::Goodbye),
            other => Err(SyncError::UnknownMessageType(other)),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Handshake sent by both sides as soon as a socket is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub device_id: String,
    pub device_name: String,
    /// The sender's listening port (not the ephemeral source port).
    pub port: u16,
    pub timestamp: i64,
}

/// A project changed on the sender; the item itself travels via change logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    pub project_id: String,
    pub device_id: String,
    /// Timestamp of the change-log entry that triggered the notice.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    /// Echo of the PING's timestamp.
    pub ping_timestamp: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoodbyePayload {
    pub device_id: String,
    pub timestamp: i64,
}

// =============================================================================
// Message Enum
// =============================================================================

/// All peer protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Hello(HelloPayload),
    ChangeNotify(ChangeNotice),
    Ping(PingPayload),
    Pong(PongPayload),
    Goodbye(GoodbyePayload),
}

/// `{ "type": <u32>, "payload": { ... } }`
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: u32,
    payload: serde_json::Value,
}

impl PeerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            PeerMessage::Hello(_) => MessageType::Hello,
            PeerMessage::ChangeNotify(_) => MessageType::ChangeNotify,
            PeerMessage::Ping(_) => MessageType::Ping,
            PeerMessage::Pong(_) => MessageType::Pong,
            PeerMessage::Goodbye(_) => MessageType::Goodbye,
        }
    }

    /// Returns the message type name (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerMessage::Hello(_) => "HELLO",
            PeerMessage::ChangeNotify(_) => "CHANGE_NOTIFY",
            PeerMessage::Ping(_) => "PING",
            PeerMessage::Pong(_) => "PONG",
            PeerMessage::Goodbye(_) => "GOODBYE",
        }
    }

    pub fn hello(device_id: &str, device_name: &str, port: u16, timestamp: i64) -> Self {
        PeerMessage::Hello(HelloPayload {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            port,
            timestamp,
        })
    }

    pub fn change_notify(project_id: &str, device_id: &str, timestamp: i64) -> Self {
        PeerMessage::ChangeNotify(ChangeNotice {
            project_id: project_id.to_string(),
            device_id: device_id.to_string(),
            timestamp,
        })
    }

    pub fn ping(timestamp: i64) -> Self {
        PeerMessage::Ping(PingPayload { timestamp })
    }

    /// Creates the PONG answering a PING stamped `ping_timestamp`.
    pub fn pong(ping_timestamp: i64, timestamp: i64) -> Self {
        PeerMessage::Pong(PongPayload {
            ping_timestamp,
            timestamp,
        })
    }

    pub fn goodbye(device_id: &str, timestamp: i64) -> Self {
        PeerMessage::Goodbye(GoodbyePayload {
            device_id: device_id.to_string(),
            timestamp,
        })
    }

    /// Serializes the JSON envelope (no length prefix).
    pub fn to_json(&self) -> SyncResult<Vec<u8>> {
        let payload = match self {
            PeerMessage::Hello(p) => serde_json::to_value(p),
            PeerMessage::ChangeNotify(p) => serde_json::to_value(p),
            PeerMessage::Ping(p) => serde_json::to_value(p),
            PeerMessage::Pong(p) => serde_json::to_value(p),
            PeerMessage::Goodbye(p) => serde_json::to_value(p),
        }
        .map_err(|e| SyncError::SerializationFailed(e.to_string()))?;

        serde_json::to_vec(&Envelope {
            kind: self.message_type() as u32,
            payload,
        })
        .map_err(|e| SyncError::SerializationFailed(e.to_string()))
    }

    /// Parses a JSON envelope (one frame body).
    pub fn from_json(body: &[u8]) -> SyncResult<Self> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        let payload = envelope.payload;

        let message = match MessageType::try_from(envelope.kind)? {
            MessageType::Hello => PeerMessage::Hello(serde_json::from_value(payload)?),
            MessageType::ChangeNotify => PeerMessage::ChangeNotify(serde_json::from_value(payload)?),
            MessageType::Ping => PeerMessage::Ping(serde_json::from_value(payload)?),
            MessageType::Pong => PeerMessage::Pong(serde_json::from_value(payload)?),
            MessageType::Goodbye => PeerMessage::Goodbye(serde_json::from_value(payload)?),
        };
        Ok(message)
    }

    /// Serializes the message as a complete length-prefixed frame.
    pub fn encode(&self) -> SyncResult<Bytes> {
        Ok(encode_frame(&self.to_json()?))
    }
}

/// Prefixes `body` with its big-endian `u32` length.
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(body);
    frame.freeze()
}

// =============================================================================
// Frame Decoder
// =============================================================================

/// Reassembles frames from a byte stream delivered in arbitrary chunks.
///
/// ## Decoding Loop
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  socket read ──► buffer.extend(chunk)                                   │
/// │                      │                                                  │
/// │                      ▼                                                  │
/// │  < 4 bytes buffered? ──────────────────────────► wait for more          │
/// │                      │                                                  │
/// │  len == 0?      ──► consume prefix, zero_run += 1                       │
/// │                      (zero_run ≥ limit → TooManyEmptyFrames)            │
/// │  len > limit?   ──► FrameTooLarge                                       │
/// │  body incomplete? ─────────────────────────────► wait for more          │
/// │                      │                                                  │
/// │                      ▼                                                  │
/// │  split body off, zero_run = 0, yield                                    │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_bytes: usize,
    max_zero_length_frames: u32,
    zero_run: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize, max_zero_length_frames: u32) -> Self {
        FrameDecoder {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_bytes,
            max_zero_length_frames,
            zero_run: 0,
        }
    }

    /// The receive buffer, for reading directly from a socket.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Appends received bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Current run of consecutive zero-length frames.
    pub fn zero_run(&self) -> u32 {
        self.zero_run
    }

    /// Returns the next complete frame body, `None` if more bytes are needed.
    ///
    /// An error means the stream is corrupt and the connection must close.
    pub fn next_frame(&mut self) -> SyncResult<Option<Bytes>> {
        loop {
            if self.buffer.len() < LENGTH_PREFIX_BYTES {
                return Ok(None);
            }

            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;

            if len == 0 {
                self.buffer.advance(LENGTH_PREFIX_BYTES);
                self.zero_run += 1;
                if self.zero_run >= self.max_zero_length_frames {
                    return Err(SyncError::TooManyEmptyFrames(self.zero_run));
                }
                continue;
            }

            if len > self.max_frame_bytes {
                return Err(SyncError::FrameTooLarge {
                    len,
                    max: self.max_frame_bytes,
                });
            }

            if self.buffer.len() < LENGTH_PREFIX_BYTES + len {
                self.buffer.reserve(LENGTH_PREFIX_BYTES + len - self.buffer.len());
                return Ok(None);
            }

            self.buffer.advance(LENGTH_PREFIX_BYTES);
            let body = self.buffer.split_to(len).freeze();
            self.zero_run = 0;
            return Ok(Some(body));
        }
    }

    /// Returns the next complete message.
    pub fn next_message(&mut self) -> SyncResult<Option<PeerMessage>> {
        match self.next_frame()? {
            Some(body) => PeerMessage::from_json(&body).map(Some),
            None => Ok(None),
        }
    }
}
