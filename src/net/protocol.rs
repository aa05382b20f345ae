//! Wire messages between clients and the server
//!
//! Every message is a serde enum encoded with bincode's legacy config
//! (fixed-size little-endian integers). Snapshot payloads travel inside
//! SNAP messages as opaque compressed bytes.

use serde::{Deserialize, Serialize};

/// Simulation tick number. `-1` marks "none" on the wire.
pub type Tick = i32;

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake: protocol version and server password
    Info { version: String, password: String },
    /// Request one chunk of the current map
    RequestMapData { chunk: i32 },
    /// Map loaded, ready to join
    Ready,
    /// Enter the running game
    EnterGame,
    /// Acknowledged snapshot tick plus input for a future tick
    Input {
        ack_tick: Tick,
        intended_tick: Tick,
        words: Vec<i32>,
    },
    /// Execute a console command with the client's access level
    RconCmd { command: String },
    /// Log in to the remote console
    RconAuth {
        name: String,
        password: String,
        send_commands: bool,
    },
    Ping,
    /// Game-layer message, forwarded to the simulation
    Game(Vec<u8>),
}

impl ClientMessage {
    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Info { .. } => "info",
            ClientMessage::RequestMapData { .. } => "request_map_data",
            ClientMessage::Ready => "ready",
            ClientMessage::EnterGame => "enter_game",
            ClientMessage::Input { .. } => "input",
            ClientMessage::RconCmd { .. } => "rcon_cmd",
            ClientMessage::RconAuth { .. } => "rcon_auth",
            ClientMessage::Ping => "ping",
            ClientMessage::Game(_) => "game",
        }
    }
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Capabilities { version: i32, flags: i32 },
    MapDetails {
        name: String,
        sha256: [u8; 32],
        crc: u32,
        size: u32,
    },
    MapChange { name: String, crc: u32, size: u32 },
    MapData {
        last: bool,
        crc: u32,
        chunk: i32,
        data: Vec<u8>,
    },
    ConnectionReady,
    /// Reply to an input: how long until the intended tick starts
    InputTiming { intended_tick: Tick, time_left_ms: i32 },
    /// One part of a snapshot too large for a single message
    Snap {
        tick: Tick,
        delta_tick: Tick,
        num_parts: u16,
        part: u16,
        crc: u32,
        data: Vec<u8>,
    },
    SnapSingle {
        tick: Tick,
        delta_tick: Tick,
        crc: u32,
        data: Vec<u8>,
    },
    /// Nothing changed relative to the baseline
    SnapEmpty { tick: Tick, delta_tick: Tick },
    RconType { username_required: bool },
    RconAuthStatus { authed: bool, cmdlist: bool },
    RconLine(String),
    RconCmdAdd {
        name: String,
        help: String,
        params: String,
    },
    RconCmdRem { name: String },
    PingReply,
}

impl ServerMessage {
    pub fn is_snapshot(&self) -> bool {
        matches!(
            self,
            ServerMessage::Snap { .. } | ServerMessage::SnapSingle { .. } | ServerMessage::SnapEmpty { .. }
        )
    }
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message using bincode
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);
