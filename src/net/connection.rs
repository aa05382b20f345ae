use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use crate::game::input_buffer::InputRing;
use crate::net::dos_protection::TrafficMeter;
use crate::net::protocol::Tick;
use crate::server::auth::{AuthLevel, KeyId};
use crate::server::dnsbl::{DnsblLookup, DnsblState};
use crate::snapshot::storage::SnapshotStorage;

/// Lifecycle of a client slot. Ordering follows the handshake so checks like
/// "at least Ready" are plain comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    Empty,
    /// Connected, waiting for INFO
    Auth,
    /// Handshake accepted, downloading the map
    Connecting,
    /// Map loaded, waiting to enter the game
    Ready,
    InGame,
    /// Server-side placeholder without a connection
    Dummy,
}

impl ClientState {
    pub fn name(&self) -> &'static str {
        match self {
            ClientState::Empty => "empty",
            ClientState::Auth => "auth",
            ClientState::Connecting => "connecting",
            ClientState::Ready => "ready",
            ClientState::InGame => "ingame",
            ClientState::Dummy => "dummy",
        }
    }
}

/// Snapshot delivery rate for one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapRate {
    /// Just entered, has not acknowledged anything yet
    Init,
    /// Acknowledging normally
    Full,
    /// Lost its baseline, resyncing from the empty snapshot
    Recovering,
}

/// Everything the server keeps per client slot
#[derive(Debug)]
pub struct ClientSlot {
    pub state: ClientState,
    pub addr: Option<SocketAddr>,

    pub name: String,
    pub clan: String,
    pub country: i32,
    pub score: i32,
    pub flags: i32,
    pub latency_ms: i32,

    pub snap_rate: SnapRate,
    pub last_acked_snapshot: Tick,
    pub last_input_tick: Tick,
    pub snapshots: SnapshotStorage,
    pub inputs: InputRing,
    pub traffic: TrafficMeter,
    pub next_map_chunk: i32,

    pub auth_level: AuthLevel,
    pub auth_key: Option<KeyId>,
    pub auth_tries: u32,
    /// Indices into the command table still to announce over RCON
    pub pending_rcon_commands: VecDeque<usize>,
    pub show_ips: bool,

    pub dnsbl: DnsblState,
    pub dnsbl_lookup: Option<DnsblLookup>,
}

impl ClientSlot {
    pub fn new(now: Instant) -> Self {
        Self {
            state: ClientState::Empty,
            addr: None,
            name: String::new(),
            clan: String::new(),
            country: -1,
            score: 0,
            flags: 0,
            latency_ms: 0,
            snap_rate: SnapRate::Init,
            last_acked_snapshot: -1,
            last_input_tick: -1,
            snapshots: SnapshotStorage::new(),
            inputs: InputRing::new(),
            traffic: TrafficMeter::new(now),
            next_map_chunk: 0,
            auth_level: AuthLevel::None,
            auth_key: None,
            auth_tries: 0,
            pending_rcon_commands: VecDeque::new(),
            show_ips: false,
            dnsbl: DnsblState::None,
            dnsbl_lookup: None,
        }
    }

    /// Reset per-session buffers: inputs, snapshot history and ack state.
    /// Runs on connect, rejoin and map change.
    pub fn reset_session(&mut self) {
        self.inputs.reset();
        self.snapshots.purge_all();
        self.last_acked_snapshot = -1;
        self.last_input_tick = -1;
        self.snap_rate = SnapRate::Init;
        self.score = 0;
        self.next_map_chunk = 0;
        self.flags = 0;
    }

    /// Forget authentication state
    pub fn clear_auth(&mut self) {
        self.auth_level = AuthLevel::None;
        self.auth_key = None;
        self.auth_tries = 0;
        self.pending_rcon_commands.clear();
    }

    /// Prepare the slot for a fresh connection from `addr`
    pub fn occupy(&mut self, state: ClientState, addr: Option<SocketAddr>, now: Instant) {
        self.state = state;
        self.addr = addr;
        self.name.clear();
        self.clan.clear();
        self.country = -1;
        self.latency_ms = 0;
        self.traffic.reset(now);
        self.clear_auth();
        self.show_ips = false;
        self.dnsbl = DnsblState::None;
        self.dnsbl_lookup = None;
        self.reset_session();
    }

    /// Return the slot to `Empty`
    pub fn vacate(&mut self, now: Instant) {
        self.occupy(ClientState::Empty, None, now);
    }

    pub fn is_empty(&self) -> bool {
        self.state == ClientState::Empty
    }

    pub fn is_authed(&self) -> bool {
        self.auth_level > AuthLevel::None
    }
}
