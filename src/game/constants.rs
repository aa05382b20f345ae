/// Tick scheduling constants
pub mod tick {
    /// Simulation ticks per second
    pub const SERVER_TICK_SPEED: u32 = 50;
    /// Seconds of snapshot history kept per client
    pub const SNAPSHOT_HISTORY_SECONDS: i32 = 3;
    /// Wait used when no client is connected
    pub const IDLE_WAIT_MS: u64 = 1000;
}

/// Snapshot construction and delivery
pub mod snapshot {
    /// Maximum encoded size of one snapshot in bytes
    pub const MAX_SIZE: usize = 64 * 1024;
    /// Maximum number of items in one snapshot
    pub const MAX_ITEMS: usize = 1024;
    /// Number of distinct item types the delta schema tracks
    pub const MAX_ITEM_TYPES: usize = 64;
    /// Largest compressed payload carried by one SNAP message
    pub const MAX_PACK_SIZE: usize = 900;
    /// Capacity of the snapshot identifier pool
    pub const MAX_IDS: usize = 16 * 1024;
    /// Seconds a released identifier waits before reuse
    pub const ID_GRACE_SECONDS: u64 = 5;
    /// Recovering clients receive a snapshot every this many ticks
    pub const RECOVER_INTERVAL: i32 = 50;
    /// Newly entered clients receive a snapshot every this many ticks
    pub const INIT_INTERVAL: i32 = 10;
}

/// Client input buffering
pub mod input {
    /// Slots in the per-client input ring
    pub const RING_SIZE: usize = 200;
    /// Maximum 32-bit words in one input
    pub const MAX_INPUT_SIZE: usize = 128;
}

/// Network limits
pub mod net {
    /// Maximum datagram size accepted by the UDP transport
    pub const MAX_DATAGRAM_SIZE: usize = 1400;
    /// Seconds of silence after which the UDP transport times a client out
    pub const CONNECTION_TIMEOUT_SECS: u64 = 10;
    /// Traffic samples closer together than this are folded into the next one
    pub const TRAFFIC_SAMPLE_MIN_MICROS: u64 = 100;
    /// Ban length for clients exceeding the traffic limit
    pub const NETLIMIT_BAN_SECS: u64 = 600;
    /// Ban length for DNSBL-listed addresses
    pub const DNSBL_BAN_SECS: u64 = 600;
    /// Capability version announced to clients
    pub const CAPABILITIES_VERSION: i32 = 1;
    /// Capability flags announced to clients
    pub const CAPABILITIES_FLAGS: i32 = 0b11;
}

/// Map download
pub mod map {
    /// Bytes per map chunk
    pub const CHUNK_SIZE: usize = 1024 - 128;
    /// Default number of chunks sent ahead when fast download is on
    pub const DEFAULT_WINDOW: i32 = 15;
}

/// Remote console
pub mod rcon {
    /// Command descriptors sent to one client per iteration
    pub const MAX_CMD_SEND: usize = 16;
}

/// Sandbox simulation tuning, positions in 1/32 units
pub mod sandbox {
    /// Velocity gained per tick of held input
    pub const ACCEL: i32 = 48;
    /// Velocity kept per tick, in 1/256ths
    pub const DRAG_KEEP: i32 = 230;
    pub const MAX_VELOCITY: i32 = 640;
    /// Half-width of the square arena
    pub const ARENA_HALF: i32 = 32 * 1000;
}
