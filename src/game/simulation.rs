//! Interface between the tick engine and the game simulation
//!
//! The engine owns time, connections and snapshot delivery. The simulation
//! owns game state: it advances one tick at a time, reacts to client
//! lifecycle events and fills a snapshot for each recipient on request.

use std::time::Instant;

use crate::net::delta::ItemSchema;
use crate::net::protocol::Tick;
use crate::net::transport::ClientId;
use crate::server::auth::AuthLevel;
use crate::snapshot::id_pool::{IdPoolError, SnapId, SnapIdPool};
use crate::snapshot::{Snapshot, SnapshotBuilder};

/// Who a snapshot is being built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapTarget {
    Client(ClientId),
    /// Server-wide demo recording, not tied to a viewer
    Demo,
}

/// Engine state the simulation may touch during a callback
#[derive(Debug)]
pub struct SimResources {
    pub ids: SnapIdPool,
    pub schema: ItemSchema,
    pub shutdown_request: Option<String>,
    /// Set when the id pool ran dry; stops the server
    pub id_fault: Option<IdPoolError>,
}

impl SimResources {
    pub fn new() -> Self {
        Self {
            ids: SnapIdPool::new(),
            schema: ItemSchema::new(),
            shutdown_request: None,
            id_fault: None,
        }
    }
}

impl Default for SimResources {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle passed to simulation callbacks
pub struct SimContext<'a> {
    res: &'a mut SimResources,
    tick: Tick,
    tick_speed: u32,
    now: Instant,
}

impl<'a> SimContext<'a> {
    pub fn new(res: &'a mut SimResources, tick: Tick, tick_speed: u32, now: Instant) -> Self {
        Self {
            res,
            tick,
            tick_speed,
            now,
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn tick_speed(&self) -> u32 {
        self.tick_speed
    }

    /// Allocate a snapshot identifier for a new object. Exhaustion is
    /// recorded and stops the server after the current tick.
    pub fn new_id(&mut self) -> Result<SnapId, IdPoolError> {
        let result = self.res.ids.allocate_at(self.now);
        if let Err(e @ IdPoolError::Exhausted { .. }) = result {
            self.res.id_fault.get_or_insert(e);
        }
        result
    }

    /// Release an identifier. It is held back from reuse for a grace period.
    pub fn free_id(&mut self, id: SnapId) -> Result<(), IdPoolError> {
        self.res.ids.release_at(id, self.now)
    }

    /// Declare the fixed word count of an item type
    pub fn set_static_size(&mut self, type_id: u16, words: u16) {
        self.res.schema.set_static_size(type_id, words);
    }

    /// Stop the server after the current iteration. Clients are dropped
    /// with `reason`.
    pub fn request_shutdown(&mut self, reason: impl Into<String>) {
        self.res.shutdown_request.get_or_insert_with(|| reason.into());
    }
}

pub trait Simulation {
    /// Protocol version clients must present in INFO
    fn net_version(&self) -> &str;

    /// A map was loaded and the tick counter restarted
    fn on_init(&mut self, ctx: &mut SimContext<'_>);

    /// The current map is being unloaded or the server is stopping.
    /// Every identifier still held must be released here.
    fn on_shutdown(&mut self, _ctx: &mut SimContext<'_>) {}

    fn on_tick(&mut self, ctx: &mut SimContext<'_>);

    fn on_pre_snap(&mut self) {}

    fn on_snap(&mut self, target: SnapTarget, builder: &mut SnapshotBuilder);

    fn on_post_snap(&mut self) {}

    /// Strip viewer-specific data before a snapshot goes into a demo
    fn sanitize_demo_snapshot(&self, _snapshot: &mut Snapshot) {}

    /// The client finished loading the map
    fn on_client_connected(&mut self, _client: ClientId, _ctx: &mut SimContext<'_>) {}

    /// Gate for entering the game
    fn is_client_ready(&self, _client: ClientId) -> bool {
        true
    }

    fn on_client_enter(&mut self, _client: ClientId, _ctx: &mut SimContext<'_>) {}

    /// The client left after reaching Ready
    fn on_client_drop(&mut self, _client: ClientId, _reason: &str, _ctx: &mut SimContext<'_>) {}

    /// Input as soon as it arrives, ahead of its tick
    fn on_client_direct_input(&mut self, _client: ClientId, _input: &[i32]) {}

    /// Input at the tick it was intended for
    fn on_client_predicted_input(&mut self, _client: ClientId, _input: &[i32]) {}

    /// Game-layer message from a client
    fn on_message(&mut self, _client: ClientId, _payload: &[u8]) {}

    fn on_set_authed(&mut self, _client: ClientId, _level: AuthLevel) {}
}
