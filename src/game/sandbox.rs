//! Minimal simulation for the bundled binary
//!
//! Every in-game client controls one character that accelerates in the
//! direction of its input and slows down under drag. Characters are the only
//! identifier-backed objects; a single game-info item carries the tick and
//! player count. Each client's own snapshot also names the character it
//! controls, which demos leave out.

use rustc_hash::FxHashMap;
use tracing::{debug, error};

use crate::game::constants::sandbox::{ACCEL, ARENA_HALF, DRAG_KEEP, MAX_VELOCITY};
use crate::game::simulation::{SimContext, SnapTarget, Simulation};
use crate::net::transport::ClientId;
use crate::snapshot::id_pool::SnapId;
use crate::snapshot::{Snapshot, SnapshotBuilder};

pub const NET_VERSION: &str = "0.6 snapwire";

/// Item type of a character: `[owner, x, y, vx, vy]`
pub const ITEM_CHARACTER: u16 = 1;
/// Item type of the game info: `[tick, players]`
pub const ITEM_GAME_INFO: u16 = 2;
/// Item type naming the viewer's own character: `[snap id]`
pub const ITEM_LOCAL_VIEW: u16 = 3;

const CHARACTER_WORDS: u16 = 5;
const GAME_INFO_WORDS: u16 = 2;
const LOCAL_VIEW_WORDS: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Character {
    pub snap_id: SnapId,
    pub pos: (i32, i32),
    pub vel: (i32, i32),
    /// Held direction, each axis in -1..=1
    pub dir: (i32, i32),
}

impl Character {
    fn step(&mut self) {
        self.vel.0 = step_axis(self.vel.0, self.dir.0);
        self.vel.1 = step_axis(self.vel.1, self.dir.1);
        self.pos.0 = (self.pos.0 + self.vel.0).clamp(-ARENA_HALF, ARENA_HALF);
        self.pos.1 = (self.pos.1 + self.vel.1).clamp(-ARENA_HALF, ARENA_HALF);
    }
}

fn step_axis(vel: i32, dir: i32) -> i32 {
    let vel = vel * DRAG_KEEP / 256 + dir * ACCEL;
    vel.clamp(-MAX_VELOCITY, MAX_VELOCITY)
}

#[derive(Debug, Default)]
pub struct SandboxSimulation {
    characters: FxHashMap<ClientId, Character>,
    tick: i32,
}

impl SandboxSimulation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn character(&self, client: ClientId) -> Option<&Character> {
        self.characters.get(&client)
    }

    pub fn player_count(&self) -> usize {
        self.characters.len()
    }

    fn apply_input(&mut self, client: ClientId, input: &[i32]) {
        if let Some(character) = self.characters.get_mut(&client) {
            let axis = |idx: usize| input.get(idx).copied().unwrap_or(0).signum();
            character.dir = (axis(0), axis(1));
        }
    }
}

impl Simulation for SandboxSimulation {
    fn net_version(&self) -> &str {
        NET_VERSION
    }

    fn on_init(&mut self, ctx: &mut SimContext<'_>) {
        self.characters.clear();
        self.tick = ctx.tick();
        ctx.set_static_size(ITEM_CHARACTER, CHARACTER_WORDS);
        ctx.set_static_size(ITEM_GAME_INFO, GAME_INFO_WORDS);
        ctx.set_static_size(ITEM_LOCAL_VIEW, LOCAL_VIEW_WORDS);
    }

    fn on_shutdown(&mut self, ctx: &mut SimContext<'_>) {
        for (client, character) in self.characters.drain() {
            if let Err(e) = ctx.free_id(character.snap_id) {
                error!("failed to free snapshot id of cid={}: {}", client, e);
            }
        }
    }

    fn on_tick(&mut self, ctx: &mut SimContext<'_>) {
        self.tick = ctx.tick();
        for character in self.characters.values_mut() {
            character.step();
        }
    }

    fn on_snap(&mut self, target: SnapTarget, builder: &mut SnapshotBuilder) {
        let info = [self.tick, self.characters.len() as i32];
        if let Err(e) = builder.add_item(ITEM_GAME_INFO, 0, &info) {
            error!("failed to snap game info: {}", e);
            return;
        }
        if let SnapTarget::Client(viewer) = target {
            if let Some(own) = self.characters.get(&viewer) {
                if let Err(e) = builder.add_item(ITEM_LOCAL_VIEW, 0, &[own.snap_id as i32]) {
                    error!("failed to snap local view of cid={}: {}", viewer, e);
                }
            }
        }

        let mut clients: Vec<_> = self.characters.iter().collect();
        clients.sort_by_key(|(client, _)| **client);
        for (&client, c) in clients {
            let data = [client as i32, c.pos.0, c.pos.1, c.vel.0, c.vel.1];
            if let Err(e) = builder.add_item(ITEM_CHARACTER, c.snap_id, &data) {
                error!("failed to snap character of cid={}: {}", client, e);
                break;
            }
        }
    }

    fn sanitize_demo_snapshot(&self, snapshot: &mut Snapshot) {
        snapshot.retain(|item| item.type_id != ITEM_LOCAL_VIEW);
    }

    fn on_client_enter(&mut self, client: ClientId, ctx: &mut SimContext<'_>) {
        let snap_id = match ctx.new_id() {
            Ok(id) => id,
            Err(e) => {
                error!("no snapshot id for cid={}: {}", client, e);
                return;
            }
        };
        self.characters.insert(
            client,
            Character {
                snap_id,
                pos: (0, 0),
                vel: (0, 0),
                dir: (0, 0),
            },
        );
    }

    fn on_client_drop(&mut self, client: ClientId, _reason: &str, ctx: &mut SimContext<'_>) {
        if let Some(character) = self.characters.remove(&client) {
            if let Err(e) = ctx.free_id(character.snap_id) {
                error!("failed to free snapshot id of cid={}: {}", client, e);
            }
        }
    }

    fn on_client_predicted_input(&mut self, client: ClientId, input: &[i32]) {
        self.apply_input(client, input);
    }

    fn on_message(&mut self, client: ClientId, payload: &[u8]) {
        debug!("ignoring {} byte game message from cid={}", payload.len(), client);
    }
}
