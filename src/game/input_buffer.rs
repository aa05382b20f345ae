//! Per-client input ring
//!
//! Inputs arrive ahead of the tick they are meant for. Each is stored with
//! its intended tick in a fixed ring indexed by arrival order; the tick loop
//! looks up the input whose intended tick equals the tick being simulated.

use smallvec::SmallVec;

use crate::game::constants::input::{MAX_INPUT_SIZE, RING_SIZE};
use crate::net::protocol::Tick;

/// Input words, inline for the common small case
pub type InputWords = SmallVec<[i32; 16]>;

#[derive(Debug, Clone, Default)]
pub struct ClientInput {
    /// Tick this input applies to, `-1` when the slot is unused
    pub game_tick: Tick,
    pub words: InputWords,
}

#[derive(Debug)]
pub struct InputRing {
    slots: Vec<ClientInput>,
    current: usize,
    latest: ClientInput,
}

impl InputRing {
    pub fn new() -> Self {
        let mut ring = Self {
            slots: vec![ClientInput::default(); RING_SIZE],
            current: 0,
            latest: ClientInput::default(),
        };
        ring.reset();
        ring
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.game_tick = -1;
            slot.words.clear();
        }
        self.current = 0;
        self.latest = ClientInput {
            game_tick: -1,
            words: InputWords::new(),
        };
    }

    /// Store an input for `game_tick`. Words beyond the input size cap are
    /// dropped; callers reject oversized inputs before getting here.
    pub fn push(&mut self, game_tick: Tick, words: &[i32]) {
        let words = &words[..words.len().min(MAX_INPUT_SIZE)];
        let slot = &mut self.slots[self.current];
        slot.game_tick = game_tick;
        slot.words.clear();
        slot.words.extend_from_slice(words);
        self.latest = slot.clone();
        self.current = (self.current + 1) % RING_SIZE;
    }

    /// The buffered input intended for `tick`, newest first if the client
    /// sent several
    pub fn for_tick(&self, tick: Tick) -> Option<&ClientInput> {
        (1..=RING_SIZE)
            .map(|back| &self.slots[(self.current + RING_SIZE - back) % RING_SIZE])
            .find(|slot| slot.game_tick == tick)
    }

    /// Most recently received input
    pub fn latest(&self) -> &ClientInput {
        &self.latest
    }
}

impl Default for InputRing {
    fn default() -> Self {
        Self::new()
    }
}
