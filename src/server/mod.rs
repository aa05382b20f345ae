//! Authoritative tick engine
//!
//! One thread drives everything: it pumps the transport, advances the
//! simulation at a fixed tick rate, and sends each in-game client a delta
//! snapshot against the last snapshot that client acknowledged.
//!
//! Each loop iteration:
//! 1. drain transport events (connects, packets, disconnects)
//! 2. swap maps if the configured map changed or a reload was requested
//! 3. advance DNSBL lookups
//! 4. run every tick whose start time has passed, delivering buffered input
//! 5. snapshot (every tick or every second tick) and send pending rcon data
//! 6. wait for the next tick, or longer when nobody is connected

pub mod auth;
pub mod console;
pub mod demo;
pub mod dnsbl;
pub mod name_ban;

#[cfg(test)]
mod tests;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::{ReloadWhenEmpty, ServerConfig};
use crate::game::constants::input::MAX_INPUT_SIZE;
use crate::game::constants::net::{CAPABILITIES_FLAGS, CAPABILITIES_VERSION, DNSBL_BAN_SECS, NETLIMIT_BAN_SECS};
use crate::game::constants::rcon::MAX_CMD_SEND;
use crate::game::constants::snapshot::{INIT_INTERVAL, RECOVER_INTERVAL};
use crate::game::constants::tick::{IDLE_WAIT_MS, SNAPSHOT_HISTORY_SECONDS};
use crate::game::simulation::{SimContext, SimResources, SnapTarget, Simulation};
use crate::metrics::Metrics;
use crate::net::connection::{ClientSlot, ClientState, SnapRate};
use crate::net::delta::create_delta;
use crate::net::framing::{frame_snapshot, SnapHeader};
use crate::net::map_transfer::{MapData, MapError, MapSource};
use crate::net::protocol::{self, ClientMessage, ServerMessage, Tick};
use crate::net::transport::{ClientId, SendFlags, Transport, TransportEvent};
use crate::net::varint;
use crate::net::dos_protection::BanList;
use crate::snapshot::id_pool::{IdPoolError, SnapIdPool};
use crate::snapshot::{Snapshot, SnapshotBuilder};

use self::auth::{AuthLevel, AuthManager, KeyId};
use self::demo::{DemoError, DemoRecorder, DemoStore};
use self::dnsbl::{DnsblResolver, DnsblState};
use self::name_ban::{sanitize_name, NameBanList};

/// Errors that stop the server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to load map: {0}")]
    Map(#[from] MapError),
    #[error("snapshot id pool: {0}")]
    IdPool(#[from] IdPoolError),
    #[error("simulation requested shutdown: {0}")]
    SimulationFault(String),
    #[error("server not started")]
    NotStarted,
}

/// Why a kick was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KickError {
    #[error("invalid client id to kick")]
    InvalidClient,
    #[error("you can't kick yourself")]
    SelfKick,
    #[error("kick command denied")]
    Denied,
}

/// Outcome of one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iteration {
    pub new_ticks: u32,
    /// At least one slot is occupied
    pub active: bool,
}

pub struct Server<S: Simulation, T: Transport> {
    config: ServerConfig,
    sim: S,
    transport: T,
    clients: Vec<ClientSlot>,
    res: SimResources,

    maps: Box<dyn MapSource>,
    map: Option<MapData>,
    map_reload: bool,
    reloaded_when_empty: bool,

    tick: Tick,
    game_start: Instant,
    running: Arc<AtomicBool>,
    shutdown_reason: Option<String>,

    bans: BanList,
    auth: AuthManager,
    name_bans: NameBanList,
    /// Client whose rcon command is executing, `None` for the server console
    rcon_client: Option<ClientId>,
    rcon_level: AuthLevel,

    dnsbl: Option<Box<dyn DnsblResolver>>,
    demo_store: Option<Box<dyn DemoStore>>,
    server_demo: DemoRecorder,
    client_demos: Vec<DemoRecorder>,
    metrics: Arc<Metrics>,
}

impl<S: Simulation, T: Transport> Server<S, T> {
    pub fn new(config: ServerConfig, sim: S, transport: T, maps: Box<dyn MapSource>) -> Self {
        let now = Instant::now();
        let auth = AuthManager::with_default_passwords(
            &config.rcon_password,
            &config.rcon_mod_password,
            &config.rcon_helper_password,
        );
        let clients = (0..config.max_clients).map(|_| ClientSlot::new(now)).collect();
        let client_demos = (0..config.max_clients).map(|_| DemoRecorder::new()).collect();
        Self {
            config,
            sim,
            transport,
            clients,
            res: SimResources::new(),
            maps,
            map: None,
            map_reload: false,
            reloaded_when_empty: false,
            tick: 0,
            game_start: now,
            running: Arc::new(AtomicBool::new(true)),
            shutdown_reason: None,
            bans: BanList::new(),
            auth,
            name_bans: NameBanList::new(),
            rcon_client: None,
            rcon_level: AuthLevel::Admin,
            dnsbl: None,
            demo_store: None,
            server_demo: DemoRecorder::new(),
            client_demos,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_dnsbl(mut self, resolver: Box<dyn DnsblResolver>) -> Self {
        self.dnsbl = Some(resolver);
        self
    }

    /// Replace the snapshot identifier pool
    pub fn with_snap_ids(mut self, ids: SnapIdPool) -> Self {
        self.res.ids = ids;
        self
    }

    pub fn with_demo_store(mut self, store: Box<dyn DemoStore>) -> Self {
        self.demo_store = Some(store);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn client(&self, client: ClientId) -> Option<&ClientSlot> {
        self.clients.get(client)
    }

    pub fn client_state(&self, client: ClientId) -> ClientState {
        self.clients.get(client).map_or(ClientState::Empty, |slot| slot.state)
    }

    pub fn map(&self) -> Option<&MapData> {
        self.map.as_ref()
    }

    pub fn simulation(&self) -> &S {
        &self.sim
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    pub fn auth_mut(&mut self) -> &mut AuthManager {
        &mut self.auth
    }

    pub fn bans(&self) -> &BanList {
        &self.bans
    }

    pub fn snap_ids(&self) -> &SnapIdPool {
        &self.res.ids
    }

    /// Flag that keeps the main loop alive; clear it to stop the server
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Stop the server and drop every client with `reason`
    pub fn shutdown_with_reason(&mut self, reason: impl Into<String>) {
        self.shutdown_reason = Some(reason.into());
        self.shutdown();
    }

    /// Change the configured map; the swap happens on the next iteration
    pub fn set_map(&mut self, name: &str) {
        self.config.map = name.to_string();
    }

    pub fn request_map_reload(&mut self) {
        self.map_reload = true;
    }

    /// Wall-clock start of `tick`
    pub fn tick_start_time(&self, tick: Tick) -> Instant {
        let nanos = tick.max(0) as u64 * 1_000_000_000 / self.config.tick_speed as u64;
        self.game_start + Duration::from_nanos(nanos)
    }

    /// Signed milliseconds from `now` until `tick` starts
    fn ms_until_tick(&self, tick: Tick, now: Instant) -> i32 {
        let target_ns = tick as i128 * 1_000_000_000 / self.config.tick_speed as i128;
        let elapsed_ns = now.saturating_duration_since(self.game_start).as_nanos() as i128;
        ((target_ns - elapsed_ns) / 1_000_000) as i32
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Load the configured map and initialise the simulation
    pub fn start(&mut self, now: Instant) -> Result<(), ServerError> {
        let map = MapData::load(&*self.maps, &self.config.map)?;
        info!(
            "map '{}' loaded: {} bytes, crc {:08x}",
            map.name(),
            map.size(),
            map.crc()
        );
        self.map = Some(map);
        self.metrics.map_changes.fetch_add(1, Ordering::Relaxed);
        self.tick = 0;
        self.game_start = now;

        let mut ctx = SimContext::new(&mut self.res, self.tick, self.config.tick_speed, now);
        self.sim.on_init(&mut ctx);
        match self.res.shutdown_request.clone() {
            Some(reason) => Err(ServerError::SimulationFault(reason)),
            None => Ok(()),
        }
    }

    /// Run until the shutdown flag clears or the simulation asks to stop
    pub fn run(&mut self) -> Result<(), ServerError> {
        self.start(Instant::now())?;
        info!(
            "server running at {} ticks/s with {} slots",
            self.config.tick_speed, self.config.max_clients
        );

        let mut result = Ok(());
        while self.is_running() {
            match self.run_iteration(Instant::now()) {
                Ok(iteration) => self.wait(iteration, Instant::now()),
                Err(e) => {
                    error!("fatal: {}", e);
                    result = Err(e);
                    break;
                }
            }
        }

        let finished = self.finish();
        result.and(finished)
    }

    /// Drop every client and shut the simulation down. Returns the
    /// simulation's shutdown reason as an error if it requested one.
    pub fn finish(&mut self) -> Result<(), ServerError> {
        let reason = self
            .res
            .shutdown_request
            .clone()
            .or_else(|| self.shutdown_reason.clone())
            .unwrap_or_else(|| "Server shutdown".to_string());
        let now = Instant::now();
        for client in 0..self.clients.len() {
            if !self.clients[client].is_empty() {
                self.drop_client(client, &reason, now);
            }
        }
        self.server_demo.stop();
        let mut ctx = SimContext::new(&mut self.res, self.tick, self.config.tick_speed, now);
        self.sim.on_shutdown(&mut ctx);
        info!("server stopped: {}", reason);

        match self.res.shutdown_request.clone() {
            Some(reason) => Err(ServerError::SimulationFault(reason)),
            None => Ok(()),
        }
    }

    /// One pass of the main loop at time `now`
    pub fn run_iteration(&mut self, now: Instant) -> Result<Iteration, ServerError> {
        if self.map.is_none() {
            return Err(ServerError::NotStarted);
        }

        self.pump_network(now);
        self.update_map(now);
        self.update_dnsbl(now);
        let expired = self.bans.cleanup_expired(now);
        if expired > 0 {
            debug!("{} bans expired", expired);
        }

        let mut new_ticks = 0;
        while now > self.tick_start_time(self.tick + 1) {
            let started = Instant::now();
            self.tick += 1;
            new_ticks += 1;

            for client in 0..self.clients.len() {
                let slot = &self.clients[client];
                if slot.state != ClientState::InGame {
                    continue;
                }
                if let Some(input) = slot.inputs.for_tick(self.tick) {
                    let words = input.words.clone();
                    self.sim.on_client_predicted_input(client, &words);
                }
            }

            let mut ctx = SimContext::new(&mut self.res, self.tick, self.config.tick_speed, now);
            self.sim.on_tick(&mut ctx);
            self.metrics.record_tick_time(started.elapsed());

            if let Some(e) = self.res.id_fault.take() {
                return Err(ServerError::IdPool(e));
            }
            if self.res.shutdown_request.is_some() {
                break;
            }
        }

        if let Some(reason) = &self.res.shutdown_request {
            warn!("simulation requested shutdown: {}", reason);
            self.shutdown();
        }

        if new_ticks > 0 {
            if self.config.high_bandwidth || self.tick % 2 == 0 {
                self.do_snapshot(now);
            }
            self.send_rcon_commands();
        }

        let active = self.clients.iter().any(|slot| !slot.is_empty());
        if active {
            self.reloaded_when_empty = false;
        } else {
            self.handle_empty();
        }
        self.update_gauges();

        Ok(Iteration { new_ticks, active })
    }

    /// Sleep on the transport until the next tick, or a fixed interval when
    /// nobody is connected
    pub fn wait(&mut self, iteration: Iteration, now: Instant) {
        if !iteration.active {
            self.transport.wait(Duration::from_millis(IDLE_WAIT_MS));
            return;
        }
        let next = self.tick_start_time(self.tick + 1);
        if next > now {
            self.transport.wait(next - now + Duration::from_micros(1));
        }
    }

    fn handle_empty(&mut self) {
        match self.config.reload_when_empty {
            ReloadWhenEmpty::Once => {
                self.map_reload = true;
                self.config.reload_when_empty = ReloadWhenEmpty::Off;
            }
            ReloadWhenEmpty::Always if !self.reloaded_when_empty => {
                self.map_reload = true;
                self.reloaded_when_empty = true;
            }
            _ => {}
        }
        if self.config.shutdown_when_empty && self.is_running() {
            info!("server empty, shutting down");
            self.shutdown();
        }
    }

    fn update_gauges(&self) {
        let connected = self.clients.iter().filter(|slot| !slot.is_empty()).count();
        let ingame = self
            .clients
            .iter()
            .filter(|slot| slot.state == ClientState::InGame)
            .count();
        self.metrics.clients_connected.store(connected as u64, Ordering::Relaxed);
        self.metrics.clients_ingame.store(ingame as u64, Ordering::Relaxed);
        self.metrics
            .snap_ids_in_use
            .store(self.res.ids.in_use() as u64, Ordering::Relaxed);
    }

    // ========================================================================
    // Map changes
    // ========================================================================

    fn update_map(&mut self, now: Instant) {
        let current = self.map.as_ref().map(|map| map.name().to_string());
        if current.as_deref() == Some(self.config.map.as_str()) && !self.map_reload {
            return;
        }
        self.map_reload = false;

        let wanted = self.config.map.clone();
        match MapData::load(&*self.maps, &wanted) {
            Ok(map) => self.change_map(map, now),
            Err(e) => {
                error!("failed to load map '{}': {}", wanted, e);
                if let Some(current) = current {
                    self.config.map = current;
                }
            }
        }
    }

    fn change_map(&mut self, map: MapData, now: Instant) {
        info!("changing map to '{}' ({} bytes)", map.name(), map.size());

        for client in 0..self.clients.len() {
            if self.clients[client].state == ClientState::Dummy {
                self.dummy_leave(client);
            }
        }
        self.server_demo.stop();
        for recorder in &mut self.client_demos {
            recorder.stop();
        }

        let mut ctx = SimContext::new(&mut self.res, self.tick, self.config.tick_speed, now);
        self.sim.on_shutdown(&mut ctx);
        self.res.ids.flush();
        self.map = Some(map);
        self.metrics.map_changes.fetch_add(1, Ordering::Relaxed);

        for client in 0..self.clients.len() {
            if self.clients[client].state <= ClientState::Auth {
                continue;
            }
            self.send_map(client);
            let slot = &mut self.clients[client];
            slot.reset_session();
            slot.state = ClientState::Connecting;
        }

        self.tick = 0;
        self.game_start = now;
        let mut ctx = SimContext::new(&mut self.res, self.tick, self.config.tick_speed, now);
        self.sim.on_init(&mut ctx);
    }

    // ========================================================================
    // Network input
    // ========================================================================

    fn pump_network(&mut self, now: Instant) {
        for event in self.transport.poll() {
            match event {
                TransportEvent::Connected { client, addr } => self.on_connected(client, addr, ClientState::Auth, now),
                TransportEvent::ConnectedNoAuth { client, addr } => {
                    self.on_connected(client, addr, ClientState::Connecting, now)
                }
                TransportEvent::Rejoined { client } => self.on_rejoined(client),
                TransportEvent::Disconnected { client, reason } => {
                    if self.clients.get(client).is_some_and(|slot| !slot.is_empty()) {
                        self.client_gone(client, &reason, now);
                    }
                }
                TransportEvent::Packet { client, data, vital } => self.handle_packet(client, &data, vital, now),
            }
        }
    }

    fn on_connected(&mut self, client: ClientId, addr: SocketAddr, state: ClientState, now: Instant) {
        let Some(slot) = self.clients.get(client) else {
            self.transport.drop_client(client, "This server is full");
            return;
        };
        if !slot.is_empty() {
            warn!("transport reused occupied slot {}", client);
            self.client_gone(client, "slot reused", now);
        }
        if let Some(ban) = self.bans.check(addr.ip(), now) {
            let reason = format!("You have been banned ({})", ban.reason);
            self.transport.drop_client(client, &reason);
            return;
        }

        self.clients[client].occupy(state, Some(addr), now);
        info!("player has entered the server. cid={} addr={}", client, addr);

        if state == ClientState::Connecting {
            self.send_capabilities(client);
            self.send_map(client);
        }
    }

    fn on_rejoined(&mut self, client: ClientId) {
        let Some(slot) = self.clients.get_mut(client) else {
            return;
        };
        if slot.is_empty() {
            return;
        }
        slot.clear_auth();
        slot.reset_session();
        self.send_map(client);
    }

    fn handle_packet(&mut self, client: ClientId, data: &[u8], vital: bool, now: Instant) {
        let Some(slot) = self.clients.get(client) else {
            return;
        };
        if slot.is_empty() || slot.state == ClientState::Dummy {
            return;
        }
        self.metrics.record_received(data.len());

        let msg: ClientMessage = match protocol::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("strange message from cid={}: {}", client, e);
                return;
            }
        };

        if let Some(limit) = self.config.netlimit_bytes_per_sec() {
            if !matches!(msg, ClientMessage::RequestMapData { .. }) {
                let alpha = self.config.netlimit_alpha as f64 / 100.0;
                let slot = &mut self.clients[client];
                if !slot.traffic.check_and_record(data.len(), limit, alpha, now) {
                    self.metrics.packets_rate_limited.fetch_add(1, Ordering::Relaxed);
                    if let Some(addr) = slot.addr {
                        self.ban_addr(addr.ip(), Some(Duration::from_secs(NETLIMIT_BAN_SECS)), "Stressing network", now);
                    }
                    return;
                }
            }
        }

        match msg {
            ClientMessage::Info { version, password } if vital => self.on_info(client, &version, &password, now),
            ClientMessage::RequestMapData { chunk } if vital => self.on_request_map_data(client, chunk),
            ClientMessage::Ready if vital => self.on_ready(client, now),
            ClientMessage::Ready => self.send(client, &ServerMessage::ConnectionReady, SendFlags::VITAL_FLUSH),
            ClientMessage::EnterGame if vital => self.on_enter_game(client, now),
            ClientMessage::Input {
                ack_tick,
                intended_tick,
                words,
            } => self.on_input(client, ack_tick, intended_tick, &words, now),
            ClientMessage::RconCmd { command } if vital => self.on_rcon_cmd(client, &command),
            ClientMessage::RconAuth {
                name,
                password,
                send_commands,
            } if vital => self.on_rcon_auth(client, &name, &password, send_commands, now),
            ClientMessage::Ping => self.send(client, &ServerMessage::PingReply, SendFlags::UNRELIABLE),
            ClientMessage::Game(payload) if vital => {
                if self.clients[client].state >= ClientState::Ready {
                    self.sim.on_message(client, &payload);
                }
            }
            other => debug!("ignoring non-vital {} from cid={}", other.kind(), client),
        }
    }

    fn on_info(&mut self, client: ClientId, version: &str, password: &str, now: Instant) {
        if self.clients[client].state != ClientState::Auth {
            return;
        }

        if version != self.sim.net_version() {
            let reason = format!(
                "Wrong version. Server is running '{}' and client '{}'",
                self.sim.net_version(),
                version
            );
            self.drop_client(client, &reason, now);
            return;
        }
        if !self.config.password.is_empty() && password != self.config.password {
            self.drop_client(client, "Wrong password", now);
            return;
        }
        if client >= self.config.first_reserved_slot()
            && !self.config.reserved_slots_password.is_empty()
            && password != self.config.reserved_slots_password
        {
            self.drop_client(client, "This server is full", now);
            return;
        }

        self.clients[client].state = ClientState::Connecting;
        let username_required = self.auth.username_required();
        self.send(client, &ServerMessage::RconType { username_required }, SendFlags::VITAL);
        self.send_capabilities(client);
        self.send_map(client);
    }

    fn on_request_map_data(&mut self, client: ClientId, chunk: i32) {
        let slot = &self.clients[client];
        if slot.state < ClientState::Connecting {
            return;
        }
        let next = slot.next_map_chunk;

        if chunk != next || !self.config.fast_download {
            self.send_map_data(client, chunk);
            return;
        }

        if chunk == 0 {
            for k in 0..self.config.map_window {
                self.send_map_data(client, k);
            }
        }
        self.send_map_data(client, self.config.map_window + next);
        self.clients[client].next_map_chunk += 1;
    }

    fn on_ready(&mut self, client: ClientId, now: Instant) {
        if self.clients[client].state == ClientState::Connecting {
            info!("player is ready. cid={}", client);
            self.clients[client].state = ClientState::Ready;
            let mut ctx = SimContext::new(&mut self.res, self.tick, self.config.tick_speed, now);
            self.sim.on_client_connected(client, &mut ctx);
        }
        self.send(client, &ServerMessage::ConnectionReady, SendFlags::VITAL_FLUSH);
    }

    fn on_enter_game(&mut self, client: ClientId, now: Instant) {
        if self.clients[client].state != ClientState::Ready || !self.sim.is_client_ready(client) {
            return;
        }
        info!("player has entered the game. cid={}", client);
        self.clients[client].state = ClientState::InGame;
        let mut ctx = SimContext::new(&mut self.res, self.tick, self.config.tick_speed, now);
        self.sim.on_client_enter(client, &mut ctx);
    }

    fn on_input(&mut self, client: ClientId, ack_tick: Tick, intended_tick: Tick, words: &[i32], now: Instant) {
        if self.clients[client].state < ClientState::Connecting {
            return;
        }
        if words.len() > MAX_INPUT_SIZE {
            debug!("oversized input from cid={}: {} words", client, words.len());
            return;
        }

        let slot = &mut self.clients[client];
        slot.last_acked_snapshot = ack_tick;
        if ack_tick > 0 {
            slot.snap_rate = SnapRate::Full;
        }
        if let Some(stored) = slot.snapshots.get(ack_tick) {
            slot.latency_ms = now.saturating_duration_since(stored.tagged_at).as_millis() as i32;
        }

        if intended_tick > slot.last_input_tick {
            let time_left_ms = self.ms_until_tick(intended_tick, now);
            self.send(
                client,
                &ServerMessage::InputTiming {
                    intended_tick,
                    time_left_ms,
                },
                SendFlags::UNRELIABLE,
            );
        }

        let tick = self.tick;
        let slot = &mut self.clients[client];
        slot.last_input_tick = intended_tick;
        let intended_tick = if intended_tick <= tick { tick + 1 } else { intended_tick };
        slot.inputs.push(intended_tick, words);

        if slot.state == ClientState::InGame {
            self.sim.on_client_direct_input(client, &slot.inputs.latest().words);
        }
    }

    fn on_rcon_cmd(&mut self, client: ClientId, command: &str) {
        let level = self.clients[client].auth_level;
        if level == AuthLevel::None {
            return;
        }
        info!("ClientID={} rcon='{}'", client, command);

        let previous = (self.rcon_client, self.rcon_level);
        self.rcon_client = Some(client);
        self.rcon_level = level;
        let lines = self.execute_command(command);
        (self.rcon_client, self.rcon_level) = previous;

        for line in lines {
            self.send(client, &ServerMessage::RconLine(line), SendFlags::VITAL);
        }
    }

    fn on_rcon_auth(&mut self, client: ClientId, name: &str, password: &str, send_commands: bool, now: Instant) {
        let key = if name.is_empty() {
            [AuthLevel::Admin, AuthLevel::Moderator, AuthLevel::Helper]
                .into_iter()
                .filter_map(|level| self.auth.default_key(level))
                .find(|&key| self.auth.check_key(key, password))
        } else {
            self.auth
                .find_key(name)
                .filter(|&key| self.auth.check_key(key, password))
        };

        match key {
            Some(key) => {
                let level = self.auth.key_level(key);
                if self.clients[client].auth_level == level {
                    return;
                }
                self.send(
                    client,
                    &ServerMessage::RconAuthStatus {
                        authed: true,
                        cmdlist: true,
                    },
                    SendFlags::VITAL,
                );
                let previous = self.clients[client].auth_level;
                if previous > level {
                    for info in console::COMMANDS.iter().filter(|info| info.level > level && info.level <= previous) {
                        let message = ServerMessage::RconCmdRem {
                            name: info.name.to_string(),
                        };
                        self.send(client, &message, SendFlags::VITAL);
                    }
                }
                let slot = &mut self.clients[client];
                slot.auth_level = level;
                slot.auth_key = Some(key);
                slot.auth_tries = 0;
                slot.pending_rcon_commands.clear();
                if send_commands {
                    slot.pending_rcon_commands = console::visible_commands(level);
                }
                let greeting = match level {
                    AuthLevel::Admin => "Admin authentication successful. Full remote console access granted.",
                    AuthLevel::Moderator => "Moderator authentication successful. Limited remote console access granted.",
                    _ => "Helper authentication successful. Limited remote console access granted.",
                };
                self.send(client, &ServerMessage::RconLine(greeting.to_string()), SendFlags::VITAL);
                info!(
                    "ClientID={} authed with key={} ({})",
                    client,
                    self.auth.key_ident(key).unwrap_or("?"),
                    level.name()
                );
                self.sim.on_set_authed(client, level);
            }
            None if self.config.rcon_max_tries > 0 => {
                let slot = &mut self.clients[client];
                slot.auth_tries += 1;
                let tries = slot.auth_tries;
                let addr = slot.addr;
                let max = self.config.rcon_max_tries;
                self.send(
                    client,
                    &ServerMessage::RconLine(format!("Wrong password {}/{}.", tries, max)),
                    SendFlags::VITAL,
                );
                if tries >= max {
                    let reason = "Too many remote console authentication tries";
                    match (self.config.rcon_bantime, addr) {
                        (0, _) | (_, None) => self.drop_client(client, reason, now),
                        (minutes, Some(addr)) => {
                            self.ban_addr(addr.ip(), Some(Duration::from_secs(minutes * 60)), reason, now)
                        }
                    }
                }
            }
            None => self.send(client, &ServerMessage::RconLine("Wrong password.".to_string()), SendFlags::VITAL),
        }
    }

    // ========================================================================
    // Network output
    // ========================================================================

    fn send(&mut self, client: ClientId, message: &ServerMessage, flags: SendFlags) {
        let payload = match protocol::encode(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode message for cid={}: {}", client, e);
                return;
            }
        };
        match self.transport.send(client, &payload, flags) {
            Ok(()) => self.metrics.record_sent(payload.len()),
            Err(e) => debug!("send to cid={} failed: {}", client, e),
        }
    }

    fn send_capabilities(&mut self, client: ClientId) {
        self.send(
            client,
            &ServerMessage::Capabilities {
                version: CAPABILITIES_VERSION,
                flags: CAPABILITIES_FLAGS,
            },
            SendFlags::VITAL,
        );
    }

    fn send_map(&mut self, client: ClientId) {
        let Some(map) = &self.map else {
            return;
        };
        let details = ServerMessage::MapDetails {
            name: map.name().to_string(),
            sha256: map.sha256(),
            crc: map.crc(),
            size: map.size(),
        };
        let change = ServerMessage::MapChange {
            name: map.name().to_string(),
            crc: map.crc(),
            size: map.size(),
        };
        self.send(client, &details, SendFlags::VITAL);
        self.send(client, &change, SendFlags::VITAL_FLUSH);
        self.clients[client].next_map_chunk = 0;
    }

    fn send_map_data(&mut self, client: ClientId, index: i32) {
        let Some(map) = &self.map else {
            return;
        };
        let Some(chunk) = map.chunk(index) else {
            return;
        };
        let message = ServerMessage::MapData {
            last: chunk.last,
            crc: map.crc(),
            chunk: chunk.index,
            data: chunk.data.to_vec(),
        };
        self.send(client, &message, SendFlags::VITAL_FLUSH);
        self.metrics.map_chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn send_rcon_commands(&mut self) {
        for client in 0..self.clients.len() {
            let slot = &mut self.clients[client];
            if slot.pending_rcon_commands.is_empty() || !slot.is_authed() {
                continue;
            }
            let take = slot.pending_rcon_commands.len().min(MAX_CMD_SEND);
            let batch: Vec<usize> = slot.pending_rcon_commands.drain(..take).collect();
            for idx in batch {
                let info = &console::COMMANDS[idx];
                let message = ServerMessage::RconCmdAdd {
                    name: info.name.to_string(),
                    help: info.help.to_string(),
                    params: info.params.to_string(),
                };
                self.send(client, &message, SendFlags::VITAL);
            }
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Build and send this tick's snapshots. The server demo gets one every
    /// call; a per-client demo records exactly what that client was sent, so
    /// it follows the client's Init/Recovering cadence.
    fn do_snapshot(&mut self, now: Instant) {
        self.sim.on_pre_snap();

        if self.server_demo.is_recording() {
            let mut builder = SnapshotBuilder::new();
            self.sim.on_snap(SnapTarget::Demo, &mut builder);
            let mut snapshot = builder.finish();
            self.sim.sanitize_demo_snapshot(&mut snapshot);
            self.server_demo.record(self.tick, &snapshot);
        }

        for client in 0..self.clients.len() {
            let slot = &self.clients[client];
            if slot.state != ClientState::InGame {
                continue;
            }
            match slot.snap_rate {
                SnapRate::Recovering if self.tick % RECOVER_INTERVAL != 0 => continue,
                SnapRate::Init if self.tick % INIT_INTERVAL != 0 => continue,
                _ => {}
            }

            let mut builder = SnapshotBuilder::new();
            self.sim.on_snap(SnapTarget::Client(client), &mut builder);
            let snapshot = builder.finish();
            if self.client_demos[client].is_recording() {
                let mut demo = snapshot.clone();
                self.sim.sanitize_demo_snapshot(&mut demo);
                self.client_demos[client].record(self.tick, &demo);
            }
            self.send_snapshot(client, snapshot, now);
        }

        self.sim.on_post_snap();
    }

    fn send_snapshot(&mut self, client: ClientId, snapshot: Snapshot, now: Instant) {
        let tick = self.tick;
        let crc = snapshot.crc();
        let history_ticks = self.config.tick_speed as Tick * SNAPSHOT_HISTORY_SECONDS;

        let slot = &mut self.clients[client];
        slot.snapshots.purge_until(tick - history_ticks);

        let empty = Snapshot::empty();
        let (baseline, base_tick) = match slot.snapshots.get(slot.last_acked_snapshot) {
            Some(stored) => (&stored.snapshot, stored.tick),
            None => {
                if slot.snap_rate == SnapRate::Full {
                    debug!("cid={} lost baseline {}, recovering", client, slot.last_acked_snapshot);
                    slot.snap_rate = SnapRate::Recovering;
                }
                (&empty, -1)
            }
        };

        let delta = create_delta(baseline, &snapshot, &self.res.schema);
        slot.snapshots.add(tick, now, snapshot);
        let delta = match delta {
            Ok(delta) => delta,
            Err(e) => {
                error!("failed to build snapshot delta for cid={}: {}", client, e);
                return;
            }
        };

        let delta_tick = tick - base_tick;
        if delta.is_empty() {
            self.send(client, &ServerMessage::SnapEmpty { tick, delta_tick }, SendFlags::UNRELIABLE_FLUSH);
            self.metrics.snapshots_empty.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let payload = varint::compress(&delta);
        let messages = match frame_snapshot(SnapHeader { tick, delta_tick, crc }, &payload) {
            Ok(messages) => messages,
            Err(e) => {
                error!("failed to frame snapshot for cid={}: {}", client, e);
                return;
            }
        };
        let counter = if messages.len() == 1 {
            &self.metrics.snapshots_single
        } else {
            &self.metrics.snapshots_multipart
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .snapshot_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        for message in &messages {
            self.send(client, message, SendFlags::UNRELIABLE_FLUSH);
        }
    }

    // ========================================================================
    // DNSBL
    // ========================================================================

    fn update_dnsbl(&mut self, now: Instant) {
        if !self.config.dnsbl {
            return;
        }
        let Some(resolver) = self.dnsbl.as_ref() else {
            return;
        };

        let mut to_ban = Vec::new();
        for (client, slot) in self.clients.iter_mut().enumerate() {
            let Some(IpAddr::V4(ip)) = slot.addr.map(|addr| addr.ip()) else {
                continue;
            };
            match slot.dnsbl {
                DnsblState::None => {
                    slot.dnsbl_lookup = Some(resolver.lookup(ip));
                    slot.dnsbl = DnsblState::Pending;
                }
                DnsblState::Pending => {
                    if let Some(listed) = slot.dnsbl_lookup.as_ref().and_then(|lookup| lookup.poll()) {
                        slot.dnsbl_lookup = None;
                        slot.dnsbl = if listed {
                            DnsblState::Blacklisted
                        } else {
                            DnsblState::Whitelisted
                        };
                        info!("ClientID={} addr={} dnsbl={}", client, ip, slot.dnsbl.name());
                    }
                }
                _ => {}
            }
            if slot.dnsbl == DnsblState::Blacklisted && self.config.dnsbl_ban {
                to_ban.push(IpAddr::V4(ip));
            }
        }

        for ip in to_ban {
            self.ban_addr(ip, Some(Duration::from_secs(DNSBL_BAN_SECS)), "Blacklisted by DNSBL", now);
        }
    }

    // ========================================================================
    // Client management
    // ========================================================================

    /// Close a client's connection and release its slot
    pub fn drop_client(&mut self, client: ClientId, reason: &str, now: Instant) {
        let Some(slot) = self.clients.get(client) else {
            return;
        };
        if slot.is_empty() {
            return;
        }
        if slot.state != ClientState::Dummy {
            self.transport.drop_client(client, reason);
        }
        self.client_gone(client, reason, now);
    }

    fn client_gone(&mut self, client: ClientId, reason: &str, now: Instant) {
        let slot = &self.clients[client];
        let addr = slot.addr;
        if slot.state >= ClientState::Ready {
            let mut ctx = SimContext::new(&mut self.res, self.tick, self.config.tick_speed, now);
            self.sim.on_client_drop(client, reason, &mut ctx);
        }
        self.client_demos[client].stop();
        self.clients[client].vacate(now);
        match addr {
            Some(addr) => info!("client dropped. cid={} addr={} reason='{}'", client, addr, reason),
            None => info!("client dropped. cid={} reason='{}'", client, reason),
        }
    }

    /// Kick a client on behalf of the current command issuer
    pub fn kick(&mut self, client: ClientId, reason: &str) -> Result<(), KickError> {
        let slot = self.clients.get(client).ok_or(KickError::InvalidClient)?;
        if slot.is_empty() {
            return Err(KickError::InvalidClient);
        }
        if self.rcon_client == Some(client) {
            return Err(KickError::SelfKick);
        }
        if slot.auth_level > self.rcon_level || slot.state == ClientState::Dummy {
            return Err(KickError::Denied);
        }
        self.drop_client(client, reason, Instant::now());
        Ok(())
    }

    /// Ban an address and drop everyone connected from it
    pub fn ban_addr(&mut self, ip: IpAddr, duration: Option<Duration>, reason: &str, now: Instant) {
        warn!(
            "banned {} for {} ({})",
            ip,
            duration.map_or_else(|| "ever".to_string(), |d| format!("{}s", d.as_secs())),
            reason
        );
        self.bans.ban(ip, duration, reason, now);
        self.metrics.bans_issued.fetch_add(1, Ordering::Relaxed);

        let message = format!("You have been banned ({})", reason);
        for client in 0..self.clients.len() {
            if self.clients[client].addr.is_some_and(|addr| addr.ip() == ip) {
                self.drop_client(client, &message, now);
            }
        }
    }

    /// Occupy an empty slot with a server-side dummy
    pub fn dummy_join(&mut self, client: ClientId, name: &str, clan: &str, country: i32) -> bool {
        let now = Instant::now();
        let Some(slot) = self.clients.get_mut(client) else {
            return false;
        };
        if !slot.is_empty() {
            return false;
        }
        slot.occupy(ClientState::Dummy, None, now);
        slot.name = name.to_string();
        slot.clan = clan.to_string();
        slot.country = country;
        true
    }

    pub fn dummy_leave(&mut self, client: ClientId) {
        if self.client_state(client) == ClientState::Dummy {
            self.client_gone(client, "dummy leave", Instant::now());
        }
    }

    /// Set a client's name, enforcing name bans and uniqueness. Clashing
    /// names get a numeric prefix.
    pub fn set_client_name(&mut self, client: ClientId, name: &str) {
        if self.client_state(client) < ClientState::Ready {
            return;
        }

        if let Some(ban) = self.name_bans.find(name) {
            if self.clients[client].state == ClientState::Ready {
                let reason = if ban.reason.is_empty() {
                    "Kicked (your name is banned)".to_string()
                } else {
                    format!("Kicked (your name is banned: {})", ban.reason)
                };
                self.drop_client(client, &reason, Instant::now());
            }
            return;
        }

        if self.try_set_client_name(client, name) {
            return;
        }
        for n in 1..=self.clients.len() {
            if self.try_set_client_name(client, &format!("({}){}", n, name)) {
                return;
            }
        }
    }

    fn try_set_client_name(&mut self, client: ClientId, name: &str) -> bool {
        let Some(trimmed) = sanitize_name(name) else {
            return false;
        };
        let lowered = trimmed.to_lowercase();
        let taken = self.clients.iter().enumerate().any(|(other, slot)| {
            other != client && slot.state >= ClientState::Ready && slot.name.to_lowercase() == lowered
        });
        if taken {
            return false;
        }
        self.clients[client].name = trimmed.to_string();
        true
    }

    pub fn set_client_clan(&mut self, client: ClientId, clan: &str) {
        if self.client_state(client) >= ClientState::Ready {
            self.clients[client].clan = clan.to_string();
        }
    }

    pub fn set_client_country(&mut self, client: ClientId, country: i32) {
        if self.client_state(client) >= ClientState::Ready {
            self.clients[client].country = country;
        }
    }

    pub fn set_client_score(&mut self, client: ClientId, score: i32) {
        if self.client_state(client) >= ClientState::Ready {
            self.clients[client].score = score;
        }
    }

    pub fn set_client_flags(&mut self, client: ClientId, flags: i32) {
        if self.client_state(client) >= ClientState::Ready {
            self.clients[client].flags = flags;
        }
    }

    // ========================================================================
    // Rcon sessions and demos
    // ========================================================================

    /// End a client's rcon session. `by` names who forced it, if anyone.
    pub fn logout_client(&mut self, client: ClientId, by: Option<&str>) {
        if !self.clients.get(client).is_some_and(ClientSlot::is_authed) {
            return;
        }
        self.send(
            client,
            &ServerMessage::RconAuthStatus {
                authed: false,
                cmdlist: false,
            },
            SendFlags::VITAL,
        );
        self.clients[client].clear_auth();
        let line = match by {
            Some(by) => format!("Logged out by {}.", by),
            None => "Logout successful.".to_string(),
        };
        self.send(client, &ServerMessage::RconLine(line), SendFlags::VITAL);
        info!("ClientID={} logged out", client);
        self.sim.on_set_authed(client, AuthLevel::None);
    }

    /// Log out every client using `key`
    pub fn logout_key(&mut self, key: KeyId, by: &str) {
        for client in 0..self.clients.len() {
            if self.clients[client].auth_key == Some(key) {
                self.logout_client(client, Some(by));
            }
        }
    }

    pub fn start_server_record(&mut self, name: &str) -> Result<(), DemoError> {
        let sink = self.open_demo(name)?;
        self.server_demo.start(sink);
        Ok(())
    }

    pub fn stop_server_record(&mut self) {
        self.server_demo.stop();
    }

    pub fn is_server_recording(&self) -> bool {
        self.server_demo.is_recording()
    }

    pub fn start_client_record(&mut self, client: ClientId, name: &str) -> Result<(), DemoError> {
        if self.client_state(client) != ClientState::InGame {
            return Err(DemoError::InvalidName(name.to_string()));
        }
        let sink = self.open_demo(name)?;
        self.client_demos[client].start(sink);
        Ok(())
    }

    pub fn stop_client_record(&mut self, client: ClientId) {
        if let Some(recorder) = self.client_demos.get_mut(client) {
            recorder.stop();
        }
    }

    fn open_demo(&mut self, name: &str) -> Result<Box<dyn demo::DemoSink>, DemoError> {
        let map = self.map.as_ref().map_or("", MapData::name).to_string();
        match self.demo_store.as_mut() {
            Some(store) => store.open(name, &map),
            None => Err(DemoError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "no demo storage configured",
            ))),
        }
    }
}
