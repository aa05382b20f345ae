use std::net::Ipv4Addr;

use parking_lot::Mutex;

use super::*;
use crate::game::sandbox::{SandboxSimulation, NET_VERSION};
use crate::net::map_transfer::MemoryMapSource;
use crate::net::transport::LoopbackTransport;
use crate::server::demo::DemoSink;
use crate::server::dnsbl::DnsblLookup;

const VERSION: &str = "test 1";
const ITEM: u16 = 1;

/// Simulation that records every callback
#[derive(Debug, Default)]
struct RecordingSim {
    inits: usize,
    shutdowns: usize,
    current_tick: Tick,
    ticks: Vec<Tick>,
    connected: Vec<ClientId>,
    entered: Vec<ClientId>,
    dropped: Vec<(ClientId, String)>,
    predicted: Vec<(ClientId, Tick, Vec<i32>)>,
    direct: Vec<(ClientId, Vec<i32>)>,
    authed: Vec<(ClientId, AuthLevel)>,
    messages: Vec<(ClientId, Vec<u8>)>,
    snap_value: i32,
    fail_at: Option<Tick>,
    block_enter: bool,
    alloc_each_tick: bool,
    strip_demo: bool,
}

impl Simulation for RecordingSim {
    fn net_version(&self) -> &str {
        VERSION
    }

    fn on_init(&mut self, ctx: &mut SimContext<'_>) {
        self.inits += 1;
        self.current_tick = ctx.tick();
        ctx.set_static_size(ITEM, 1);
    }

    fn on_shutdown(&mut self, _ctx: &mut SimContext<'_>) {
        self.shutdowns += 1;
    }

    fn on_tick(&mut self, ctx: &mut SimContext<'_>) {
        self.current_tick = ctx.tick();
        self.ticks.push(ctx.tick());
        if self.alloc_each_tick {
            let _ = ctx.new_id();
        }
        if self.fail_at == Some(ctx.tick()) {
            ctx.request_shutdown("simulation fault");
        }
    }

    fn on_snap(&mut self, target: SnapTarget, builder: &mut SnapshotBuilder) {
        if let SnapTarget::Client(client) = target {
            builder.add_item(ITEM, client as u16, &[self.snap_value]).unwrap();
        }
    }

    fn sanitize_demo_snapshot(&self, snapshot: &mut Snapshot) {
        if self.strip_demo {
            snapshot.retain(|_| false);
        }
    }

    fn on_client_connected(&mut self, client: ClientId, _ctx: &mut SimContext<'_>) {
        self.connected.push(client);
    }

    fn is_client_ready(&self, _client: ClientId) -> bool {
        !self.block_enter
    }

    fn on_client_enter(&mut self, client: ClientId, _ctx: &mut SimContext<'_>) {
        self.entered.push(client);
    }

    fn on_client_drop(&mut self, client: ClientId, reason: &str, _ctx: &mut SimContext<'_>) {
        self.dropped.push((client, reason.to_string()));
    }

    fn on_client_direct_input(&mut self, client: ClientId, input: &[i32]) {
        self.direct.push((client, input.to_vec()));
    }

    fn on_client_predicted_input(&mut self, client: ClientId, input: &[i32]) {
        self.predicted.push((client, self.current_tick + 1, input.to_vec()));
    }

    fn on_message(&mut self, client: ClientId, payload: &[u8]) {
        self.messages.push((client, payload.to_vec()));
    }

    fn on_set_authed(&mut self, client: ClientId, level: AuthLevel) {
        self.authed.push((client, level));
    }
}

struct FixedResolver(bool);

impl DnsblResolver for FixedResolver {
    fn lookup(&self, _ip: Ipv4Addr) -> DnsblLookup {
        DnsblLookup::ready(self.0)
    }
}

/// Records `(tick, item count)` per frame
type DemoLog = Arc<Mutex<Vec<(Tick, usize)>>>;

struct MemoryDemoStore(DemoLog);

struct MemoryDemoSink(DemoLog);

impl DemoStore for MemoryDemoStore {
    fn open(&mut self, _name: &str, _map: &str) -> Result<Box<dyn DemoSink>, DemoError> {
        Ok(Box::new(MemoryDemoSink(self.0.clone())))
    }
}

impl DemoSink for MemoryDemoSink {
    fn record(&mut self, tick: Tick, snapshot: &Snapshot) -> Result<(), DemoError> {
        self.0.lock().push((tick, snapshot.len()));
        Ok(())
    }

    fn finish(&mut self) -> Result<(), DemoError> {
        Ok(())
    }
}

fn demo_ticks(log: &DemoLog) -> Vec<Tick> {
    log.lock().iter().map(|(tick, _)| *tick).collect()
}

struct Harness {
    server: Server<RecordingSim, LoopbackTransport>,
    net: LoopbackTransport,
    t0: Instant,
}

fn test_config() -> ServerConfig {
    ServerConfig {
        max_clients: 4,
        netlimit: 0,
        ..ServerConfig::default()
    }
}

fn harness_with(
    config: ServerConfig,
    setup: impl FnOnce(Server<RecordingSim, LoopbackTransport>) -> Server<RecordingSim, LoopbackTransport>,
) -> Harness {
    let net = LoopbackTransport::new();
    let maps = MemoryMapSource::new()
        .with_map("dm1", vec![7; 2000])
        .with_map("dm2", vec![1; 10]);
    let mut server = setup(Server::new(config, RecordingSim::default(), net.clone(), Box::new(maps)));
    let t0 = Instant::now();
    server.start(t0).unwrap();
    Harness { server, net, t0 }
}

fn harness(config: ServerConfig) -> Harness {
    harness_with(config, |server| server)
}

fn addr(client: ClientId) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, client as u8 + 1)), 4000)
}

fn info() -> ClientMessage {
    ClientMessage::Info {
        version: VERSION.to_string(),
        password: String::new(),
    }
}

fn input(ack_tick: Tick, intended_tick: Tick, words: &[i32]) -> ClientMessage {
    ClientMessage::Input {
        ack_tick,
        intended_tick,
        words: words.to_vec(),
    }
}

fn rcon_auth(name: &str, password: &str) -> ClientMessage {
    ClientMessage::RconAuth {
        name: name.to_string(),
        password: password.to_string(),
        send_commands: true,
    }
}

fn rcon(command: &str) -> ClientMessage {
    ClientMessage::RconCmd {
        command: command.to_string(),
    }
}

impl Harness {
    /// Just past the start of `tick`
    fn at(&self, tick: Tick) -> Instant {
        self.t0 + Duration::from_millis(20 * tick as u64) + Duration::from_micros(500)
    }

    fn step(&mut self, tick: Tick) -> Iteration {
        let now = self.at(tick);
        self.server.run_iteration(now).unwrap()
    }

    fn step_through(&mut self, from: Tick, to: Tick) {
        for tick in from..=to {
            self.step(tick);
        }
    }

    /// Connect `client` and walk it through the handshake into the game
    fn join(&mut self, client: ClientId, tick: Tick) {
        self.net.connect(client, addr(client));
        self.net.deliver(client, &info());
        self.net.deliver(client, &ClientMessage::Ready);
        self.net.deliver(client, &ClientMessage::EnterGame);
        self.step(tick);
    }

    fn sim(&self) -> &RecordingSim {
        self.server.simulation()
    }

    fn state(&self, client: ClientId) -> ClientState {
        self.server.client_state(client)
    }

    /// `(tick, delta_tick)` of every snapshot sent to `client`
    fn snapshots(&self, client: ClientId) -> Vec<(Tick, Tick)> {
        self.net
            .sent_to(client)
            .into_iter()
            .filter_map(|msg| match msg {
                ServerMessage::SnapSingle { tick, delta_tick, .. }
                | ServerMessage::SnapEmpty { tick, delta_tick }
                | ServerMessage::Snap {
                    tick, delta_tick, part: 0, ..
                } => Some((tick, delta_tick)),
                _ => None,
            })
            .collect()
    }

    fn rcon_lines(&self, client: ClientId) -> Vec<String> {
        self.net
            .sent_to(client)
            .into_iter()
            .filter_map(|msg| match msg {
                ServerMessage::RconLine(line) => Some(line),
                _ => None,
            })
            .collect()
    }
}

#[test]
fn test_enter_game_ignored_before_ready() {
    let mut h = harness(test_config());
    h.net.connect(0, addr(0));
    h.net.deliver(0, &ClientMessage::EnterGame);
    h.net.deliver(1, &ClientMessage::EnterGame);
    h.step(0);

    assert_eq!(h.state(0), ClientState::Auth);
    assert_eq!(h.state(1), ClientState::Empty);
    assert!(h.sim().entered.is_empty());
}

#[test]
fn test_enter_game_waits_for_simulation() {
    let mut h = harness(test_config());
    h.server.simulation_mut().block_enter = true;
    h.join(0, 0);
    assert_eq!(h.state(0), ClientState::Ready);
    assert_eq!(h.sim().connected, vec![0]);
    assert!(h.sim().entered.is_empty());
}

#[test]
fn test_wrong_version_drops() {
    let mut h = harness(test_config());
    h.net.connect(0, addr(0));
    h.net.deliver(
        0,
        &ClientMessage::Info {
            version: "other".to_string(),
            password: String::new(),
        },
    );
    h.step(0);

    assert_eq!(h.state(0), ClientState::Empty);
    assert_eq!(
        h.net.dropped(),
        vec![(0, "Wrong version. Server is running 'test 1' and client 'other'".to_string())]
    );
}

#[test]
fn test_wrong_password_drops() {
    let mut h = harness(ServerConfig {
        password: "letmein".to_string(),
        ..test_config()
    });
    h.net.connect(0, addr(0));
    h.net.deliver(0, &info());
    h.step(0);
    assert_eq!(h.net.dropped(), vec![(0, "Wrong password".to_string())]);
}

#[test]
fn test_reserved_slot_requires_password() {
    let mut h = harness(ServerConfig {
        reserved_slots: 1,
        reserved_slots_password: "vip".to_string(),
        ..test_config()
    });
    h.net.connect(3, addr(3));
    h.net.deliver(3, &info());
    h.step(0);
    assert_eq!(h.net.dropped(), vec![(3, "This server is full".to_string())]);
}

#[test]
fn test_info_sends_map_once() {
    let mut h = harness(test_config());
    h.net.connect(0, addr(0));
    h.net.deliver(0, &info());
    h.step(0);

    let sent = h.net.sent_to(0);
    let details = sent.iter().filter(|m| matches!(m, ServerMessage::MapDetails { .. })).count();
    let changes = sent.iter().filter(|m| matches!(m, ServerMessage::MapChange { .. })).count();
    assert_eq!((details, changes), (1, 1));
    assert!(sent.contains(&ServerMessage::RconType { username_required: false }));
    assert!(sent.iter().any(|m| matches!(m, ServerMessage::Capabilities { .. })));
    assert_eq!(h.state(0), ClientState::Connecting);

    // a repeated INFO is ignored
    h.net.deliver(0, &info());
    h.step(0);
    let changes = h
        .net
        .sent_to(0)
        .iter()
        .filter(|m| matches!(m, ServerMessage::MapChange { .. }))
        .count();
    assert_eq!(changes, 1);
}

#[test]
fn test_map_download_window() {
    let mut h = harness(ServerConfig {
        map_window: 1,
        ..test_config()
    });
    h.net.connect(0, addr(0));
    h.net.deliver(0, &info());
    for chunk in [0, 1, 2, 7] {
        h.net.deliver(0, &ClientMessage::RequestMapData { chunk });
    }
    h.step(0);

    let chunks: Vec<(i32, bool)> = h
        .net
        .sent_to(0)
        .into_iter()
        .filter_map(|msg| match msg {
            ServerMessage::MapData { chunk, last, .. } => Some((chunk, last)),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![(0, false), (1, false), (2, true)]);
}

#[test]
fn test_out_of_range_chunk_is_noop() {
    let mut h = harness(ServerConfig {
        fast_download: false,
        ..test_config()
    });
    h.net.connect(0, addr(0));
    h.net.deliver(0, &info());
    h.net.deliver(0, &ClientMessage::RequestMapData { chunk: 99 });
    h.net.deliver(0, &ClientMessage::RequestMapData { chunk: -1 });
    h.net.deliver(0, &ClientMessage::RequestMapData { chunk: 1 });
    h.step(0);

    let chunks: Vec<i32> = h
        .net
        .sent_to(0)
        .into_iter()
        .filter_map(|msg| match msg {
            ServerMessage::MapData { chunk, .. } => Some(chunk),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![1]);
}

#[test]
fn test_input_delivered_at_intended_tick() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.net.deliver_with(0, &input(-1, 5, &[1, 2]), false);
    h.step(1);

    assert!(h.net.sent_to(0).contains(&ServerMessage::InputTiming {
        intended_tick: 5,
        time_left_ms: 79
    }));
    assert_eq!(h.sim().direct, vec![(0, vec![1, 2])]);

    h.step_through(2, 8);
    assert_eq!(h.sim().predicted, vec![(0, 5, vec![1, 2])]);
}

#[test]
fn test_late_input_moves_to_next_tick() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.step(3);
    h.net.deliver_with(0, &input(-1, 2, &[9]), false);
    h.step_through(4, 6);
    assert_eq!(h.sim().predicted, vec![(0, 4, vec![9])]);
}

#[test]
fn test_oversized_input_discarded() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.net.deliver_with(0, &input(-1, 2, &[0; MAX_INPUT_SIZE + 1]), false);
    h.step_through(1, 3);
    assert!(h.sim().direct.is_empty());
    assert!(h.sim().predicted.is_empty());
}

#[test]
fn test_snapshot_every_other_tick() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.step_through(1, 10);

    // Init rate: only tick 10 qualifies, against the empty baseline
    assert_eq!(h.snapshots(0), vec![(10, 11)]);
    assert_eq!(h.server.client(0).unwrap().snap_rate, SnapRate::Init);

    h.net.deliver_with(0, &input(10, 12, &[]), false);
    h.net.take_sent();
    h.step_through(11, 20);

    assert_eq!(h.server.client(0).unwrap().snap_rate, SnapRate::Full);
    assert_eq!(h.snapshots(0), vec![(12, 2), (14, 4), (16, 6), (18, 8), (20, 10)]);
    assert!(h
        .net
        .sent_to(0)
        .iter()
        .filter(|m| m.is_snapshot())
        .all(|m| matches!(m, ServerMessage::SnapEmpty { .. })));
}

#[test]
fn test_high_bandwidth_snapshots_every_tick() {
    let mut h = harness(ServerConfig {
        high_bandwidth: true,
        ..test_config()
    });
    h.join(0, 0);
    h.step_through(1, 10);
    h.net.deliver_with(0, &input(10, 11, &[]), false);
    h.net.take_sent();
    h.step_through(11, 14);
    let ticks: Vec<Tick> = h.snapshots(0).into_iter().map(|(tick, _)| tick).collect();
    assert_eq!(ticks, vec![11, 12, 13, 14]);
}

#[test]
fn test_changed_item_sends_delta() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.step_through(1, 10);
    h.net.deliver_with(0, &input(10, 11, &[]), false);
    h.server.simulation_mut().snap_value = 42;
    h.net.take_sent();
    h.step_through(11, 12);

    let sent = h.net.sent_to(0);
    let Some(ServerMessage::SnapSingle { tick, delta_tick, data, .. }) = sent.iter().find(|m| m.is_snapshot()) else {
        panic!("expected a single-part snapshot, got {:?}", sent);
    };
    assert_eq!((*tick, *delta_tick), (12, 2));

    let baseline = h.server.client(0).unwrap().snapshots.get(10).unwrap().snapshot.clone();
    let words = varint::decompress(data).unwrap();
    let rebuilt = crate::net::delta::apply_delta(&baseline, &words, &h.server.res.schema).unwrap();
    assert_eq!(rebuilt.items()[0].data, vec![42]);
}

#[test]
fn test_lost_baseline_switches_to_recovering() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.step_through(1, 10);

    // tick 7 was never snapshotted for this client
    h.net.deliver_with(0, &input(7, 11, &[]), false);
    h.net.take_sent();
    h.step_through(11, 12);
    assert_eq!(h.server.client(0).unwrap().snap_rate, SnapRate::Recovering);
    assert_eq!(h.snapshots(0), vec![(12, 13)]);

    h.net.take_sent();
    h.step_through(13, 50);
    assert_eq!(h.snapshots(0), vec![(50, 51)]);
}

#[test]
fn test_netlimit_bans_address() {
    let mut h = harness(ServerConfig {
        netlimit: 1,
        ..test_config()
    });
    h.net.connect(0, addr(0));
    h.step(0);

    h.net.deliver(0, &ClientMessage::Game(vec![0; 1000]));
    h.net.deliver(0, &ClientMessage::Ping);
    h.step(1);

    assert_eq!(h.state(0), ClientState::Empty);
    assert_eq!(
        h.net.dropped(),
        vec![(0, "You have been banned (Stressing network)".to_string())]
    );
    let ban = h.server.bans().check(addr(0).ip(), h.at(1)).unwrap();
    assert_eq!(ban.reason, "Stressing network");

    h.net.connect(1, addr(0));
    h.step(2);
    assert_eq!(h.state(1), ClientState::Empty);
}

#[test]
fn test_banned_address_refused() {
    let mut h = harness(test_config());
    let now = h.at(0);
    h.server.ban_addr(addr(2).ip(), None, "cheating", now);
    h.net.connect(2, addr(2));
    h.step(0);
    assert_eq!(h.state(2), ClientState::Empty);
    assert_eq!(h.net.dropped(), vec![(2, "You have been banned (cheating)".to_string())]);
}

#[test]
fn test_rcon_auth_and_command_list() {
    let mut h = harness(ServerConfig {
        rcon_password: "secret".to_string(),
        ..test_config()
    });
    h.join(0, 0);
    h.net.deliver(0, &rcon_auth("", "wrong"));
    h.net.deliver(0, &rcon_auth("", "secret"));
    h.step(1);

    assert_eq!(
        h.rcon_lines(0),
        vec![
            "Wrong password 1/30.".to_string(),
            "Admin authentication successful. Full remote console access granted.".to_string(),
        ]
    );
    assert!(h.net.sent_to(0).contains(&ServerMessage::RconAuthStatus {
        authed: true,
        cmdlist: true
    }));
    assert_eq!(h.sim().authed, vec![(0, AuthLevel::Admin)]);

    let added = h
        .net
        .sent_to(0)
        .iter()
        .filter(|m| matches!(m, ServerMessage::RconCmdAdd { .. }))
        .count();
    assert_eq!(added, console::COMMANDS.len().min(MAX_CMD_SEND));
}

#[test]
fn test_rcon_too_many_tries_drops() {
    let mut h = harness(ServerConfig {
        rcon_password: "secret".to_string(),
        rcon_max_tries: 2,
        rcon_bantime: 0,
        ..test_config()
    });
    h.join(1, 0);
    h.net.deliver(1, &rcon_auth("", "a"));
    h.net.deliver(1, &rcon_auth("", "b"));
    h.step(1);

    assert_eq!(h.rcon_lines(1), vec!["Wrong password 1/2.", "Wrong password 2/2."]);
    assert_eq!(
        h.net.dropped(),
        vec![(1, "Too many remote console authentication tries".to_string())]
    );
    assert_eq!(h.sim().dropped.len(), 1);
}

#[test]
fn test_rcon_too_many_tries_bans() {
    let mut h = harness(ServerConfig {
        rcon_password: "secret".to_string(),
        rcon_max_tries: 1,
        rcon_bantime: 5,
        ..test_config()
    });
    h.join(1, 0);
    h.net.deliver(1, &rcon_auth("", "a"));
    h.step(1);

    let ban = h.server.bans().check(addr(1).ip(), h.at(1)).unwrap();
    assert_eq!(ban.reason, "Too many remote console authentication tries");
    assert_eq!(ban.remaining(h.at(1)), Some(Duration::from_secs(300)));
}

#[test]
fn test_kick_rules() {
    let mut h = harness(ServerConfig {
        rcon_password: "secret".to_string(),
        rcon_mod_password: "modpw".to_string(),
        ..test_config()
    });
    h.join(0, 0);
    h.join(1, 0);
    assert!(h.server.dummy_join(2, "bot", "", -1));

    h.net.deliver(0, &rcon_auth("", "secret"));
    h.net.deliver(1, &rcon_auth("", "modpw"));
    h.step(1);
    h.net.take_sent();

    h.net.deliver(1, &rcon("kick 0"));
    h.net.deliver(1, &rcon("auth_list"));
    h.net.deliver(0, &rcon("kick 0"));
    h.net.deliver(0, &rcon("kick 2"));
    h.net.deliver(0, &rcon("kick 3"));
    h.net.deliver(0, &rcon("frobnicate"));
    h.step(2);

    assert_eq!(
        h.rcon_lines(1),
        vec!["kick command denied", "Insufficient permissions to execute 'auth_list'."]
    );
    assert_eq!(
        h.rcon_lines(0),
        vec![
            "you can't kick yourself",
            "kick command denied",
            "invalid client id to kick",
            "No such command: frobnicate.",
        ]
    );

    h.net.deliver(0, &rcon("kick 1 spamming chat"));
    h.step(3);
    assert_eq!(h.state(1), ClientState::Empty);
    assert!(h
        .net
        .dropped()
        .contains(&(1, "Kicked (spamming chat)".to_string())));
}

#[test]
fn test_key_removal_logs_out() {
    let mut h = harness(test_config());
    h.join(0, 0);
    assert_eq!(h.server.execute_command("auth_add bob mod hunter2"), vec!["Successfully added key"]);
    h.net.deliver(0, &rcon_auth("bob", "hunter2"));
    h.step(1);
    assert_eq!(h.server.client(0).unwrap().auth_level, AuthLevel::Moderator);

    assert_eq!(h.server.execute_command("auth_remove bob"), vec!["Successfully removed key"]);
    assert_eq!(h.server.client(0).unwrap().auth_level, AuthLevel::None);
    assert!(h.net.sent_to(0).contains(&ServerMessage::RconAuthStatus {
        authed: false,
        cmdlist: false
    }));
    assert_eq!(h.rcon_lines(0).last().unwrap(), "Logged out by key removal.");
    assert_eq!(h.sim().authed, vec![(0, AuthLevel::Moderator), (0, AuthLevel::None)]);
}

#[test]
fn test_status_output() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.net.connect(1, addr(1));
    h.step(0);
    h.server.dummy_join(3, "bot", "", -1);
    h.server.set_client_name(0, "alice");

    let lines = h.server.execute_command("status");
    assert_eq!(
        lines,
        vec![
            "id=0 addr=10.0.0.1:4000 name='alice' score=0 flags=0 dnsbl=none".to_string(),
            "id=1 addr=10.0.0.2:4000 connecting".to_string(),
            "id=3 name='bot' dummy=yes".to_string(),
        ]
    );
}

#[test]
fn test_client_names_unique_and_banned() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.join(1, 0);
    h.server.set_client_name(0, "  alice ");
    h.server.set_client_name(1, "Alice");
    assert_eq!(h.server.client(0).unwrap().name, "alice");
    assert_eq!(h.server.client(1).unwrap().name, "(1)Alice");

    assert_eq!(
        h.server.execute_command("name_ban evil 1 0 impersonation"),
        vec!["added name='evil' distance=1 is_substring=0 reason='impersonation'"]
    );

    // Ready clients are kicked, in-game clients keep their old name
    h.server.set_client_name(1, "evi1");
    assert_eq!(h.server.client(1).unwrap().name, "(1)Alice");

    h.net.connect(2, addr(2));
    h.net.deliver(2, &info());
    h.net.deliver(2, &ClientMessage::Ready);
    h.step(0);
    h.server.set_client_name(2, "EVIL");
    assert_eq!(h.state(2), ClientState::Empty);
    assert!(h
        .net
        .dropped()
        .contains(&(2, "Kicked (your name is banned: impersonation)".to_string())));
}

#[test]
fn test_disconnect_callbacks() {
    let mut h = harness(test_config());
    h.net.connect(0, addr(0));
    h.net.deliver(0, &info());
    h.join(1, 0);
    h.net.disconnect(0, "quit");
    h.net.disconnect(1, "timeout");
    h.step(1);

    assert_eq!(h.state(0), ClientState::Empty);
    assert_eq!(h.state(1), ClientState::Empty);
    assert_eq!(h.sim().dropped, vec![(1, "timeout".to_string())]);
}

#[test]
fn test_rejoin_clears_auth_and_resends_map() {
    let mut h = harness(ServerConfig {
        rcon_password: "secret".to_string(),
        ..test_config()
    });
    h.join(0, 0);
    h.net.deliver(0, &rcon_auth("", "secret"));
    h.step(1);
    h.net.take_sent();

    h.net.push_event(TransportEvent::Rejoined { client: 0 });
    h.step(2);
    let slot = h.server.client(0).unwrap();
    assert_eq!(slot.auth_level, AuthLevel::None);
    assert_eq!(slot.last_acked_snapshot, -1);
    assert!(h
        .net
        .sent_to(0)
        .iter()
        .any(|m| matches!(m, ServerMessage::MapChange { .. })));
}

#[test]
fn test_map_change_resets_clients() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.step(5);
    h.net.take_sent();

    h.server.set_map("dm2");
    h.step(6);

    assert_eq!(h.server.map().unwrap().name(), "dm2");
    assert_eq!(h.server.tick(), 0);
    assert_eq!(h.state(0), ClientState::Connecting);
    assert_eq!((h.sim().inits, h.sim().shutdowns), (2, 1));
    assert!(h.net.sent_to(0).contains(&ServerMessage::MapChange {
        name: "dm2".to_string(),
        crc: crc32fast::hash(&[1; 10]),
        size: 10,
    }));

    // a missing map keeps the current one
    h.server.set_map("missing");
    h.step(6);
    assert_eq!(h.server.config().map, "dm2");
    assert_eq!(h.sim().inits, 2);
}

#[test]
fn test_reload_when_empty_once() {
    let mut h = harness(ServerConfig {
        reload_when_empty: ReloadWhenEmpty::Once,
        ..test_config()
    });
    let iteration = h.step(1);
    assert!(!iteration.active);
    h.step(2);
    h.step(3);
    assert_eq!(h.sim().inits, 2);
    assert_eq!(h.server.config().reload_when_empty, ReloadWhenEmpty::Off);
}

#[test]
fn test_shutdown_when_empty() {
    let mut h = harness(ServerConfig {
        shutdown_when_empty: true,
        ..test_config()
    });
    let iteration = h.step(1);
    assert!(!h.server.is_running());

    let now = h.at(1);
    h.server.wait(iteration, now);
    assert_eq!(h.net.waits(), vec![Duration::from_millis(IDLE_WAIT_MS)]);
}

#[test]
fn test_simulation_fault_stops_server() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.server.simulation_mut().fail_at = Some(3);
    h.step(5);

    assert_eq!(h.sim().ticks, vec![1, 2, 3]);
    assert!(!h.server.is_running());
    let result = h.server.finish();
    assert!(matches!(result, Err(ServerError::SimulationFault(ref reason)) if reason == "simulation fault"));
    assert_eq!(h.net.dropped(), vec![(0, "simulation fault".to_string())]);
}

#[test]
fn test_id_exhaustion_is_fatal() {
    let mut h = harness_with(test_config(), |server| {
        server.with_snap_ids(SnapIdPool::with_capacity(2, Duration::from_secs(5)))
    });
    h.server.simulation_mut().alloc_each_tick = true;
    let now = h.at(5);
    let result = h.server.run_iteration(now);
    assert!(matches!(
        result,
        Err(ServerError::IdPool(IdPoolError::Exhausted { capacity: 2 }))
    ));
}

#[test]
fn test_dnsbl_blacklisted_is_banned() {
    let mut h = harness_with(
        ServerConfig {
            dnsbl: true,
            dnsbl_ban: true,
            ..test_config()
        },
        |server| server.with_dnsbl(Box::new(FixedResolver(true))),
    );
    h.net.connect(0, addr(0));
    h.step(0);
    assert_eq!(h.server.client(0).unwrap().dnsbl, DnsblState::Pending);

    h.step(1);
    assert_eq!(h.state(0), ClientState::Empty);
    assert_eq!(
        h.net.dropped(),
        vec![(0, "You have been banned (Blacklisted by DNSBL)".to_string())]
    );
}

#[test]
fn test_dnsbl_whitelisted_stays() {
    let mut h = harness_with(
        ServerConfig {
            dnsbl: true,
            dnsbl_ban: true,
            ..test_config()
        },
        |server| server.with_dnsbl(Box::new(FixedResolver(false))),
    );
    h.net.connect(0, addr(0));
    h.step(0);
    h.step(1);
    assert_eq!(h.server.client(0).unwrap().dnsbl, DnsblState::Whitelisted);
}

#[test]
fn test_server_demo_records_snapshot_ticks() {
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let store = MemoryDemoStore(ticks.clone());
    let mut h = harness_with(test_config(), |server| server.with_demo_store(Box::new(store)));

    assert_eq!(h.server.execute_command("record test"), vec!["Recording to 'test'"]);
    h.step_through(1, 4);
    h.server.execute_command("stoprecord");
    h.step_through(5, 6);

    assert_eq!(demo_ticks(&ticks), vec![2, 4]);
    assert!(!h.server.is_server_recording());
}

#[test]
fn test_game_messages_need_ready() {
    let mut h = harness(test_config());
    h.net.connect(0, addr(0));
    h.net.deliver(0, &ClientMessage::Game(vec![1]));
    h.step(0);
    h.net.deliver(0, &info());
    h.net.deliver(0, &ClientMessage::Ready);
    h.net.deliver(0, &ClientMessage::Game(vec![2]));
    h.net.deliver_with(0, &ClientMessage::Game(vec![3]), false);
    h.step(0);
    assert_eq!(h.sim().messages, vec![(0, vec![2])]);
}

#[test]
fn test_client_demo_stops_on_drop() {
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let store = MemoryDemoStore(ticks.clone());
    let mut h = harness_with(test_config(), |server| server.with_demo_store(Box::new(store)));

    assert!(h.server.start_client_record(0, "early").is_err());
    h.join(0, 0);
    h.server.start_client_record(0, "pov").unwrap();
    h.step_through(1, 20);
    h.net.disconnect(0, "quit");
    h.step_through(21, 30);

    // Init rate: one snapshot every ten ticks
    assert_eq!(*ticks.lock(), vec![(10, 1), (20, 1)]);
}

#[test]
fn test_client_demo_is_sanitized() {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let store = MemoryDemoStore(frames.clone());
    let mut h = harness_with(test_config(), |server| server.with_demo_store(Box::new(store)));

    h.join(0, 0);
    h.server.simulation_mut().strip_demo = true;
    h.server.start_client_record(0, "pov").unwrap();
    h.step_through(1, 10);

    assert_eq!(*frames.lock(), vec![(10, 0)]);
    // the client itself still got the full snapshot
    assert!(h
        .net
        .sent_to(0)
        .iter()
        .any(|m| matches!(m, ServerMessage::SnapSingle { tick: 10, .. })));
}

#[test]
fn test_map_reload_releases_snap_ids() {
    let net = LoopbackTransport::new();
    let maps = MemoryMapSource::new().with_map("dm1", vec![7; 2000]);
    let mut server = Server::new(test_config(), SandboxSimulation::new(), net.clone(), Box::new(maps));
    let t0 = Instant::now();
    server.start(t0).unwrap();

    net.connect(0, addr(0));
    net.deliver(
        0,
        &ClientMessage::Info {
            version: NET_VERSION.to_string(),
            password: String::new(),
        },
    );
    net.deliver(0, &ClientMessage::Ready);
    net.deliver(0, &ClientMessage::EnterGame);
    server.run_iteration(t0 + Duration::from_millis(1)).unwrap();
    assert_eq!(server.snap_ids().in_use(), 1);

    for round in 1..=3u64 {
        let now = t0 + Duration::from_secs(round);
        server.request_map_reload();
        server.run_iteration(now).unwrap();
        assert_eq!(server.client_state(0), ClientState::Connecting);
        assert_eq!(server.snap_ids().in_use(), 0);

        net.deliver(0, &ClientMessage::Ready);
        net.deliver(0, &ClientMessage::EnterGame);
        server.run_iteration(now + Duration::from_millis(1)).unwrap();
        assert_eq!(server.simulation().player_count(), 1);
        assert_eq!(server.snap_ids().in_use(), 1);
    }
}

#[test]
fn test_expired_bans_are_dropped() {
    let mut h = harness(test_config());
    let now = h.at(0);
    h.server.ban_addr(addr(1).ip(), Some(Duration::from_secs(1)), "spam", now);
    h.step(1);
    assert_eq!(h.server.bans().len(), 1);

    h.step(60);
    assert!(h.server.bans().is_empty());
    h.net.connect(1, addr(1));
    h.step(61);
    assert_eq!(h.state(1), ClientState::Auth);
}

#[test]
fn test_unban_command() {
    let mut h = harness(test_config());
    let now = h.at(0);
    h.server.ban_addr(addr(2).ip(), None, "cheating", now);

    assert_eq!(h.server.execute_command("unban 10.0.0.3"), vec!["unbanned 10.0.0.3"]);
    assert!(h.server.bans().is_empty());
    assert_eq!(
        h.server.execute_command("unban 10.0.0.3:4000"),
        vec!["10.0.0.3 is not banned"]
    );
    assert_eq!(h.server.execute_command("unban nowhere"), vec!["invalid address 'nowhere'"]);
}

#[test]
fn test_shutdown_reason_reaches_clients() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.server.execute_command("shutdown maintenance window");
    assert!(!h.server.is_running());

    h.server.finish().unwrap();
    assert_eq!(
        h.net.dropped(),
        vec![(0, "Server shutdown (maintenance window)".to_string())]
    );
}

#[test]
fn test_plain_shutdown_reason() {
    let mut h = harness(test_config());
    h.join(0, 0);
    h.server.execute_command("shutdown");
    h.server.finish().unwrap();
    assert_eq!(h.net.dropped(), vec![(0, "Server shutdown".to_string())]);
}
