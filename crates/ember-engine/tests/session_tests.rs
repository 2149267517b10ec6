//! End-to-end sessions: servers, clients and integrated hosts talking over
//! the in-process transport.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use ember_engine::prelude::*;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Position {
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Health(u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Score(u32);

fn keys(slot: usize) -> &'static KeyPair {
    static KEYS: OnceLock<Vec<KeyPair>> = OnceLock::new();
    &KEYS.get_or_init(|| (0..4).map(|_| KeyPair::generate(1024).unwrap()).collect())[slot]
}

fn server_keys() -> &'static KeyPair {
    keys(0)
}

fn alice_keys() -> &'static KeyPair {
    keys(1)
}

fn bob_keys() -> &'static KeyPair {
    keys(2)
}

fn host_keys() -> &'static KeyPair {
    keys(3)
}

fn config(format: WireFormat) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.auth = AuthConfig {
        token_len: 32,
        rsa_bits: 1024,
    };
    config.net.wire_format = format;
    config
}

/// Every peer registers the same types in the same order.
fn register(core: &mut Core) -> ViewTypeId {
    let position = core.register_component::<Position>("position");
    core.register_component::<Health>("health");
    core.register_component::<Score>("score");
    core.register_view_type("movable", &[position])
}

fn server(config: EngineConfig) -> (MemoryHub, ServerApp) {
    let (hub, transport) = MemoryHub::new();
    let mut server = ServerApp::new(
        config,
        Box::new(transport),
        server_keys().clone(),
        MemoryIdentityStore::new(),
    );
    register(server.core_mut());
    (hub, server)
}

fn client(hub: &MemoryHub, config: EngineConfig, user: &str, keys: &KeyPair) -> ClientApp {
    let mut client = ClientApp::new(config, Box::new(hub.connect()), user, keys.clone());
    register(client.core_mut());
    client
}

/// Pump until the in-process transport has nothing left in flight.
fn settle(server: &mut ServerApp, clients: &mut [&mut ClientApp]) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    for _ in 0..12 {
        events.extend(server.pump());
        for client in clients.iter_mut() {
            client.pump();
        }
    }
    events
}

fn authenticated(events: &[ServerEvent], user: &str) -> ConnectionId {
    events
        .iter()
        .find_map(|e| match e {
            ServerEvent::ClientAuthenticated {
                connection,
                user_id,
                ..
            } if user_id == user => Some(*connection),
            _ => None,
        })
        .unwrap_or_else(|| panic!("{user} did not authenticate: {events:?}"))
}

fn spawn_player(server: &mut ServerApp, owner: Option<ConnectionId>, x: f64) -> (EntityId, NetworkId) {
    let entity = server
        .replicate(|core| {
            let entity = core.create_networked_entity()?;
            core.add_component(entity, Position { x, y: 0.0 })?;
            core.add_component(entity, Health(100))?;
            core.set_owner(entity, owner)?;
            Ok(entity)
        })
        .unwrap();
    let network_id = server.core().entity(entity).unwrap().network_id.unwrap();
    (entity, network_id)
}

fn assert_in_sync(server: &ServerApp, client: &ClientApp) {
    assert_eq!(
        client.core().state_hash().unwrap(),
        server.core().state_hash().unwrap(),
        "client state diverged: {:?} vs {:?}",
        client.core().capture_snapshot().unwrap(),
        server.core().capture_snapshot().unwrap()
    );
}

// ---------------------------------------------------------------------------
// Handshake and catch-up
// ---------------------------------------------------------------------------

#[test]
fn late_joiner_receives_existing_state() {
    for format in [WireFormat::Binary, WireFormat::Json] {
        let (hub, mut server) = server(config(format));
        spawn_player(&mut server, None, 3.0);
        spawn_player(&mut server, None, 4.0);

        let mut alice = client(&hub, config(format), "alice", alice_keys());
        let events = settle(&mut server, &mut [&mut alice]);
        let connection = authenticated(&events, "alice");

        assert!(alice.is_authenticated());
        assert_eq!(alice.network_id(), server.core().peer_network_id(connection));
        assert_eq!(alice.core().entity_count(), 2);
        assert_in_sync(&server, &alice);
    }
}

#[test]
fn client_events_follow_the_handshake() {
    let (hub, mut server) = server(config(WireFormat::Binary));
    let mut alice = client(&hub, config(WireFormat::Binary), "alice", alice_keys());

    let mut seen = Vec::new();
    for _ in 0..6 {
        server.pump();
        seen.extend(alice.pump());
    }

    assert_eq!(seen.first(), Some(&ClientEvent::Connected));
    let network_id = alice.network_id().unwrap();
    assert!(seen.contains(&ClientEvent::Accepted { network_id }));
}

#[test]
fn second_login_with_same_user_is_kicked() {
    let (hub, mut server) = server(config(WireFormat::Binary));
    let mut first = client(&hub, config(WireFormat::Binary), "alice", alice_keys());
    settle(&mut server, &mut [&mut first]);

    let mut second = client(&hub, config(WireFormat::Binary), "alice", alice_keys());
    let events = settle(&mut server, &mut [&mut first, &mut second]);

    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::ClientKicked { reason, .. } if reason.contains("already connected"))));
    assert!(first.is_authenticated());
    assert!(!second.is_authenticated());
    assert!(!second.net().connections().contains(&ConnectionId::SERVER));
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

fn drift(core: &mut Core, view: ViewRef, dt: f64) -> Result<(), EcsError> {
    if let Some(entity) = core.view_entity(view) {
        core.modify_component::<Position, _>(entity, |p| p.x += dt)?;
    }
    Ok(())
}

#[test]
fn tick_changes_reach_authenticated_clients() {
    let (hub, mut server) = server(config(WireFormat::Binary));
    let movable = server.core().views().lookup_by_name("movable").unwrap();
    let (entity, _) = spawn_player(&mut server, None, 0.0);
    server.replicate(|core| core.add_view(entity, movable)).unwrap();
    server.tick_loop_mut().add_system("drift", movable, drift);

    let mut alice = client(&hub, config(WireFormat::Binary), "alice", alice_keys());
    settle(&mut server, &mut [&mut alice]);

    for _ in 0..5 {
        let sent = server.tick().unwrap();
        assert_eq!(sent, 1, "one coalesced update per tick");
        settle(&mut server, &mut [&mut alice]);
    }

    assert_in_sync(&server, &alice);
    let x = server.core().get_component::<Position>(entity).unwrap().x;
    assert!((x - 5.0 / 60.0).abs() < 1e-9);
}

#[test]
fn owned_changes_are_forwarded_to_other_clients() {
    let (hub, mut server) = server(config(WireFormat::Binary));
    let mut alice = client(&hub, config(WireFormat::Binary), "alice", alice_keys());
    let mut bob = client(&hub, config(WireFormat::Binary), "bob", bob_keys());
    let events = settle(&mut server, &mut [&mut alice, &mut bob]);
    let alice_conn = authenticated(&events, "alice");

    let (server_entity, network_id) = spawn_player(&mut server, Some(alice_conn), 0.0);
    settle(&mut server, &mut [&mut alice, &mut bob]);

    let on_alice = alice.core().entity_by_network_id(network_id).unwrap();
    assert_eq!(alice.core().entity(on_alice).unwrap().owner, Some(ConnectionId::LOCAL));

    alice
        .replicate(|core| core.set_component(on_alice, Position { x: 9.0, y: 1.0 }))
        .unwrap();
    settle(&mut server, &mut [&mut alice, &mut bob]);

    assert_eq!(
        server.core().get_component::<Position>(server_entity),
        Some(&Position { x: 9.0, y: 1.0 })
    );
    assert_in_sync(&server, &alice);
    assert_in_sync(&server, &bob);
}

#[test]
fn changes_to_unowned_entities_stay_local() {
    let (hub, mut server) = server(config(WireFormat::Binary));
    let mut alice = client(&hub, config(WireFormat::Binary), "alice", alice_keys());
    let mut bob = client(&hub, config(WireFormat::Binary), "bob", bob_keys());
    let events = settle(&mut server, &mut [&mut alice, &mut bob]);
    let alice_conn = authenticated(&events, "alice");

    let (server_entity, network_id) = spawn_player(&mut server, Some(alice_conn), 0.0);
    settle(&mut server, &mut [&mut alice, &mut bob]);

    let on_bob = bob.core().entity_by_network_id(network_id).unwrap();
    bob.replicate(|core| core.set_component(on_bob, Health(1))).unwrap();
    settle(&mut server, &mut [&mut alice, &mut bob]);

    assert_eq!(server.core().get_component::<Health>(server_entity), Some(&Health(100)));
    assert_in_sync(&server, &alice);
    assert_ne!(
        bob.core().state_hash().unwrap(),
        server.core().state_hash().unwrap()
    );
}

#[test]
fn client_additions_never_shadow_server_objects() {
    let (hub, mut server) = server(config(WireFormat::Binary));
    let mut alice = client(&hub, config(WireFormat::Binary), "alice", alice_keys());
    let events = settle(&mut server, &mut [&mut alice]);
    let alice_conn = authenticated(&events, "alice");

    let (mine, mine_id) = spawn_player(&mut server, Some(alice_conn), 0.0);
    let (theirs, theirs_id) = spawn_player(&mut server, None, 5.0);
    settle(&mut server, &mut [&mut alice]);

    assert!(server.core().is_authoritative());
    assert!(!alice.core().is_authoritative());
    let on_alice = alice.core().entity_by_network_id(mine_id).unwrap();
    let score = alice
        .replicate(|core| core.add_component(on_alice, Score(1)))
        .unwrap();
    assert_eq!(alice.core().storage().network_id(score), None);

    server
        .replicate(|core| core.add_component(theirs, Score(2)))
        .unwrap();
    settle(&mut server, &mut [&mut alice]);

    let mirrored = alice.core().entity_by_network_id(theirs_id).unwrap();
    assert_eq!(alice.core().get_component::<Score>(on_alice), Some(&Score(1)));
    assert_eq!(alice.core().get_component::<Score>(mirrored), Some(&Score(2)));
    assert_eq!(server.core().get_component::<Score>(mine), None);
    assert_in_sync(&server, &alice);
}

#[test]
fn unauthenticated_replication_is_dropped() {
    let format = WireFormat::Binary;
    let (hub, mut server) = server(config(format));
    let (entity, _) = spawn_player(&mut server, None, 0.0);
    let before = server.core().state_hash().unwrap();

    let health = server.core().component_type::<Health>().unwrap();
    let component = server.core().component_ref(entity, health).unwrap();
    let mut packet = ReplicationPacket::new(
        ObjectKind::Component,
        health.0,
        server.core().storage().network_id(component).unwrap(),
        ReplicationAction::Update,
    );
    packet.payload = serde_json::json!(0);

    let mut raw = NetworkInterface::new(
        NetRole::Client,
        Box::new(hub.connect()),
        ember_engine::engine_protocol(format),
    );
    raw.poll();
    raw.send_to_server(&packet).unwrap();
    server.pump();
    server.pump();

    assert_eq!(server.core().state_hash().unwrap(), before);
}

// ---------------------------------------------------------------------------
// Disconnects
// ---------------------------------------------------------------------------

fn released(events: &[ServerEvent], connection: ConnectionId) -> Vec<EntityId> {
    events
        .iter()
        .find_map(|e| match e {
            ServerEvent::ClientDisconnected {
                connection: c,
                released,
                ..
            } if *c == connection => Some(released.clone()),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no disconnect for {connection}: {events:?}"))
}

#[test]
fn departed_clients_entities_are_destroyed_everywhere() {
    let (hub, mut server) = server(config(WireFormat::Binary));
    let mut alice = client(&hub, config(WireFormat::Binary), "alice", alice_keys());
    let mut bob = client(&hub, config(WireFormat::Binary), "bob", bob_keys());
    let events = settle(&mut server, &mut [&mut alice, &mut bob]);
    let alice_conn = authenticated(&events, "alice");

    let (entity, network_id) = spawn_player(&mut server, Some(alice_conn), 0.0);
    spawn_player(&mut server, None, 1.0);
    settle(&mut server, &mut [&mut alice, &mut bob]);
    assert!(bob.core().entity_by_network_id(network_id).is_some());

    alice.disconnect();
    let events = settle(&mut server, &mut [&mut bob]);

    assert_eq!(released(&events, alice_conn), vec![entity]);
    assert!(!server.core().is_alive(entity));
    assert!(bob.core().entity_by_network_id(network_id).is_none());
    assert_eq!(bob.core().entity_count(), 1);
    assert_in_sync(&server, &bob);
    assert_eq!(server.core().peer_network_id(alice_conn), None);
}

#[test]
fn orphan_policy_keeps_entities_without_owner() {
    let mut config = config(WireFormat::Json);
    config.disconnect_policy = DisconnectPolicy::Orphan;
    let (hub, mut server) = server(config.clone());
    let mut alice = client(&hub, config.clone(), "alice", alice_keys());
    let mut bob = client(&hub, config, "bob", bob_keys());
    let events = settle(&mut server, &mut [&mut alice, &mut bob]);
    let alice_conn = authenticated(&events, "alice");

    let (entity, network_id) = spawn_player(&mut server, Some(alice_conn), 0.0);
    settle(&mut server, &mut [&mut alice, &mut bob]);

    drop(alice);
    let events = settle(&mut server, &mut [&mut bob]);

    assert_eq!(released(&events, alice_conn), vec![entity]);
    let record = server.core().entity(entity).unwrap();
    assert_eq!(record.owner, None);
    assert_eq!(record.owner_peer, None);
    let on_bob = bob.core().entity_by_network_id(network_id).unwrap();
    assert_eq!(bob.core().entity(on_bob).unwrap().owner_peer, None);
    assert_in_sync(&server, &bob);
}

#[derive(Debug)]
struct Bogus;

impl Packet for Bogus {
    const NAME: &'static str = "Bogus";

    fn write(&self, _writer: &mut dyn PacketWriter) {}

    fn read(_reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
        Ok(Bogus)
    }
}

#[test]
fn unknown_packet_type_closes_the_connection() {
    let format = WireFormat::Binary;
    let (hub, mut server) = server(config(format));

    let transport = hub.connect();
    let connection = transport.server_side_id();
    let mut protocol = ember_engine::engine_protocol(format);
    protocol.register::<Bogus>();
    let mut raw = NetworkInterface::new(NetRole::Client, Box::new(transport), protocol);
    raw.poll();
    raw.send_to_server(&Bogus).unwrap();

    let events = settle(&mut server, &mut []);
    assert_eq!(released(&events, connection), Vec::<EntityId>::new());

    let disconnected = raw
        .poll()
        .into_iter()
        .any(|e| matches!(e, NetEvent::PeerDisconnected { .. }));
    assert!(disconnected);
}

// ---------------------------------------------------------------------------
// Integrated host
// ---------------------------------------------------------------------------

#[test]
fn integrated_host_logs_in_locally_and_shares_its_core() {
    let format = WireFormat::Binary;
    let (hub, transport) = MemoryHub::new();
    let mut host = IntegratedApp::new(
        config(format),
        Box::new(transport),
        server_keys().clone(),
        MemoryIdentityStore::new(),
        "host",
        host_keys().clone(),
    )
    .unwrap();
    register(host.core_mut());

    let events = host.pump();
    assert_eq!(authenticated(&events, "host"), ConnectionId::LOCAL);
    assert!(host.is_local_authenticated());
    let host_peer = host.local_network_id().unwrap();
    assert_eq!(host.core().peer_network_id(ConnectionId::LOCAL), Some(host_peer));

    let entity = host.spawn_local_entity().unwrap();
    host.replicate(|core| core.add_component(entity, Health(7)))
        .unwrap();

    let mut alice = client(&hub, config(format), "alice", alice_keys());
    for _ in 0..12 {
        host.pump();
        alice.pump();
    }

    assert!(alice.is_authenticated());
    assert_in_sync(host.app(), &alice);
    let network_id = host.core().entity(entity).unwrap().network_id.unwrap();
    let on_alice = alice.core().entity_by_network_id(network_id).unwrap();
    let record = alice.core().entity(on_alice).unwrap();
    assert_eq!(record.owner_peer, Some(host_peer));
    assert_eq!(record.owner, None);
}

// ---------------------------------------------------------------------------
// Service threads
// ---------------------------------------------------------------------------

#[test]
fn session_runs_over_service_threads() {
    let format = WireFormat::Binary;
    let config = config(format);
    let (hub, transport) = MemoryHub::new();
    let server_io = ServiceThread::spawn(Box::new(transport), &config.net).unwrap();
    let mut server = ServerApp::new(
        config.clone(),
        Box::new(server_io),
        server_keys().clone(),
        MemoryIdentityStore::new(),
    );
    register(server.core_mut());
    spawn_player(&mut server, None, 2.0);

    let client_io = ServiceThread::spawn(Box::new(hub.connect()), &config.net).unwrap();
    let mut alice = ClientApp::new(config, Box::new(client_io), "alice", alice_keys().clone());
    register(alice.core_mut());

    let deadline = Instant::now() + Duration::from_secs(10);
    while alice.core().entity_count() == 0 {
        assert!(Instant::now() < deadline, "client never caught up");
        server.pump();
        alice.pump();
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(alice.is_authenticated());
    assert_in_sync(&server, &alice);
}
