//! A listen-server session in one process: a host that also plays, and two
//! remote clients connected over the in-process transport.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example integrated_session -p ember-engine

use std::collections::BTreeMap;

use ember_engine::prelude::*;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Game types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Position {
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Velocity {
    dx: f64,
    dy: f64,
}

fn register(core: &mut Core) -> ViewTypeId {
    let position = core.register_component::<Position>("position");
    let velocity = core.register_component::<Velocity>("velocity");
    core.register_view_type("mover", &[position, velocity])
}

fn movement(core: &mut Core, view: ViewRef, dt: f64) -> Result<(), EcsError> {
    let Some(entity) = core.view_entity(view) else {
        return Ok(());
    };
    let Some(velocity) = core.get_component::<Velocity>(entity).cloned() else {
        return Ok(());
    };
    core.modify_component::<Position, _>(entity, |p| {
        p.x += velocity.dx * dt;
        p.y += velocity.dy * dt;
    })
}

fn spawn_avatar(
    core: &mut Core,
    mover: ViewTypeId,
    owner: ConnectionId,
    x: f64,
) -> Result<EntityId, EcsError> {
    let entity = core.create_networked_entity()?;
    core.add_component(entity, Position { x, y: 0.0 })?;
    core.add_component(entity, Velocity { dx: 1.0, dy: 0.5 })?;
    core.add_view(entity, mover)?;
    core.set_owner(entity, Some(owner))?;
    Ok(entity)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

fn pump_all(host: &mut IntegratedApp, clients: &mut [&mut ClientApp]) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    for _ in 0..8 {
        events.extend(host.pump());
        for client in clients.iter_mut() {
            client.pump();
        }
    }
    events
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let config = EngineConfig::from_json_str(
        r#"{
            "fixed_dt": 0.05,
            "auth": { "rsa_bits": 1024 },
            "disconnect_policy": "destroy"
        }"#,
    )?;
    let bits = config.auth.rsa_bits;

    let (hub, transport) = MemoryHub::new();
    let mut host = IntegratedApp::new(
        config.clone(),
        Box::new(transport),
        KeyPair::generate(bits)?,
        MemoryIdentityStore::new(),
        "host",
        KeyPair::generate(bits)?,
    )?;
    let mover = register(host.core_mut());
    host.tick_loop_mut().add_system("movement", mover, movement);

    let mut alice = ClientApp::new(
        config.clone(),
        Box::new(hub.connect()),
        "alice",
        KeyPair::generate(bits)?,
    );
    register(alice.core_mut());
    let mut bob = ClientApp::new(config, Box::new(hub.connect()), "bob", KeyPair::generate(bits)?);
    register(bob.core_mut());

    // Every player that logs in gets an avatar.
    let mut avatars = BTreeMap::new();
    let mut next_x = 0.0;
    for event in pump_all(&mut host, &mut [&mut alice, &mut bob]) {
        if let ServerEvent::ClientAuthenticated {
            connection,
            user_id,
            ..
        } = event
        {
            let avatar = host.replicate(|core| spawn_avatar(core, mover, connection, next_x))?;
            next_x += 10.0;
            println!("{user_id} joined on {connection}, avatar {avatar:?}");
            avatars.insert(user_id, avatar);
        }
    }
    pump_all(&mut host, &mut [&mut alice, &mut bob]);

    for _ in 0..20 {
        host.tick()?;
        pump_all(&mut host, &mut [&mut alice, &mut bob]);
    }

    // Alice steers her own avatar; the host forwards the change to Bob.
    if let Some(&avatar) = avatars.get("alice") {
        let network_id = host.core().entity(avatar).and_then(|r| r.network_id);
        if let Some(local) = network_id.and_then(|n| alice.core().entity_by_network_id(n)) {
            alice.replicate(|core| core.set_component(local, Velocity { dx: -2.0, dy: 0.0 }))?;
        }
    }
    pump_all(&mut host, &mut [&mut alice, &mut bob]);

    bob.disconnect();
    for event in pump_all(&mut host, &mut [&mut alice]) {
        if let ServerEvent::ClientDisconnected {
            user_id, released, ..
        } = event
        {
            println!(
                "{} left, {} entities released",
                user_id.unwrap_or_default(),
                released.len()
            );
        }
    }

    println!(
        "host: {} entities after {} ticks ({:.2}s)",
        host.core().entity_count(),
        host.tick_loop().tick_count(),
        host.tick_loop().sim_time()
    );
    println!("host  state {}", host.core().state_hash()?);
    println!("alice state {}", alice.core().state_hash()?);
    Ok(())
}
