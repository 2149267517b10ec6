//! Property tests: a client mirrors its server through random sessions.
//!
//! Each step is one server or client mutation, after which both sides are
//! pumped until the in-process transport is idle. The client's state hash
//! must then equal the server's, whatever the client added locally.

use std::sync::OnceLock;

use ember_engine::prelude::*;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Position(i64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Health(u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Score(u32);

#[derive(Debug, Clone)]
enum Step {
    Spawn { owned: bool },
    Move(usize, i8),
    Heal(usize, u32),
    Despawn(usize),
    Score(usize, u32),
    Tick,
    ClientMove(usize, i8),
    ClientScore(usize, u32),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => any::<bool>().prop_map(|owned| Step::Spawn { owned }),
        1 => (any::<usize>(), any::<i8>()).prop_map(|(i, d)| Step::Move(i, d)),
        1 => (any::<usize>(), 0..200u32).prop_map(|(i, hp)| Step::Heal(i, hp)),
        1 => any::<usize>().prop_map(Step::Despawn),
        1 => (any::<usize>(), 0..50u32).prop_map(|(i, s)| Step::Score(i, s)),
        1 => Just(Step::Tick),
        2 => (any::<usize>(), any::<i8>()).prop_map(|(i, d)| Step::ClientMove(i, d)),
        2 => (any::<usize>(), 0..50u32).prop_map(|(i, s)| Step::ClientScore(i, s)),
    ]
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

fn keys() -> &'static (KeyPair, KeyPair) {
    static KEYS: OnceLock<(KeyPair, KeyPair)> = OnceLock::new();
    KEYS.get_or_init(|| {
        (
            KeyPair::generate(1024).unwrap(),
            KeyPair::generate(1024).unwrap(),
        )
    })
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.auth.rsa_bits = 1024;
    config
}

fn register(core: &mut Core) -> ViewTypeId {
    let position = core.register_component::<Position>("position");
    core.register_component::<Health>("health");
    core.register_component::<Score>("score");
    core.register_view_type("movable", &[position])
}

fn drift(core: &mut Core, view: ViewRef, _dt: f64) -> Result<(), EcsError> {
    let entity = core.view_entity(view).ok_or(EcsError::StaleView { view })?;
    core.modify_component::<Position, _>(entity, |p| p.0 += 1)
}

fn settle(server: &mut ServerApp, alice: &mut ClientApp) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    for _ in 0..12 {
        events.extend(server.pump());
        alice.pump();
    }
    events
}

struct Session {
    _hub: MemoryHub,
    server: ServerApp,
    alice: ClientApp,
    alice_conn: ConnectionId,
    movable: ViewTypeId,
}

impl Session {
    fn start() -> Self {
        let (server_keys, alice_keys) = keys();
        let (hub, transport) = MemoryHub::new();
        let mut server = ServerApp::new(
            config(),
            Box::new(transport),
            server_keys.clone(),
            MemoryIdentityStore::new(),
        );
        let movable = register(server.core_mut());
        server.tick_loop_mut().add_system("drift", movable, drift);

        let mut alice = ClientApp::new(config(), Box::new(hub.connect()), "alice", alice_keys.clone());
        register(alice.core_mut());

        let alice_conn = settle(&mut server, &mut alice)
            .into_iter()
            .find_map(|e| match e {
                ServerEvent::ClientAuthenticated { connection, .. } => Some(connection),
                _ => None,
            })
            .unwrap();
        Self {
            _hub: hub,
            server,
            alice,
            alice_conn,
            movable,
        }
    }

    fn pick(entities: Vec<EntityId>, i: usize) -> Option<EntityId> {
        (!entities.is_empty()).then(|| entities[i % entities.len()])
    }

    fn server_entity(&self, i: usize) -> Option<EntityId> {
        let entities = self
            .server
            .core()
            .entities()
            .filter(|r| r.network_id.is_some())
            .map(|r| r.id)
            .collect();
        Self::pick(entities, i)
    }

    fn alice_entity(&self, i: usize, owned: bool) -> Option<EntityId> {
        let entities = self
            .alice
            .core()
            .entities()
            .filter(|r| r.network_id.is_some())
            .filter(|r| !owned || r.owner == Some(ConnectionId::LOCAL))
            .map(|r| r.id)
            .collect();
        Self::pick(entities, i)
    }

    fn run(&mut self, step: &Step) -> Result<(), EngineError> {
        match *step {
            Step::Spawn { owned } => {
                let owner = owned.then_some(self.alice_conn);
                let movable = self.movable;
                self.server.replicate(|core| {
                    let entity = core.create_networked_entity()?;
                    core.add_component(entity, Position(0))?;
                    core.add_component(entity, Health(100))?;
                    core.add_view(entity, movable)?;
                    core.set_owner(entity, owner)?;
                    Ok(())
                })?;
            }
            Step::Move(i, d) => {
                if let Some(e) = self.server_entity(i) {
                    self.server
                        .replicate(|core| core.modify_component::<Position, _>(e, |p| p.0 += i64::from(d)))?;
                }
            }
            Step::Heal(i, hp) => {
                if let Some(e) = self.server_entity(i) {
                    self.server.replicate(|core| core.set_component(e, Health(hp)))?;
                }
            }
            Step::Despawn(i) => {
                if let Some(e) = self.server_entity(i) {
                    self.server.replicate(|core| core.destroy_entity(e))?;
                }
            }
            Step::Score(i, s) => {
                if let Some(e) = self.server_entity(i) {
                    self.server.replicate(|core| core.set_component(e, Score(s)))?;
                }
            }
            Step::Tick => {
                self.server.tick()?;
            }
            Step::ClientMove(i, d) => {
                if let Some(e) = self.alice_entity(i, true) {
                    self.alice
                        .replicate(|core| core.modify_component::<Position, _>(e, |p| p.0 += i64::from(d)))?;
                }
            }
            Step::ClientScore(i, s) => {
                if let Some(e) = self.alice_entity(i, false) {
                    if self.alice.core().get_component::<Score>(e).is_none() {
                        self.alice.replicate(|core| core.add_component(e, Score(s)))?;
                    }
                }
            }
        }
        settle(&mut self.server, &mut self.alice);
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn client_mirrors_server_after_every_step(
        steps in prop::collection::vec(step_strategy(), 1..30),
    ) {
        let mut session = Session::start();
        prop_assert!(session.alice.is_authenticated());

        for step in &steps {
            prop_assert!(session.run(step).is_ok(), "{step:?} failed");
            prop_assert_eq!(
                session.alice.core().state_hash().unwrap(),
                session.server.core().state_hash().unwrap(),
                "diverged after {:?}",
                step
            );
        }
    }
}
