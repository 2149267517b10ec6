//! Network interface tests over the in-process transport.

use std::time::{Duration, Instant};

use ember_net::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Shout {
    text: String,
}

impl Packet for Shout {
    const NAME: &'static str = "Shout";

    fn write(&self, writer: &mut dyn PacketWriter) {
        writer.write_str("text", &self.text);
    }

    fn read(reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            text: reader.read_str("text")?,
        })
    }
}

fn protocol(format: WireFormat) -> Protocol {
    let mut protocol = Protocol::new(format);
    register_auth_packets(&mut protocol);
    protocol.register::<Shout>();
    protocol
}

fn shouts(net: &NetworkInterface, events: &[NetEvent]) -> Vec<(ConnectionId, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            NetEvent::Frame(frame) => {
                let shout: Shout = net.protocol().decode(&frame.bytes).ok()?;
                Some((frame.source, shout.text))
            }
            _ => None,
        })
        .collect()
}

fn connected(events: &[NetEvent]) -> Vec<(ConnectionId, Option<NetworkId>)> {
    events
        .iter()
        .filter_map(|e| match e {
            NetEvent::PeerConnected {
                connection,
                network_id,
            } => Some((*connection, *network_id)),
            _ => None,
        })
        .collect()
}

struct Setup {
    server: NetworkInterface,
    clients: Vec<NetworkInterface>,
    ids: Vec<ConnectionId>,
}

fn setup(count: usize, format: WireFormat) -> Setup {
    let (hub, transport) = MemoryHub::new();
    let mut server = NetworkInterface::new(NetRole::Server, Box::new(transport), protocol(format));
    let mut clients = Vec::new();
    for _ in 0..count {
        let mut client =
            NetworkInterface::new(NetRole::Client, Box::new(hub.connect()), protocol(format));
        let events = client.poll();
        assert_eq!(connected(&events), vec![(ConnectionId::SERVER, None)]);
        clients.push(client);
    }
    let ids = connected(&server.poll())
        .into_iter()
        .map(|(connection, network_id)| {
            assert!(network_id.is_some());
            connection
        })
        .collect();
    Setup {
        server,
        clients,
        ids,
    }
}

#[test]
fn broadcast_skips_excluded_connections() {
    let Setup {
        mut server,
        mut clients,
        ids,
    } = setup(3, WireFormat::Binary);

    let sent = server
        .broadcast(&Shout { text: "hi".into() }, &[ids[1]])
        .unwrap();
    assert_eq!(sent, 2);

    let received: Vec<usize> = clients
        .iter_mut()
        .map(|c| {
            let events = c.poll();
            shouts(c, &events).len()
        })
        .collect();
    assert_eq!(received, vec![1, 0, 1]);
}

#[test]
fn send_to_resolves_network_ids() {
    let Setup {
        mut server,
        mut clients,
        ids,
    } = setup(2, WireFormat::Json);

    let target = server.network_id_for(ids[1]).unwrap();
    assert_eq!(server.connection_for(target), Some(ids[1]));
    assert!(server.send_to(target, &Shout { text: "psst".into() }).unwrap());

    let events = clients[1].poll();
    assert_eq!(
        shouts(&clients[1], &events),
        vec![(ConnectionId::SERVER, "psst".to_string())]
    );
    let events = clients[0].poll();
    assert!(shouts(&clients[0], &events).is_empty());

    // Unknown ids are a logged no-op.
    assert!(!server
        .send_to(NetworkId(999), &Shout { text: "void".into() })
        .unwrap());
}

#[test]
fn frames_from_one_connection_keep_their_order() {
    let Setup {
        mut server,
        mut clients,
        ids,
    } = setup(1, WireFormat::Binary);

    for i in 0..10 {
        clients[0]
            .send_to_server(&Shout {
                text: format!("m{i}"),
            })
            .unwrap();
    }
    let events = server.poll();
    let texts: Vec<String> = shouts(&server, &events)
        .into_iter()
        .map(|(source, text)| {
            assert_eq!(source, ids[0]);
            text
        })
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
    assert_eq!(texts, expected);
}

#[test]
fn closing_a_connection_releases_its_network_id() {
    let Setup {
        mut server,
        mut clients,
        ids,
    } = setup(1, WireFormat::Binary);
    let network_id = server.network_id_for(ids[0]).unwrap();

    server.close_connection(ids[0]);
    let events = server.poll();
    assert!(events.contains(&NetEvent::PeerDisconnected {
        connection: ids[0],
        network_id: Some(network_id),
    }));
    assert_eq!(server.connection_for(network_id), None);
    assert!(!server
        .send_to(network_id, &Shout { text: "gone".into() })
        .unwrap());

    let events = clients[0].poll();
    assert!(events.contains(&NetEvent::PeerDisconnected {
        connection: ConnectionId::SERVER,
        network_id: None,
    }));
}

#[test]
fn greeting_round_trip_over_service_threads() {
    let (hub, transport) = MemoryHub::new();
    let config = NetConfig::default();
    let server_transport = ServiceThread::spawn(Box::new(transport), &config).unwrap();
    let client_transport = ServiceThread::spawn(Box::new(hub.connect()), &config).unwrap();

    let mut server = NetworkInterface::new(
        NetRole::Server,
        Box::new(server_transport),
        protocol(WireFormat::Binary),
    );
    let mut client = NetworkInterface::new(
        NetRole::Client,
        Box::new(client_transport),
        protocol(WireFormat::Binary),
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut greeted = false;
    let mut answered = false;
    while !answered {
        assert!(Instant::now() < deadline, "timed out");
        for event in server.poll() {
            match event {
                NetEvent::PeerConnected { connection, .. } => {
                    server
                        .send(connection, &Shout { text: "welcome".into() })
                        .unwrap();
                }
                NetEvent::Frame(frame) => {
                    let shout: Shout = server.protocol().decode(&frame.bytes).unwrap();
                    assert_eq!(shout.text, "thanks");
                    answered = true;
                }
                NetEvent::PeerDisconnected { .. } => panic!("unexpected disconnect"),
            }
        }
        for event in client.poll() {
            if let NetEvent::Frame(frame) = event {
                let shout: Shout = client.protocol().decode(&frame.bytes).unwrap();
                assert_eq!(shout.text, "welcome");
                assert!(!greeted);
                greeted = true;
                client
                    .send_to_server(&Shout {
                        text: "thanks".into(),
                    })
                    .unwrap();
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(greeted);
}
