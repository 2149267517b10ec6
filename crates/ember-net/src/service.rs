//! The network service thread.
//!
//! [`ServiceThread::spawn`] moves a [`Transport`] onto its own OS thread. The
//! game thread keeps a [`ServiceHandle`], which is itself a `Transport`:
//! sends become commands on a bounded channel, and transport events come back
//! on an unbounded one. Nothing is shared between the two threads except the
//! channels.

use std::collections::BTreeSet;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::flags::PacketFlags;
use crate::ids::ConnectionId;
use crate::transport::{Transport, TransportEvent, TransportRole};
use crate::NetError;

enum Command {
    Send {
        to: ConnectionId,
        frame: Vec<u8>,
        flags: PacketFlags,
    },
    Close(ConnectionId),
    Shutdown,
}

/// Entry point for starting the service thread.
pub struct ServiceThread;

impl ServiceThread {
    /// Move `transport` onto a dedicated I/O thread.
    pub fn spawn(
        transport: Box<dyn Transport>,
        config: &NetConfig,
    ) -> Result<ServiceHandle, NetError> {
        let role = transport.role();
        let (command_tx, command_rx) = bounded(config.outbound_queue_capacity.max(1));
        let (event_tx, event_rx) = unbounded();
        let interval = config.service_poll_interval();

        let join = std::thread::Builder::new()
            .name("ember-net-service".into())
            .spawn(move || run(transport, command_rx, event_tx, interval))?;

        info!(?role, "network service thread started");
        Ok(ServiceHandle {
            role,
            commands: command_tx,
            events: event_rx,
            connections: BTreeSet::new(),
            join: Some(join),
        })
    }
}

fn run(
    mut transport: Box<dyn Transport>,
    commands: Receiver<Command>,
    events: Sender<TransportEvent>,
    interval: Duration,
) {
    loop {
        let mut next = match commands.recv_timeout(interval) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        while let Some(command) = next {
            match command {
                Command::Send { to, frame, flags } => {
                    if let Err(e) = transport.send(to, frame, flags) {
                        warn!(connection = %to, error = %e, "service thread failed to send frame");
                    }
                }
                Command::Close(id) => transport.close_connection(id),
                Command::Shutdown => {
                    debug!("network service thread shutting down");
                    return;
                }
            }
            next = commands.try_recv().ok();
        }
        for event in transport.poll() {
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

/// Game-thread side of a running service thread.
///
/// The connection list is mirrored from the events seen by
/// [`poll`](Transport::poll), so it lags the I/O thread by at most one poll.
pub struct ServiceHandle {
    role: TransportRole,
    commands: Sender<Command>,
    events: Receiver<TransportEvent>,
    connections: BTreeSet<ConnectionId>,
    join: Option<JoinHandle<()>>,
}

impl Transport for ServiceHandle {
    fn role(&self) -> TransportRole {
        self.role
    }

    fn connections(&self) -> Vec<ConnectionId> {
        self.connections.iter().copied().collect()
    }

    fn send(
        &mut self,
        to: ConnectionId,
        frame: Vec<u8>,
        flags: PacketFlags,
    ) -> Result<(), NetError> {
        let command = Command::Send { to, frame, flags };
        if flags.contains(PacketFlags::NO_DELAY) {
            return match self.commands.try_send(command) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    debug!(connection = %to, "outbound queue full, dropping no-delay frame");
                    Ok(())
                }
                Err(TrySendError::Disconnected(_)) => Err(NetError::ServiceStopped),
            };
        }
        self.commands
            .send(command)
            .map_err(|_| NetError::ServiceStopped)
    }

    fn close_connection(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
        let _ = self.commands.send(Command::Close(id));
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let events: Vec<TransportEvent> = self.events.try_iter().collect();
        for event in &events {
            match event {
                TransportEvent::Connected(id) => {
                    self.connections.insert(*id);
                }
                TransportEvent::Disconnected(id) => {
                    self.connections.remove(id);
                }
                TransportEvent::Frame(_) => {}
            }
        }
        events
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("network service thread panicked");
            }
        }
    }
}
