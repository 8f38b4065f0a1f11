//! Relay side of one control channel
//!
//! A [`TunnelSession`] owns every lease and public connection created through a
//! single control channel. It is driven by two channels: decoded frames from the
//! agent arrive on `inbound`, and everything the relay wants to send goes out on
//! `outbound`. When `inbound` closes, the session tears down all of its state.

use expose_connection::ConnectionHandle;
use expose_proto::{ConnectionId, RelayMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::listener_tracker::ListenerTracker;
use crate::relay::{Lease, LeaseRequest, Relay};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Sent by listener tasks back to the session
enum SessionEvent {
    Admitted {
        port: u16,
        stream: TcpStream,
        peer: SocketAddr,
    },
}

pub struct TunnelSession {
    session_id: String,
    principal: String,
    relay: Arc<Relay>,
    outbound: mpsc::Sender<RelayMessage>,
    leases: HashMap<u16, Lease>,
    listeners: ListenerTracker,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    next_connection_id: u32,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    finished_tx: mpsc::UnboundedSender<ConnectionId>,
    finished_rx: mpsc::UnboundedReceiver<ConnectionId>,
}

impl TunnelSession {
    pub fn new(relay: Arc<Relay>, principal: String, outbound: mpsc::Sender<RelayMessage>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();

        Self {
            session_id: Uuid::new_v4().to_string(),
            principal,
            relay,
            outbound,
            leases: HashMap::new(),
            listeners: ListenerTracker::new(),
            connections: HashMap::new(),
            next_connection_id: 1,
            events_tx,
            events_rx,
            finished_tx,
            finished_rx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Process the control channel until `inbound` closes, then tear down.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<RelayMessage>) {
        info!(
            "Control session {} started for {}",
            self.session_id, self.principal
        );

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        debug!("Control channel for session {} closed", self.session_id);
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                Some(id) = self.finished_rx.recv() => {
                    if self.connections.remove(&id).is_some() {
                        debug!("Connection {} removed from session {}", id, self.session_id);
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle_message(&mut self, message: RelayMessage) {
        match message {
            RelayMessage::Expose {
                port,
                secret,
                alias,
            } => self.expose(port, secret, alias).await,
            RelayMessage::TcpData { id, data } => match self.connections.get(&id) {
                Some(connection) => {
                    if !connection.write(data).await {
                        debug!("Connection {} already finished, dropping data", id);
                    }
                }
                None => debug!("Data for unknown connection {}, ignoring", id),
            },
            RelayMessage::TcpClose { id } => match self.connections.get(&id) {
                // Stays tracked until the task reports it has finished
                Some(connection) => connection.close().await,
                None => debug!("Close for unknown connection {}, ignoring", id),
            },
            other => {
                warn!(
                    "Unexpected {} from agent on session {}",
                    other.event_name(),
                    self.session_id
                );
            }
        }
    }

    async fn expose(&mut self, local_port: u16, secret: Option<String>, alias: Option<String>) {
        let request = LeaseRequest {
            local_port,
            secret,
            alias,
        };

        let reply = match self.relay.lease(request).await {
            Ok((lease, listener)) => {
                let handle = spawn_listener(
                    self.relay.clone(),
                    lease.port,
                    listener,
                    self.events_tx.clone(),
                );
                self.listeners.register(lease.port, handle);

                info!(
                    "Exposed local port {} at {} (alias {}, session {})",
                    lease.local_port, lease.url, lease.alias, self.session_id
                );

                let reply = RelayMessage::Exposed {
                    port: lease.local_port,
                    url: lease.url.clone(),
                    secret: lease.secret.clone(),
                    alias: lease.alias.clone(),
                };
                self.leases.insert(lease.port, lease);
                reply
            }
            Err(e) => {
                warn!("Could not expose local port {}: {}", local_port, e);
                RelayMessage::ExposeRejected {
                    port: local_port,
                    reason: e.to_string(),
                }
            }
        };

        if self.outbound.send(reply).await.is_err() {
            debug!("Control channel closed before reply was sent");
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Admitted { port, stream, peer } => {
                if !self.leases.contains_key(&port) {
                    debug!("Port {} no longer leased, dropping {}", port, peer);
                    return;
                }

                let id = self.mint_connection_id();

                if self
                    .outbound
                    .send(RelayMessage::TcpConnection { id })
                    .await
                    .is_err()
                {
                    debug!("Control channel closed, dropping {}", peer);
                    return;
                }

                info!(
                    "Connection {} from {} on port {} (session {})",
                    id, peer, port, self.session_id
                );

                let connection = ConnectionHandle::spawn(
                    id,
                    stream,
                    self.outbound.clone(),
                    self.finished_tx.clone(),
                );
                self.connections.insert(id, connection);
            }
        }
    }

    /// Next id not held by a live connection. Counts from 1 and skips 0 on wrap.
    fn mint_connection_id(&mut self) -> ConnectionId {
        loop {
            let id = ConnectionId(self.next_connection_id);
            self.next_connection_id = self.next_connection_id.wrapping_add(1).max(1);
            if !self.connections.contains_key(&id) {
                return id;
            }
        }
    }

    async fn shutdown(mut self) {
        let ports: Vec<u16> = self.leases.keys().copied().collect();
        for port in ports {
            self.listeners.unregister(port).await;
            if let Some(lease) = self.leases.remove(&port) {
                self.relay.release(&lease);
                info!("Released port {} ({})", lease.port, lease.alias);
            }
        }

        let connections = self.connections.len();
        for (_, connection) in self.connections.drain() {
            connection.destroy().await;
        }

        info!(
            "Control session {} closed, {} connection(s) destroyed",
            self.session_id, connections
        );
    }
}

/// Accept loop for one leased port.
///
/// Peers not on the port's allow-list are closed immediately without notifying
/// the agent.
fn spawn_listener(
    relay: Arc<Relay>,
    port: u16,
    listener: TcpListener,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if !relay.allow_lists().is_allowed(port, peer.ip()) {
                        info!("Rejected {} on port {}: not on allow list", peer, port);
                        drop(stream);
                        continue;
                    }

                    debug!("Accepted {} on port {}", peer, port);
                    if events
                        .send(SessionEvent::Admitted { port, stream, peer })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to accept on port {}: {}", port, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayConfig;

    fn session() -> TunnelSession {
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        let (outbound, _) = mpsc::channel(1);
        TunnelSession::new(relay, "1".to_string(), outbound)
    }

    fn idle_connection(session: &TunnelSession, id: ConnectionId) -> ConnectionHandle {
        ConnectionHandle::spawn_with(
            id,
            std::future::pending::<std::io::Result<TcpStream>>(),
            session.outbound.clone(),
            session.finished_tx.clone(),
        )
    }

    #[tokio::test]
    async fn test_connection_ids_count_from_one() {
        let mut session = session();
        assert_eq!(session.mint_connection_id(), ConnectionId(1));
        assert_eq!(session.mint_connection_id(), ConnectionId(2));
    }

    #[tokio::test]
    async fn test_wrapped_counter_skips_live_ids() {
        let mut session = session();
        for id in [1, 2] {
            let connection = idle_connection(&session, ConnectionId(id));
            session.connections.insert(ConnectionId(id), connection);
        }
        session.next_connection_id = u32::MAX;

        assert_eq!(session.mint_connection_id(), ConnectionId(u32::MAX));
        assert_eq!(session.mint_connection_id(), ConnectionId(3));

        for (_, connection) in session.connections.drain() {
            connection.destroy().await;
        }
    }
}
