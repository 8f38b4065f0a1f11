//! Agent side of the control channel
//!
//! The agent asks the relay to expose one local port, registers its allow-list
//! once the lease is granted, and dials the local service for every
//! `tcp:connection` the relay announces. When the control channel ends, every
//! local socket is destroyed.

use expose_connection::ConnectionHandle;
use expose_proto::{decode, encode, ConnectionId, RelayMessage};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::allow_list::AllowListRegistrar;
use crate::config::{public_port_from_url, AgentConfig};
use crate::error::AgentError;

/// Buffered outbound frames
const CHANNEL_CAPACITY: usize = 256;

/// Attempts per allow-list registration
const REGISTRATION_ATTEMPTS: u32 = 3;
const REGISTRATION_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A lease granted by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedTunnel {
    pub local_port: u16,
    pub public_port: u16,
    pub url: String,
    pub alias: String,
    pub secret: String,
}

/// Progress notifications for embedders and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Exposed(ExposedTunnel),
    Registered { ip: IpAddr, port: u16 },
    RegistrationFailed { ip: IpAddr, port: u16, reason: String },
}

pub struct Agent {
    config: AgentConfig,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
}

struct ChannelState {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    outbound: mpsc::Sender<RelayMessage>,
    finished: mpsc::UnboundedSender<ConnectionId>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            events: None,
        }
    }

    /// Receive [`AgentEvent`]s on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Connect, expose the local port and relay traffic until the channel ends.
    ///
    /// Returns [`AgentError::Disconnected`] when an established channel is lost.
    pub async fn run(&self) -> Result<(), AgentError> {
        let control_url = self.config.control_url()?;
        let registrar = AllowListRegistrar::new(self.config.allow_list_url()?);

        info!("Connecting to relay {}", self.config.relay_url);
        let (ws, _response) = connect_async(control_url.as_str()).await?;
        info!("Connected to relay {}", self.config.relay_url);

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let mut state = ChannelState {
            connections: HashMap::new(),
            outbound: outbound_tx,
            finished: finished_tx,
        };

        let result = self
            .pump(ws, &registrar, &mut state, outbound_rx, finished_rx)
            .await;

        let open = state.connections.len();
        for (_, connection) in state.connections.drain() {
            connection.destroy().await;
        }
        if open > 0 {
            info!("Closed {} local connection(s)", open);
        }

        result
    }

    async fn pump<S>(
        &self,
        ws: S,
        registrar: &AllowListRegistrar,
        state: &mut ChannelState,
        mut outbound_rx: mpsc::Receiver<RelayMessage>,
        mut finished_rx: mpsc::UnboundedReceiver<ConnectionId>,
    ) -> Result<(), AgentError>
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin
            + Send
            + 'static,
    {
        let (mut sink, mut stream) = ws.split();

        let expose = RelayMessage::Expose {
            port: self.config.local_port,
            secret: self.config.secret.clone(),
            alias: self.config.alias.clone(),
        };
        sink.send(Message::Binary(encode(&expose)?)).await?;
        debug!("Requested expose of local port {}", self.config.local_port);

        // Frames to the relay keep flowing while the read loop waits on a
        // full connection queue
        let mut writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let frame = match encode(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Failed to encode {}: {}", message.event_name(), e);
                        continue;
                    }
                };
                debug!("Sending {}", message.event_name());
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    warn!("Control channel write failed: {}", e);
                    break;
                }
            }
        });

        let result = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let handled = match decode(&data) {
                            Ok(message) => self.handle_message(message, registrar, state).await,
                            Err(e) => Err(e.into()),
                        };
                        if let Err(e) = handled {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        break Err(AgentError::Protocol("unexpected text frame".to_string()));
                    }
                    Some(Ok(Message::Close(_))) | None => break Err(AgentError::Disconnected),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Control channel error: {}", e);
                        break Err(AgentError::Disconnected);
                    }
                },
                _ = &mut writer => break Err(AgentError::Disconnected),
                Some(id) = finished_rx.recv() => {
                    if state.connections.remove(&id).is_some() {
                        debug!("Connection {} finished", id);
                    }
                }
            }
        };

        writer.abort();
        result
    }

    async fn handle_message(
        &self,
        message: RelayMessage,
        registrar: &AllowListRegistrar,
        state: &mut ChannelState,
    ) -> Result<(), AgentError> {
        match message {
            RelayMessage::Exposed {
                port,
                url,
                secret,
                alias,
            } => {
                let public_port = public_port_from_url(&url)?;
                info!("Local port {} exposed at {} (alias {})", port, url, alias);

                for ip in &self.config.allow_ips {
                    self.spawn_registration(registrar.clone(), secret.clone(), *ip, public_port);
                }

                self.emit(AgentEvent::Exposed(ExposedTunnel {
                    local_port: port,
                    public_port,
                    url,
                    alias,
                    secret,
                }));
            }
            RelayMessage::ExposeRejected { port, reason } => {
                error!("Relay rejected expose of port {}: {}", port, reason);
                return Err(AgentError::ExposeRejected { port, reason });
            }
            RelayMessage::TcpConnection { id } => {
                debug!(
                    "Connection {}: dialing {}:{}",
                    id, self.config.local_host, self.config.local_port
                );
                let connect = TcpStream::connect((self.config.local_host.clone(), self.config.local_port));
                let connection = ConnectionHandle::spawn_with(
                    id,
                    connect,
                    state.outbound.clone(),
                    state.finished.clone(),
                );
                state.connections.insert(id, connection);
            }
            RelayMessage::TcpData { id, data } => match state.connections.get(&id) {
                Some(connection) => {
                    if !connection.write(data).await {
                        debug!("Connection {} already finished, dropping data", id);
                    }
                }
                None => debug!("Data for unknown connection {}, ignoring", id),
            },
            RelayMessage::TcpClose { id } => match state.connections.get(&id) {
                Some(connection) => connection.close().await,
                None => debug!("Close for unknown connection {}, ignoring", id),
            },
            RelayMessage::Expose { .. } => {
                warn!("Unexpected expose from relay, ignoring");
            }
        }

        Ok(())
    }

    /// Register one IP in the background. Each IP is retried independently and
    /// a failure does not affect the control channel.
    fn spawn_registration(&self, registrar: AllowListRegistrar, secret: String, ip: IpAddr, port: u16) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut attempt = 1;
            let event = loop {
                match registrar.register(&secret, ip, port).await {
                    Ok(()) => {
                        info!("Added {} to allow list for port {}", ip, port);
                        break AgentEvent::Registered { ip, port };
                    }
                    Err(e) if attempt < REGISTRATION_ATTEMPTS => {
                        debug!(
                            "Registering {} for port {} failed (attempt {}): {}",
                            ip, port, attempt, e
                        );
                        tokio::time::sleep(REGISTRATION_RETRY_DELAY * attempt).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        warn!("Failed to add {} to allow list for port {}: {}", ip, port, e);
                        break AgentEvent::RegistrationFailed {
                            ip,
                            port,
                            reason: e.to_string(),
                        };
                    }
                }
            };
            if let Some(events) = events {
                let _ = events.send(event);
            }
        });
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
