//! Per-connection relay task

use expose_proto::{ConnectionId, RelayMessage};
use std::future::Future;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state::{ConnectionEvent, ConnectionState};

/// Read buffer size for socket reads
pub const BUFFER_SIZE: usize = 8192;

/// Commands buffered per connection before `write` waits
pub const COMMAND_CAPACITY: usize = 256;

/// Instructions from the control channel to a connection task
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Bytes from a `tcp:data` frame
    Write(Vec<u8>),
    /// Peer sent `tcp:close`
    Close,
}

/// Owner's handle to a running connection task
pub struct ConnectionHandle {
    commands: mpsc::Sender<ConnectionCommand>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Start relaying an already-connected socket
    pub fn spawn(
        id: ConnectionId,
        stream: TcpStream,
        outbound: mpsc::Sender<RelayMessage>,
        finished: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        Self::spawn_with(id, async move { Ok(stream) }, outbound, finished)
    }

    /// Start relaying a socket that is still being established.
    ///
    /// Commands received before `connect` resolves are queued and applied in
    /// order once the socket is up. A failed `connect` emits `tcp:close`.
    pub fn spawn_with<F>(
        id: ConnectionId,
        connect: F,
        outbound: mpsc::Sender<RelayMessage>,
        finished: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self
    where
        F: Future<Output = io::Result<TcpStream>> + Send + 'static,
    {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = tokio::spawn(async move {
            run(id, connect, outbound, command_rx).await;
            let _ = finished.send(id);
        });

        Self { commands, task }
    }

    /// Queue bytes for the socket, waiting while the queue is full.
    /// Returns false if the task has already ended.
    pub async fn write(&self, data: Vec<u8>) -> bool {
        self.commands.send(ConnectionCommand::Write(data)).await.is_ok()
    }

    /// Ask the task to end the socket without emitting `tcp:close`.
    /// Bytes queued before the close are written first.
    pub async fn close(&self) {
        let _ = self.commands.send(ConnectionCommand::Close).await;
    }

    /// Destroy the socket immediately and wait until it has been dropped
    pub async fn destroy(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn run<F>(
    id: ConnectionId,
    connect: F,
    outbound: mpsc::Sender<RelayMessage>,
    mut commands: mpsc::Receiver<ConnectionCommand>,
) where
    F: Future<Output = io::Result<TcpStream>>,
{
    let mut state = ConnectionState::Admitted;

    let stream = match connect.await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Connection {} could not be established: {}", id, e);
            finish(id, state, ConnectionEvent::LocalFailed, &outbound).await;
            return;
        }
    };

    state = match state.on(ConnectionEvent::Started) {
        Ok((next, _)) => next,
        Err(e) => {
            warn!("Connection {}: {}", id, e);
            return;
        }
    };

    let (mut reader, mut writer) = stream.into_split();

    // Each direction runs on its own so a full `outbound` never stops queued
    // writes from draining into the socket.
    let event = tokio::select! {
        event = socket_to_channel(id, &mut reader, &outbound) => event,
        event = channel_to_socket(id, &mut commands, &mut writer) => event,
    };

    let _ = writer.shutdown().await;
    finish(id, state, event, &outbound).await;
}

async fn socket_to_channel(
    id: ConnectionId,
    reader: &mut OwnedReadHalf,
    outbound: &mpsc::Sender<RelayMessage>,
) -> ConnectionEvent {
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!("Connection {} reached EOF", id);
                return ConnectionEvent::LocalClosed;
            }
            Ok(n) => {
                let frame = RelayMessage::TcpData {
                    id,
                    data: buffer[..n].to_vec(),
                };
                if outbound.send(frame).await.is_err() {
                    debug!("Control channel gone, dropping connection {}", id);
                    return ConnectionEvent::RemoteClosed;
                }
            }
            Err(e) => {
                debug!("Read error on connection {}: {}", id, e);
                return ConnectionEvent::LocalFailed;
            }
        }
    }
}

async fn channel_to_socket(
    id: ConnectionId,
    commands: &mut mpsc::Receiver<ConnectionCommand>,
    writer: &mut OwnedWriteHalf,
) -> ConnectionEvent {
    loop {
        match commands.recv().await {
            Some(ConnectionCommand::Write(data)) => {
                if let Err(e) = writer.write_all(&data).await {
                    debug!("Write error on connection {}: {}", id, e);
                    return ConnectionEvent::LocalFailed;
                }
            }
            Some(ConnectionCommand::Close) | None => return ConnectionEvent::RemoteClosed,
        }
    }
}

async fn finish(
    id: ConnectionId,
    state: ConnectionState,
    event: ConnectionEvent,
    outbound: &mpsc::Sender<RelayMessage>,
) {
    let (next, emit_close) = match state.on(event) {
        Ok(transition) => transition,
        Err(e) => {
            warn!("Connection {}: {}", id, e);
            return;
        }
    };

    if emit_close {
        let _ = outbound.send(RelayMessage::TcpClose { id }).await;
    }

    if let Ok((closed, _)) = next.on(ConnectionEvent::Finished) {
        debug!("Connection {} {}", id, closed);
    }
}
