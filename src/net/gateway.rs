//! TCP gateway: the transport adapter in front of the engine.
//!
//! One reader and one writer task per connection. The reader decodes
//! length-prefixed frames into client messages and dispatches them to the
//! engine; decode and validation failures are logged and discarded, never
//! fatal. The writer drains the session's outbound queue onto the socket.
//! Only transport errors or liveness expiry end a session.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::net::framing::{read_frame, write_frame, FramingError};
use crate::net::protocol::{check_semantics, decode, ClientMessage, ServerMessage};
use crate::sim::engine::Engine;
use crate::sim::intent::MovementIntent;
use crate::util::vec2::Vec2;
use crate::world::entity::SessionId;

/// Accepting side of the gateway.
pub struct Gateway {
    engine: Engine,
    listener: TcpListener,
}

impl Gateway {
    pub async fn bind(engine: Engine, addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("gateway listening on {}", addr);
        Ok(Self { engine, listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the surrounding task is cancelled.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let engine = self.engine.clone();
            tokio::spawn(async move {
                handle_connection(engine, stream, peer).await;
            });
        }
    }
}

async fn handle_connection(engine: Engine, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, "set_nodelay failed: {}", e);
    }
    let (read_half, write_half) = stream.into_split();

    let (session, outbound) = engine.connect_session();
    debug!(%peer, %session, "connection opened");

    let writer = tokio::spawn(run_writer(engine.clone(), session, write_half, outbound));
    run_reader(&engine, session, read_half, peer).await;

    // Reader done: transport closed or errored. The tick reaps the
    // session (and closes its queue, ending the writer) at the next
    // boundary.
    engine.disconnect_session(session);
    let _ = writer.await;
    debug!(%peer, %session, "connection closed");
}

async fn run_writer(
    engine: Engine,
    session: SessionId,
    mut socket: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(payload) = outbound.recv().await {
        match write_frame(&mut socket, &payload).await {
            Ok(()) => {
                engine
                    .metrics()
                    .messages_sent
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(%session, "write failed: {}", e);
                break;
            }
        }
    }
}

async fn run_reader(engine: &Engine, session: SessionId, mut socket: OwnedReadHalf, peer: SocketAddr) {
    loop {
        match read_frame(&mut socket).await {
            Ok(frame) => {
                engine
                    .metrics()
                    .messages_received
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(reply) = handle_frame(engine, session, &frame) {
                    engine.send_to(session, &reply);
                }
            }
            Err(FramingError::FrameTooLarge(size, max)) => {
                // Oversized frames are discarded without teardown.
                warn!(%peer, %session, "oversized frame ({} > {}), discarded", size, max);
            }
            Err(FramingError::ConnectionClosed) => {
                debug!(%peer, %session, "connection closed by peer");
                break;
            }
            Err(FramingError::Io(e)) => {
                debug!(%peer, %session, "read error: {}", e);
                break;
            }
        }
    }
}

/// Decode and dispatch one inbound frame. Returns the direct reply, if
/// any; AOI broadcasts and corrections flow from the tick instead.
fn handle_frame(engine: &Engine, session: SessionId, frame: &[u8]) -> Option<ServerMessage> {
    let message: ClientMessage = match decode(frame) {
        Ok(message) => message,
        Err(e) => {
            engine
                .metrics()
                .decode_errors
                .fetch_add(1, Ordering::Relaxed);
            debug!(%session, "undecodable frame: {}", e);
            return None;
        }
    };

    if let Err(e) = check_semantics(&message) {
        engine
            .metrics()
            .validation_errors
            .fetch_add(1, Ordering::Relaxed);
        debug!(%session, "invalid message: {}", e);
        return None;
    }

    match message {
        ClientMessage::Spawn(request) => {
            let reply = match engine.spawn_entity(&request.kind, request.x, request.y, Some(session))
            {
                Ok(entity) => ServerMessage::SpawnResponse {
                    success: true,
                    entity_id: entity.id,
                    error: String::new(),
                    x: entity.position.x,
                    y: entity.position.y,
                },
                Err(e) => {
                    debug!(%session, "spawn refused: {}", e);
                    ServerMessage::SpawnResponse {
                        success: false,
                        entity_id: 0,
                        error: e.to_string(),
                        x: request.x,
                        y: request.y,
                    }
                }
            };
            Some(reply)
        }
        ClientMessage::Movement(delta) => {
            // A session only ever steers its own entity.
            match engine.session_entity(session) {
                Some(owned) if owned == delta.entity_id => {
                    engine.record_session_sequence(session, delta.sequence);
                    let intent = MovementIntent {
                        entity_id: delta.entity_id,
                        sequence: delta.sequence,
                        delta: Vec2::new(delta.dx as f64, delta.dy as f64),
                        timestamp_ms: delta.timestamp_ms,
                    };
                    if let Err(e) = engine.process_movement_intent(intent) {
                        debug!(%session, "intent shed: {}", e);
                    }
                }
                _ => {
                    engine
                        .metrics()
                        .validation_errors
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(
                        %session,
                        entity = delta.entity_id,
                        "movement for entity not owned by session"
                    );
                }
            }
            None
        }
        ClientMessage::Heartbeat { client_id } => {
            engine.touch_session(session);
            Some(ServerMessage::Heartbeat { client_id })
        }
    }
}
