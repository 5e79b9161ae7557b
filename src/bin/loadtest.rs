//! Synthetic-client load generator.
//!
//! Connects N clients, spawns an entity for each, then sends randomized
//! movement at a fixed cadence while counting the snapshots, corrections
//! and despawns each client receives. Knobs come from the environment:
//! ADDR, CLIENTS, DURATION_SECS, MOVE_INTERVAL_MS.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, timeout};
use tracing::{info, warn, Level};

use driftfield::net::framing::{read_frame, write_frame};
use driftfield::net::protocol::{
    decode, encode, ClientMessage, MovementDelta, ServerMessage, SpawnRequest,
};

#[derive(Default)]
struct Totals {
    connected: AtomicU64,
    snapshots: AtomicU64,
    corrections: AtomicU64,
    despawns: AtomicU64,
    heartbeats: AtomicU64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let addr: String = env_or("ADDR", "127.0.0.1:4077".to_string());
    let clients: usize = env_or("CLIENTS", 50);
    let duration_secs: u64 = env_or("DURATION_SECS", 30);
    let move_interval_ms: u64 = env_or("MOVE_INTERVAL_MS", 100);

    info!(
        "load test: {} clients against {} for {}s, input every {} ms",
        clients, addr, duration_secs, move_interval_ms
    );

    let totals = Arc::new(Totals::default());
    let mut handles = Vec::with_capacity(clients);

    for client in 0..clients {
        let addr = addr.clone();
        let totals = totals.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client, &addr, move_interval_ms, duration_secs, &totals).await
            {
                warn!("[client {}] {}", client, e);
            }
        }));
        // Stagger connections
        sleep(Duration::from_millis(10)).await;
    }

    for handle in handles {
        let _ = handle.await;
    }

    info!(
        "done: {} connected, {} snapshots, {} corrections, {} despawns, {} heartbeats",
        totals.connected.load(Ordering::Relaxed),
        totals.snapshots.load(Ordering::Relaxed),
        totals.corrections.load(Ordering::Relaxed),
        totals.despawns.load(Ordering::Relaxed),
        totals.heartbeats.load(Ordering::Relaxed),
    );
    Ok(())
}

async fn run_client(
    id: usize,
    addr: &str,
    move_interval_ms: u64,
    duration_secs: u64,
    totals: &Totals,
) -> anyhow::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    let (mut reader, mut writer) = stream.into_split();
    totals.connected.fetch_add(1, Ordering::Relaxed);

    // Spawn somewhere near the middle of the world.
    let (sx, sy) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(-200.0..=200.0), rng.gen_range(-200.0..=200.0))
    };
    let spawn = ClientMessage::Spawn(SpawnRequest {
        kind: "loadtest".into(),
        x: sx,
        y: sy,
    });
    write_frame(&mut writer, &encode(&spawn)?).await?;

    let reply = timeout(Duration::from_secs(5), read_frame(&mut reader)).await??;
    let entity_id = match decode::<ServerMessage>(&reply)? {
        ServerMessage::SpawnResponse {
            success: true,
            entity_id,
            ..
        } => entity_id,
        ServerMessage::SpawnResponse { error, .. } => {
            anyhow::bail!("spawn refused: {}", error);
        }
        other => anyhow::bail!("unexpected reply to spawn: {:?}", other),
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration_secs);

    // Read loop: count what the server sends us.
    let read_task = {
        let snapshots = &totals.snapshots;
        let corrections = &totals.corrections;
        let despawns = &totals.despawns;
        let heartbeats = &totals.heartbeats;
        async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => match decode::<ServerMessage>(&frame) {
                        Ok(ServerMessage::Snapshot(_)) => {
                            snapshots.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(ServerMessage::Correction(_)) => {
                            corrections.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(ServerMessage::Despawn { .. }) => {
                            despawns.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(ServerMessage::Heartbeat { .. }) => {
                            heartbeats.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("[client {}] bad frame: {}", id, e);
                        }
                    },
                    Err(_) => break,
                }
            }
        }
    };

    // Write loop: random movement plus the occasional heartbeat.
    let write_task = async move {
        let mut ticker = interval(Duration::from_millis(move_interval_ms));
        let mut sequence: u64 = 0;
        loop {
            ticker.tick().await;
            sequence += 1;

            let message = if sequence % 50 == 0 {
                ClientMessage::Heartbeat {
                    client_id: entity_id,
                }
            } else {
                let (dx, dy) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(-5.0..=5.0), rng.gen_range(-5.0..=5.0))
                };
                ClientMessage::Movement(MovementDelta {
                    entity_id,
                    sequence,
                    dx,
                    dy,
                    timestamp_ms: sequence * move_interval_ms,
                })
            };

            let Ok(bytes) = encode(&message) else { break };
            if write_frame(&mut writer, &bytes).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = read_task => {}
        _ = write_task => {}
        _ = tokio::time::sleep_until(deadline) => {}
    }

    Ok(())
}
