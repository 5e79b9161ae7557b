use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::util::vec2::Vec2;

/// Axis-aligned world rectangle. Entity positions must stay inside it
/// whenever a tick is not mid-execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl WorldBounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Symmetric bounds, ±extent on both axes.
    pub fn centered(extent: f64) -> Self {
        Self::new(-extent, -extent, extent, extent)
    }

    #[inline]
    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    /// Nearest in-bounds point.
    pub fn clamp(&self, p: Vec2) -> Vec2 {
        Vec2::new(
            p.x.clamp(self.min_x, self.max_x),
            p.y.clamp(self.min_y, self.max_y),
        )
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn diagonal(&self) -> f64 {
        (self.width() * self.width() + self.height() * self.height()).sqrt()
    }
}

/// Server configuration, immutable for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the gateway to
    pub bind_address: IpAddr,
    /// Gateway port
    pub port: u16,
    /// Metrics HTTP port
    pub metrics_port: u16,
    /// Fixed timestep in milliseconds (10-100)
    pub tick_period_ms: u64,
    /// World rectangle entities live in
    pub world_bounds: WorldBounds,
    /// Cap on the magnitude of a single validated movement delta (units per tick)
    pub max_speed: f64,
    /// Area-of-interest radius around each observer
    pub aoi_radius: f64,
    /// Quadtree node capacity before subdividing
    pub quadtree_capacity: usize,
    /// Maximum quadtree subdivision depth
    pub quadtree_max_depth: usize,
    /// Maximum live entities (10-1000)
    pub max_entities: usize,
    /// Per-session outbound queue depth
    pub outbound_queue_depth: usize,
    /// Session liveness deadline, reset by heartbeats
    pub heartbeat_timeout_ms: u64,
    /// Movement-intent staging buffer capacity
    pub intent_buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 4077,
            metrics_port: 9090,
            tick_period_ms: 25,
            world_bounds: WorldBounds::centered(1000.0),
            max_speed: 5.0,
            aoi_radius: 100.0,
            quadtree_capacity: 4,
            quadtree_max_depth: 8,
            max_entities: 512,
            outbound_queue_depth: 64,
            heartbeat_timeout_ms: 15_000,
            intent_buffer_capacity: 1024,
        }
    }
}

impl Config {
    /// Load config from environment or use defaults. Malformed values are
    /// logged and ignored rather than fatal; `validate` runs afterwards.
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        read_env_u16("PORT", &mut config.port);
        read_env_u16("METRICS_PORT", &mut config.metrics_port);
        read_env_u64("TICK_PERIOD_MS", &mut config.tick_period_ms);
        read_env_u64("HEARTBEAT_TIMEOUT_MS", &mut config.heartbeat_timeout_ms);
        read_env_usize("MAX_ENTITIES", &mut config.max_entities);
        read_env_usize("OUTBOUND_QUEUE_DEPTH", &mut config.outbound_queue_depth);
        read_env_usize("QUADTREE_CAPACITY", &mut config.quadtree_capacity);
        read_env_usize("QUADTREE_MAX_DEPTH", &mut config.quadtree_max_depth);
        read_env_usize("INTENT_BUFFER_CAPACITY", &mut config.intent_buffer_capacity);
        read_env_f64("MAX_SPEED", &mut config.max_speed);
        read_env_f64("AOI_RADIUS", &mut config.aoi_radius);

        if let Ok(extent) = std::env::var("WORLD_EXTENT") {
            match extent.parse::<f64>() {
                Ok(parsed) if parsed > 0.0 => {
                    config.world_bounds = WorldBounds::centered(parsed);
                }
                _ => tracing::warn!("Invalid WORLD_EXTENT '{}', using default", extent),
            }
        }

        config
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if !(10..=100).contains(&self.tick_period_ms) {
            return Err(format!(
                "tick_period_ms must be 10-100, got {}",
                self.tick_period_ms
            ));
        }
        if !(10..=1000).contains(&self.max_entities) {
            return Err(format!(
                "max_entities must be 10-1000, got {}",
                self.max_entities
            ));
        }
        let b = &self.world_bounds;
        if b.min_x >= b.max_x || b.min_y >= b.max_y {
            return Err("world_bounds must have min < max on both axes".to_string());
        }
        if self.max_speed <= 0.0 {
            return Err("max_speed must be > 0".to_string());
        }
        if self.aoi_radius <= 0.0 {
            return Err("aoi_radius must be > 0".to_string());
        }
        if self.quadtree_capacity < 1 {
            return Err("quadtree_capacity must be at least 1".to_string());
        }
        if self.quadtree_max_depth < 1 {
            return Err("quadtree_max_depth must be at least 1".to_string());
        }
        if self.outbound_queue_depth < 1 {
            return Err("outbound_queue_depth must be at least 1".to_string());
        }
        if self.intent_buffer_capacity < 1 {
            return Err("intent_buffer_capacity must be at least 1".to_string());
        }
        if self.heartbeat_timeout_ms < self.tick_period_ms {
            return Err("heartbeat_timeout_ms must cover at least one tick".to_string());
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

fn read_env_u16(key: &str, slot: &mut u16) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<u16>() {
            Ok(parsed) if parsed > 0 => *slot = parsed,
            _ => tracing::warn!("Invalid {} '{}', using default", key, raw),
        }
    }
}

fn read_env_u64(key: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<u64>() {
            Ok(parsed) if parsed > 0 => *slot = parsed,
            _ => tracing::warn!("Invalid {} '{}', using default", key, raw),
        }
    }
}

fn read_env_usize(key: &str, slot: &mut usize) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<usize>() {
            Ok(parsed) if parsed > 0 => *slot = parsed,
            _ => tracing::warn!("Invalid {} '{}', using default", key, raw),
        }
    }
}

fn read_env_f64(key: &str, slot: &mut f64) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<f64>() {
            Ok(parsed) if parsed > 0.0 && parsed.is_finite() => *slot = parsed,
            _ => tracing::warn!("Invalid {} '{}', using default", key, raw),
        }
    }
}
