//! Driftfield: an authoritative real-time spatial simulation server.
//!
//! A fixed-timestep tick owns the positional state of a bounded population
//! of moving entities, indexes them in a quadtree, computes per-client
//! area-of-interest deltas, validates client movement against server-side
//! physics bounds, and broadcasts minimal per-session updates over a
//! length-prefixed binary transport.

pub mod config;
pub mod metrics;
pub mod net;
pub mod sim;
pub mod util;
pub mod world;
