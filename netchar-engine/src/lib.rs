//! Network characteristics engine: turns a scenario topology into per-pair impairment rules for
//! the traffic-shaping sidecars, and shares bandwidth between flows that contend for the same
//! network segments.

pub mod bw_sharing;
pub mod discovery;
pub mod engine;
pub mod matrix;
pub mod rules;
pub mod scenario;
pub mod stats_tracker;
pub mod store;
pub mod topology;
pub mod util;

pub use engine::{EngineConfig, TcEngine};
pub use store::{InMemoryStore, Store};

/// Throughput used for "no limit", chosen to be easy to spot in rule dumps
pub const MAX_THROUGHPUT: i64 = 9_999_999_999;

/// Multiplier from the scenario's Mbps to the rules' bps
pub const THROUGHPUT_UNIT: i64 = 1_000_000;

/// Delay correlation (in percent) written to every shaping rule
pub const COMMON_CORRELATION: i64 = 50;

/// Link and app throughput (in Mbps) assumed when the scenario leaves it at zero
pub const DEFAULT_THROUGHPUT_LINK_MBPS: f64 = 1000.0;
