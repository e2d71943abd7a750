//! Host inspection
//!
//! Memory and processor figures that seed the load configuration.

pub mod probe;
pub mod resources;

pub use probe::{probe, tier_defaults, StartGuess};
pub use resources::{inference_threads, FixedMemory, MemoryProbe, SystemMemory};
