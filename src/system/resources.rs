//! Host resources
//!
//! Available memory and processor count, the two inputs to the load
//! configuration.

use sysinfo::System;

/// Source of the "available memory" figure used for the starting guess
pub trait MemoryProbe {
    /// Bytes that can be claimed without swapping, or `None` if unknown
    fn available_bytes(&self) -> Option<u64>;
}

/// Reads free plus reclaimable memory from the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl MemoryProbe for SystemMemory {
    fn available_bytes(&self) -> Option<u64> {
        let mut sys = System::new();
        sys.refresh_memory();

        // sysinfo reports 0 when the platform query fails
        match sys.available_memory() {
            0 => {
                tracing::warn!("Could not get available memory");
                None
            }
            bytes => Some(bytes),
        }
    }
}

/// A fixed figure, for overriding detection from the command line
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub Option<u64>);

impl MemoryProbe for FixedMemory {
    fn available_bytes(&self) -> Option<u64> {
        self.0
    }
}

/// Threads for generation and batch work: two cores are left for the rest of
/// the system, capped at eight.
pub fn inference_threads() -> u32 {
    let processors = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    threads_for(processors)
}

pub fn threads_for(processors: usize) -> u32 {
    processors.saturating_sub(2).clamp(1, 8) as u32
}
