//! Engine module - lifecycle, state and the allocation-free building blocks
//!
//! The [`Engine`] orchestrates a worker pool, a fixed-block memory pool and a
//! metrics collector.  The ring buffer and memory pool are usable on their
//! own for bounded producer/consumer paths.

pub mod memory_pool;
mod orchestrator;
pub mod ring_buffer;
pub mod state;

pub use memory_pool::{BlockId, MemoryPool, PoolBlock, PoolStats};
pub use orchestrator::Engine;
pub use ring_buffer::{Consumer, LockFreeQueue, Producer, RingBuffer};
pub use state::{EngineState, StateCell};
