//! Error types shared across the engine.
//!
//! Capacity exhaustion on the lock-free queue is reported by handing the
//! rejected value back (`Result<(), T>`) and never appears here; everything
//! else that a caller can act on is a [`NexusError`].  Failures of the work
//! itself travel through the task handle as a [`TaskError`].

use std::time::Duration;
use thiserror::Error;

use crate::engine::EngineState;

/// Errors raised by the engine, the worker pool and the memory pool.
#[derive(Debug, Error)]
pub enum NexusError {
    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration can only change while the engine is stopped.
    #[error("Configuration is locked while the engine is {0}")]
    ConfigLocked(EngineState),

    /// The pending-task queue reached its capacity.
    #[error("Task queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// Work was submitted while the engine does not accept it.
    #[error("Engine is not accepting work (state: {0})")]
    NotAccepting(EngineState),

    /// Every block of the memory pool is checked out.
    #[error("Memory pool exhausted ({blocks} blocks in use)")]
    PoolExhausted { blocks: usize },

    /// A block was handed to a pool that did not allocate it.
    #[error("Block {index} does not belong to this memory pool")]
    ForeignBlock { index: usize },

    /// A block was released while already free.
    #[error("Block {index} released twice")]
    DoubleFree { index: usize },

    /// A bounded wait expired.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The OS refused to create a worker thread.
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why a submitted task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The payload panicked; the message is the panic payload when it was a string.
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The payload returned an error.
    #[error("Task failed: {0}")]
    Failed(String),

    /// The pool was torn down before the task ran.
    #[error("Task cancelled before execution")]
    Cancelled,
}

/// Convenience alias for fallible engine operations.
pub type Result<T> = std::result::Result<T, NexusError>;
