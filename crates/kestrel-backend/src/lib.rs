//! Kestrel Backend - Queue backend abstraction layer
//!
//! This crate provides the narrow command protocol the worker runtime uses to
//! talk to the queue engine:
//! - Redis, driving the qless-core Lua engine
//! - In-memory, for tests and single-process embedding

pub mod memory;
pub mod redis;
pub mod traits;

pub use memory::MemoryClient;
pub use self::redis::RedisClient;
pub use traits::{BackendError, BackendResult, Client, EventStream, Queue};
