//! Quota store backends

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;
