//! Rate limiting algorithms, backends and limiter lifecycle.

mod backend;
mod cache;
#[cfg(test)]
mod conformance;
#[cfg(test)]
mod embedded;
mod factory;
mod fixed_window;
mod gcra;
mod memory;
mod multi;
pub mod redis;
mod result;

pub use backend::Limiter;
pub use cache::{CacheKey, LimiterCache};
pub use factory::{BuiltLimiter, LimiterFactory};
pub use fixed_window::WindowRecord;
pub use gcra::TatRecord;
pub use memory::MemoryLimiter;
pub use multi::MultiLimiter;
pub use self::redis::{RedisLimiter, RedisStore};
pub use result::{Limit, RateLimitResult};
