pub mod lock;
pub mod rate_limiter;

pub use lock::RedisLock;
pub use rate_limiter::RateLimiter;
