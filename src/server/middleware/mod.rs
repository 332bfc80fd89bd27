// src/server/middleware/mod.rs
pub mod rate_limit;
pub mod throttle;
pub mod validation;

// Re-export main components for cleaner imports
pub use rate_limit::CheckRateLimiter;
pub use throttle::UpgradeThrottle;
pub use validation::{validate_domain, validate_size};
