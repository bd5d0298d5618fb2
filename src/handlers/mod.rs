mod health;
pub mod proxy;
mod usage;

pub use health::{GATEWAY_NAME, health_check, index, not_found, readiness_check};
pub use proxy::proxy;
pub use usage::usage;
