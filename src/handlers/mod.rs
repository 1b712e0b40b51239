mod admin;
mod echo;
mod health;

pub use admin::limiter_status;
pub use echo::echo;
pub use health::health_check;
