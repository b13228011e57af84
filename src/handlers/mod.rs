pub mod config;
pub mod health;
pub mod rank;

pub use config::config_handler;
pub use health::{health_handler, ready_handler};
pub use rank::rank_handler;
