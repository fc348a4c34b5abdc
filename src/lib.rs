pub mod admin;
pub mod app_state;
pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod handler;
pub mod kinds;
pub mod metrics;
pub mod rate_limiter;
pub mod server;
pub mod storage;
pub mod subscription;
pub mod validator;
pub mod whitelist;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used items
pub use app_state::RelayState;
pub use error::Error;
pub use storage::RelayDatabase;
pub use whitelist::{Whitelist, WhitelistEntry};
