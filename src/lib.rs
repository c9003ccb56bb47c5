pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod pump;
pub mod server;
pub mod session;
pub mod transport;
