pub mod config;
pub mod core;
pub mod logging;
pub mod policies;
pub mod routers;
pub mod server;
