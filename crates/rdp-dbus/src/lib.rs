// Shared D-Bus types and config structs for cosmic-ext-rdp-server.

pub mod client;
pub mod config;
pub mod constants;
pub mod server;
pub mod types;
