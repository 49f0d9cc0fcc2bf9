//! ackchat server: accepts client connections and relays login, logout and
//! chat events to every member, answering each request only after all
//! members confirmed the event it caused.

pub mod config;
pub mod registry;
pub mod server;
pub mod stats;
pub mod worker;

pub use config::ServerConfig;
pub use registry::ClientRegistry;
