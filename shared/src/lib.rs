//! Shared wire types, data model, and configuration for the HyperShell engine.
//!
//! Nothing in this crate talks to a socket or a database connection
//! directly; `server` and `client` each depend on it for the vocabulary they
//! exchange over the wire and persist to the store.

pub mod client_info;
pub mod config;
pub mod fsm;
pub mod heartbeat;
pub mod model;
pub mod signal;
pub mod tag;
pub mod template;
pub mod wire;

pub use client_info::ClientInfo;
pub use config::{ClientConfig, ServerConfig};
pub use heartbeat::{ClientState, Heartbeat};
pub use model::{Client, Task};

/// Result type alias used throughout the workspace.
pub type Result<T> = anyhow::Result<T>;

/// Error variants that cross component boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("template error: {0}")]
    Template(#[from] template::TemplateError),

    #[error("tag error: {0}")]
    Tag(#[from] tag::TagError),

    #[error("config error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_imports() {
        // Smoke test to ensure the crate's public modules compile and link.
    }
}
