//! Startup-fatal server errors

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Server is already running on port {0}")]
    AlreadyRunning(u16),

    #[error("Root directory '{}' does not exist or is not a directory", .0.display())]
    InvalidRoot(PathBuf),

    #[error("Invalid bind address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load TLS certificate into the HTTPS listener: {0}")]
    Tls(String),

    #[error("Failed to launch '{profile}' dev server ({command}): {source}")]
    HmrSpawn {
        profile: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "'{profile}' dev server did not become reachable on port {port} within {}s",
        .timeout.as_secs_f32()
    )]
    HmrTimeout {
        profile: String,
        port: u16,
        timeout: Duration,
    },

    #[error("Startup cancelled while waiting for the '{0}' dev server")]
    Cancelled(String),
}
