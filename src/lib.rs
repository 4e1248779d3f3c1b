// Clippy allows for reasonable defaults
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::field_reassign_with_default)] // Builder pattern is clearer

// Module declarations
pub mod certs;
pub mod config;
pub mod server;
pub mod shutdown;

pub use certs::{CertificatePair, CertificateProvisioner};
pub use config::{ConfigMerger, PartialSettings, ProjectType, ProxyRule, ServerConfig};
pub use server::{LiveServer, ServerError, ServerEvent, ServerInfo};
pub use shutdown::{register_signal_handlers, ShutdownState, TeardownReport};
