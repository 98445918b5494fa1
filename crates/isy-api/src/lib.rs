// isy-api: Async Rust client for the ISY / IoX controller REST API and event stream.

pub mod client;
pub mod configuration;
pub mod error;
pub mod events;
pub mod permits;
pub mod transport;

pub use client::IsyClient;
pub use configuration::{ConfigurationSnapshot, PlatformClass};
pub use error::Error;
pub use events::{EventMessage, StreamState, StreamTransition};
pub use permits::{ConnectionClass, PermitPool};
