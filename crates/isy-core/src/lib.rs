//! Domain layer for Universal Devices ISY / IoX controllers.
//!
//! Builds on `isy-api` to keep an in-memory mirror of the controller's
//! state: bulk snapshots reconciled with live stream deltas under a
//! total ordering stamp, reactive subscriptions over the result, and a
//! command surface routed through the same bounded transport.
//!
//! Entry point: [`Isy`] -- create from an [`IsyConfig`], call
//! [`Isy::initialize`], then read and subscribe through the
//! [`Registry`].

pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod router;
pub mod store;
pub mod stream;

pub use command::Command;
pub use config::{InitializeOptions, IsyConfig, TlsVerification};
pub use controller::{InitReport, Isy};
pub use error::CoreError;
pub use model::{
    Address, EntityChange, EntityRecord, NetworkResource, Node, Platform, Program, PropertyData,
    PropertyValue, SystemStatus, Variable, VariableKind,
};
pub use router::EventCategory;
pub use store::{DeltaOutcome, EntityCollection, MergeOutcome, Registry, SubscriptionHandle};
pub use stream::EntityStream;

// Re-exported so embedders can match on stream lifecycle types without
// depending on isy-api directly.
pub use isy_api::events::{StreamState, StreamTransition};
pub use isy_api::{ConfigurationSnapshot, PlatformClass};
