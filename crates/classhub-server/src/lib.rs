//! Classroom session hub: the registry actor, per-connection tasks, message
//! processing and the axum transport around them.

pub mod client;
pub mod connection;
pub mod error;
pub mod hub;
pub mod processor;
pub mod reporting;
pub mod server;
pub mod services;

pub use client::ClientHandle;
pub use connection::ConnectionLimits;
pub use error::{ConnectError, HubError, ServiceError};
pub use hub::{Hub, HubConfig, HubHandle};
pub use processor::{Flow, Processor};
pub use server::{build_router, start, AppState, ServerHandle};
pub use services::{HttpDirectory, IdentityService, UnitDirectory};
