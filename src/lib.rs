//! S3Adapter library -- S3-compatible gateway over pluggable backends.
//!
//! This crate provides the pieces of a gateway that accepts S3 requests
//! signed with platform keys and serves them from a backend object store
//! (AWS S3, Tencent COS, ...) bound to those keys: SigV4 verification,
//! the credential store, the backend registry with its adapters, the
//! uniform transport codec and the HTTP surface.

use std::sync::Arc;

pub mod auth;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod server;
pub mod xml;

use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::gateway::BackendRegistry;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Engine name -> backend factory.
    pub registry: Arc<BackendRegistry>,
    /// Platform key -> backend credentials.
    pub credentials: Arc<dyn CredentialResolver>,
}
