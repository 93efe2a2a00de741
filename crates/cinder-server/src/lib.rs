pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod server;
pub mod store;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<lifecycle::SecretService>,
    /// Base URL used to render one-time links, e.g. `https://cinder.example.com`.
    pub public_url: Option<String>,
}

pub use error::{SecretError, ValidationRule};
pub use lifecycle::{CreatedSecret, Limits, RevealedSecret, SecretService};
pub use server::{app, read_key_file, resolve_data_dir, run, ServerConfig, StorageBackend};
