use std::sync::Arc;

use crate::config::Config;
use crate::registry::StreamRegistry;

/// Shared handles the HTTP layer needs, cloned into every handler via
/// `Extension`.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    pub title: String,
    /// `"/{token}"` when a path token is configured, empty otherwise.
    pub path_prefix: String,
    pub jpeg_quality: u8,
}

impl AppState {
    pub fn new(registry: Arc<StreamRegistry>, config: &Config) -> Self {
        let path_prefix = if config.token.is_empty() {
            String::new()
        } else {
            format!("/{}", config.token)
        };

        Self {
            registry,
            title: config.title.clone(),
            path_prefix,
            jpeg_quality: config.jpeg_quality,
        }
    }
}
