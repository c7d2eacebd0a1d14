//! Search across the configured registries.

use std::sync::Arc;

use stevedore_core::error::{ImageError, Result};

use crate::registry::{RegistryClient, RegistryOptions, SearchResult};

pub struct ImageSearch {
    registry: Arc<dyn RegistryClient>,
    registries: Vec<String>,
}

impl ImageSearch {
    pub fn new(registry: Arc<dyn RegistryClient>, registries: Vec<String>) -> Self {
        Self {
            registry,
            registries,
        }
    }

    /// Query each registry in order and concatenate the hits.
    ///
    /// A failing registry is skipped, unless it is the only one configured.
    pub async fn search(
        &self,
        term: &str,
        limit: usize,
        opts: &RegistryOptions,
    ) -> Result<Vec<SearchResult>> {
        if term.trim().is_empty() {
            return Err(ImageError::InvalidArgument(
                "Search term must not be empty".to_string(),
            ));
        }

        let mut results = Vec::new();
        for registry in &self.registries {
            match self.registry.search(registry, term, limit, opts).await {
                Ok(hits) => {
                    tracing::debug!(registry = %registry, hits = hits.len(), "Searched registry");
                    results.extend(hits);
                }
                Err(e) if self.registries.len() == 1 => return Err(e),
                Err(e) => {
                    tracing::warn!(registry = %registry, error = %e, "Skipping registry in search");
                }
            }
        }
        Ok(results)
    }
}
