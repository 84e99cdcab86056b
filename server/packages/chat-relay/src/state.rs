//! Shared mutable server state: the active model, the parameter cache and the
//! model catalog. Each piece has its own narrow lock.

use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard};

use crate::automation::{CatalogEntry, ChatAutomation};
use crate::openai::GenerationParams;

const DEFAULT_MODELS: &[(&str, &str, &str)] = &[
    (
        "qwen3-max",
        "Qwen3-Max",
        "Flagship Qwen3 model for general reasoning and complex problem solving.",
    ),
    (
        "qwen3-vl-235b",
        "Qwen3-VL-235B",
        "Large multimodal model capable of advanced vision-language understanding.",
    ),
    (
        "qwq-32b",
        "QwQ-32B",
        "Preview reasoning specialist derived from the Qwen QwQ series.",
    ),
    (
        "qwen2.5-max",
        "Qwen2.5-Max",
        "High capacity Qwen2.5 model retained for backwards compatibility.",
    ),
];

pub fn default_models() -> Vec<CatalogEntry> {
    DEFAULT_MODELS
        .iter()
        .map(|(id, display_name, description)| CatalogEntry {
            id: id.to_string(),
            display_name: display_name.to_string(),
            description: description.to_string(),
            owned_by: "qwen".to_string(),
        })
        .collect()
}

/// Reads one model id per line; blank lines and `#` comments are skipped.
/// A missing or unreadable file yields an empty set.
pub fn load_excluded_models(path: &Path) -> HashSet<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read excluded models file");
            HashSet::new()
        }
    }
}

/// Generation parameters last pushed to the page, and for which model.
#[derive(Debug, Default)]
pub struct ParamsCache {
    model: Option<String>,
    applied: GenerationParams,
}

impl ParamsCache {
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// The subset of `requested` that differs from what is already applied.
    pub fn diff(&self, requested: &GenerationParams) -> GenerationParams {
        fn changed<T: Clone + PartialEq>(requested: &Option<T>, applied: &Option<T>) -> Option<T> {
            match requested {
                Some(value) if applied.as_ref() != Some(value) => Some(value.clone()),
                _ => None,
            }
        }
        GenerationParams {
            temperature: changed(&requested.temperature, &self.applied.temperature),
            max_tokens: changed(&requested.max_tokens, &self.applied.max_tokens),
            top_p: changed(&requested.top_p, &self.applied.top_p),
            stop: changed(&requested.stop, &self.applied.stop),
        }
    }

    pub fn record(&mut self, model: Option<String>, applied: &GenerationParams) {
        self.model = model;
        if applied.temperature.is_some() {
            self.applied.temperature = applied.temperature;
        }
        if applied.max_tokens.is_some() {
            self.applied.max_tokens = applied.max_tokens;
        }
        if applied.top_p.is_some() {
            self.applied.top_p = applied.top_p;
        }
        if applied.stop.is_some() {
            self.applied.stop = applied.stop.clone();
        }
    }
}

#[derive(Debug, Default)]
struct ModelCatalog {
    entries: Vec<CatalogEntry>,
    refreshed_at: Option<Instant>,
}

#[derive(Debug)]
pub struct ServerState {
    proxy_model_name: String,
    active_model: RwLock<Option<String>>,
    model_switch: Mutex<()>,
    params_cache: Mutex<ParamsCache>,
    catalog: Mutex<ModelCatalog>,
    excluded_models: HashSet<String>,
    catalog_ttl: Duration,
}

impl ServerState {
    pub fn new(
        proxy_model_name: String,
        excluded_models: HashSet<String>,
        catalog_ttl: Duration,
    ) -> Self {
        Self {
            proxy_model_name,
            active_model: RwLock::new(None),
            model_switch: Mutex::new(()),
            params_cache: Mutex::new(ParamsCache::default()),
            catalog: Mutex::new(ModelCatalog::default()),
            excluded_models,
            catalog_ttl,
        }
    }

    /// The alias clients may send to mean "whatever is active".
    pub fn proxy_model_name(&self) -> &str {
        &self.proxy_model_name
    }

    pub fn active_model(&self) -> Option<String> {
        match self.active_model.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_active_model(&self, model: Option<String>) {
        match self.active_model.write() {
            Ok(mut guard) => *guard = model,
            Err(poisoned) => *poisoned.into_inner() = model,
        }
    }

    /// Model name reported in responses.
    pub fn response_model_name(&self) -> String {
        self.active_model()
            .unwrap_or_else(|| self.proxy_model_name.clone())
    }

    pub async fn lock_model_switch(&self) -> MutexGuard<'_, ()> {
        self.model_switch.lock().await
    }

    pub async fn lock_params_cache(&self) -> MutexGuard<'_, ParamsCache> {
        self.params_cache.lock().await
    }

    pub fn is_excluded(&self, model_id: &str) -> bool {
        self.excluded_models.contains(model_id)
    }

    /// Current catalog, refreshed from the page when empty or older than the
    /// TTL. Falls back to the built-in list when the page offers nothing.
    pub async fn models(&self, automation: &dyn ChatAutomation) -> Vec<CatalogEntry> {
        let mut catalog = self.catalog.lock().await;
        let stale = catalog
            .refreshed_at
            .map_or(true, |at| at.elapsed() > self.catalog_ttl);
        if catalog.entries.is_empty() || stale {
            let refreshed = match automation.refresh_model_catalog().await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(error = %err, "model catalog refresh failed");
                    Vec::new()
                }
            };
            let filtered: Vec<CatalogEntry> = refreshed
                .into_iter()
                .filter(|entry| !self.is_excluded(&entry.id))
                .collect();
            catalog.entries = if filtered.is_empty() {
                tracing::warn!("no models available from the page; using built-in list");
                default_models()
            } else {
                filtered
            };
            catalog.refreshed_at = Some(Instant::now());
            tracing::info!(models = catalog.entries.len(), "model catalog refreshed");
        }
        let entries: Vec<CatalogEntry> = catalog
            .entries
            .iter()
            .filter(|entry| !self.is_excluded(&entry.id))
            .cloned()
            .collect();
        if entries.is_empty() {
            default_models()
        } else {
            entries
        }
    }
}
