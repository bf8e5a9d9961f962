//! Provider registry and model routing

use super::{BackendError, InferenceBackend};
use crate::config::TitleConfig;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

pub const LOCAL_PROVIDER: &str = "local";

/// Routes each request to a backend by model name.
///
/// The local provider always exists; remote providers are optional extras.
/// Requests for models the local server reports in its catalog go local even
/// when a remote provider is active, and `local_only` forces everything local
/// regardless.
pub struct ProviderRegistry {
    local: Arc<dyn InferenceBackend>,
    remote: HashMap<String, Arc<dyn InferenceBackend>>,
    /// Remote provider receiving non-local traffic; `None` means local
    active: Option<String>,
    local_only: bool,
    /// Model names the local server reported on the last refresh
    local_models: RwLock<HashSet<String>>,
}

impl ProviderRegistry {
    pub fn new(local: Arc<dyn InferenceBackend>) -> Self {
        Self {
            local,
            remote: HashMap::new(),
            active: None,
            local_only: false,
            local_models: RwLock::new(HashSet::new()),
        }
    }

    /// Add a remote provider under a routing name.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn InferenceBackend>) {
        self.remote.insert(name.into(), backend);
    }

    /// Point non-local traffic at a registered provider. Returns false and
    /// changes nothing if the name is unknown.
    pub fn set_active(&mut self, name: &str) -> bool {
        if name == LOCAL_PROVIDER {
            self.active = None;
            return true;
        }
        if self.remote.contains_key(name) {
            self.active = Some(name.to_string());
            return true;
        }
        false
    }

    pub fn set_local_only(&mut self, local_only: bool) {
        self.local_only = local_only;
    }

    pub fn local_backend(&self) -> Arc<dyn InferenceBackend> {
        Arc::clone(&self.local)
    }

    pub fn active_backend(&self) -> Arc<dyn InferenceBackend> {
        match &self.active {
            Some(name) => self
                .remote
                .get(name)
                .cloned()
                .unwrap_or_else(|| Arc::clone(&self.local)),
            None => Arc::clone(&self.local),
        }
    }

    /// Pick the backend for a model.
    pub fn resolve(&self, model: &str) -> Arc<dyn InferenceBackend> {
        if self.local_only || self.is_local_model(model) {
            return Arc::clone(&self.local);
        }
        self.active_backend()
    }

    pub fn is_local_model(&self, model: &str) -> bool {
        self.local_models.read().unwrap().contains(model)
    }

    /// Re-pull the local model catalog. Returns how many models it reported.
    pub async fn refresh_local_models(&self) -> Result<usize, BackendError> {
        let models = self.local.list_models().await?;
        let mut known = self.local_models.write().unwrap();
        known.clear();
        known.extend(models.into_iter().map(|m| m.name));
        Ok(known.len())
    }

    /// Model to use for background title generation.
    ///
    /// Titling a three-line conversation does not need the conversation's own
    /// model; when that model looks heavyweight, prefer the first configured
    /// small model the local server actually has.
    pub fn title_model(&self, conversation_model: &str, title: &TitleConfig) -> String {
        let lower = conversation_model.to_lowercase();
        let heavy = title
            .heavyweight_markers
            .iter()
            .any(|marker| lower.contains(marker.as_str()));
        if !heavy {
            return conversation_model.to_string();
        }

        let known = self.local_models.read().unwrap();
        title
            .preferred_models
            .iter()
            .find(|m| known.contains(m.as_str()))
            .cloned()
            .unwrap_or_else(|| conversation_model.to_string())
    }
}
