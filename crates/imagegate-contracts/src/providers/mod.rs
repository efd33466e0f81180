use std::time::Duration;

use indexmap::IndexMap;

use crate::config::{api_key_key, deadline_key, KeyValueStore};

const DEADLINE_MIN_SECS: f64 = 5.0;
const DEADLINE_MAX_SECS: f64 = 600.0;

/// Static facts about one image backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub id: String,
    pub display_name: String,
    /// Wall-clock budget for a single generation attempt.
    pub deadline: Duration,
    /// Environment variables checked, in order, for the API key. Empty means
    /// the provider needs no credential.
    pub credential_env: Vec<String>,
    pub default_model: Option<String>,
}

impl ProviderSpec {
    pub fn requires_credential(&self) -> bool {
        !self.credential_env.is_empty()
    }

    /// Environment first, then `<id>_api_key` in the store.
    pub fn credential(&self, store: &dyn KeyValueStore) -> Option<String> {
        if !self.requires_credential() {
            return None;
        }
        self.credential_env
            .iter()
            .find_map(|key| non_empty_env(key))
            .or_else(|| {
                store
                    .get(&api_key_key(&self.id))
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
    }

    pub fn has_credential(&self, store: &dyn KeyValueStore) -> bool {
        !self.requires_credential() || self.credential(store).is_some()
    }

    /// `<id>_deadline_secs` from the store, clamped, else the built-in value.
    pub fn effective_deadline(&self, store: &dyn KeyValueStore) -> Duration {
        store
            .get(&deadline_key(&self.id))
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite())
            .map(|secs| Duration::from_secs_f64(secs.clamp(DEADLINE_MIN_SECS, DEADLINE_MAX_SECS)))
            .unwrap_or(self.deadline)
    }

    /// Human hint naming every place a key can come from.
    pub fn credential_hint(&self) -> String {
        let mut sources: Vec<String> = self.credential_env.clone();
        sources.push(format!("the `{}` config key", api_key_key(&self.id)));
        sources.join(" or ")
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCatalog {
    providers: IndexMap<String, ProviderSpec>,
}

impl ProviderCatalog {
    pub fn new(providers: Option<IndexMap<String, ProviderSpec>>) -> Self {
        Self {
            providers: providers.unwrap_or_else(default_providers),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ProviderSpec> {
        self.providers.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ProviderSpec> {
        self.providers.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// First provider in catalog order that needs a key and has one.
    pub fn first_configured(&self, store: &dyn KeyValueStore) -> Option<&ProviderSpec> {
        self.providers
            .values()
            .find(|spec| spec.requires_credential() && spec.credential(store).is_some())
    }
}

impl Default for ProviderCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_providers() -> IndexMap<String, ProviderSpec> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str,
                      display_name: &str,
                      deadline_secs: u64,
                      credential_env: &[&str],
                      default_model: Option<&str>| {
        map.insert(
            id.to_string(),
            ProviderSpec {
                id: id.to_string(),
                display_name: display_name.to_string(),
                deadline: Duration::from_secs(deadline_secs),
                credential_env: credential_env
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                default_model: default_model.map(str::to_string),
            },
        );
    };

    insert("openai", "OpenAI", 120, &["OPENAI_API_KEY"], Some("gpt-image-1"));
    insert(
        "stability",
        "Stability AI",
        60,
        &["STABILITY_API_KEY"],
        Some("stable-image-core"),
    );
    insert(
        "gemini",
        "Google Gemini",
        90,
        &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        Some("gemini-2.5-flash-image"),
    );
    insert("dryrun", "Dry run (local)", 10, &[], None);

    map
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
