use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use imagegate_contracts::config::KeyValueStore;
use imagegate_contracts::errors::{ClassifiedError, RawProviderError};
use imagegate_contracts::providers::{ProviderCatalog, ProviderSpec};

pub mod cleanup;
pub mod providers;
pub mod resilience;
pub mod sinks;
pub mod workflow;

pub use cleanup::{CleanupId, CleanupRegistry, FlushReport};
pub use resilience::{GenerationAttempt, ResilienceWrapper, RetryNotice, RetryPolicy};
pub use sinks::{
    DirectoryPersistenceSink, PersistenceSink, PreviewHandle, PreviewSink, SavedArtifact,
    TempDirPreviewSink,
};
pub use workflow::{
    Decision, FailureStage, GenerationWorkflow, RejectChoice, ReviewConsole, WorkflowConfig,
    WorkflowFailure, WorkflowOutcome,
};

const DRYRUN_FAILURES_ENV: &str = "IMAGEGATE_DRYRUN_FAILURES";

/// Successful output of one provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub image_bytes: Vec<u8>,
    pub content_type: String,
    pub provider_id: String,
}

/// One vendor backend. Implementations must not leave partial files behind
/// on failure; all vendor-specific request and response shapes stay inside
/// the implementing struct.
pub trait ImageProvider: Send + Sync {
    fn provider_id(&self) -> &str;
    fn deadline(&self) -> Duration;
    fn generate(&self, prompt: &str) -> Result<GenerationResult, RawProviderError>;
}

/// Turns a provider id into a ready adapter, or a `Permanent` error when the
/// id is unknown or its credential is missing.
pub trait ProviderResolver {
    fn resolve(&self, provider_id: &str) -> Result<Arc<dyn ImageProvider>, ClassifiedError>;
}

/// Fixed set of already-built adapters.
#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.provider_id().to_string(), Arc::new(provider));
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ImageProvider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

impl ProviderResolver for ImageProviderRegistry {
    fn resolve(&self, provider_id: &str) -> Result<Arc<dyn ImageProvider>, ClassifiedError> {
        self.get(provider_id)
            .ok_or_else(|| unknown_provider_error(provider_id, &self.names()))
    }
}

/// Builds adapters on demand from the catalog and the settings store.
pub struct CatalogResolver {
    catalog: ProviderCatalog,
    store: Arc<dyn KeyValueStore>,
}

impl CatalogResolver {
    pub fn new(catalog: ProviderCatalog, store: Arc<dyn KeyValueStore>) -> Self {
        Self { catalog, store }
    }

    pub fn catalog(&self) -> &ProviderCatalog {
        &self.catalog
    }

    fn build(
        &self,
        spec: &ProviderSpec,
        api_key: Option<String>,
    ) -> anyhow::Result<Arc<dyn ImageProvider>> {
        let deadline = spec.effective_deadline(self.store.as_ref());
        let model = spec.default_model.clone();
        let key = api_key.unwrap_or_default();
        let provider: Arc<dyn ImageProvider> = match spec.id.as_str() {
            "openai" => Arc::new(providers::OpenAiProvider::new(key, model, deadline)?),
            "stability" => Arc::new(providers::StabilityProvider::new(key, deadline)?),
            "gemini" => Arc::new(providers::GeminiProvider::new(key, model, deadline)?),
            "dryrun" => Arc::new(
                providers::DryrunProvider::new(deadline)
                    .with_scripted_failures(scripted_dryrun_failures()),
            ),
            other => anyhow::bail!("no adapter is built in for provider '{other}'"),
        };
        Ok(provider)
    }
}

impl ProviderResolver for CatalogResolver {
    fn resolve(&self, provider_id: &str) -> Result<Arc<dyn ImageProvider>, ClassifiedError> {
        let Some(spec) = self.catalog.get(provider_id) else {
            return Err(unknown_provider_error(provider_id, &self.catalog.ids()));
        };
        let api_key = spec.credential(self.store.as_ref());
        if spec.requires_credential() && api_key.is_none() {
            return Err(ClassifiedError::permanent(format!(
                "No API key configured for {}. Set {} and try again.",
                spec.display_name,
                spec.credential_hint()
            ))
            .with_provider(provider_id));
        }
        self.build(spec, api_key).map_err(|err| {
            ClassifiedError::unknown(format!("Could not initialize the {} client.", spec.display_name))
                .with_detail(format!("{err:#}"))
                .with_provider(provider_id)
        })
    }
}

fn unknown_provider_error(provider_id: &str, available: &[String]) -> ClassifiedError {
    ClassifiedError::permanent(format!(
        "Unknown provider '{provider_id}'. Available providers: {}.",
        available.join(", ")
    ))
}

fn scripted_dryrun_failures() -> Vec<String> {
    env::var(DRYRUN_FAILURES_ENV)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
