//! Generate, preview, approve-or-reject, persist.
//!
//! The workflow is a single sequential state machine. It owns no OS signal
//! wiring: the entry point shares the [`CleanupRegistry`] with its signal
//! handler, and `run` flushes the same registry on every return path.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use imagegate_contracts::classify::classify_anyhow;
use imagegate_contracts::config::{KeyValueStore, LAST_PROVIDER_KEY};
use imagegate_contracts::errors::{ClassifiedError, RawProviderError};
use imagegate_contracts::events::EventWriter;
use imagegate_contracts::state::WorkflowState;
use serde_json::{json, Map, Value};

use crate::cleanup::{CleanupId, CleanupRegistry};
use crate::resilience::{GenerationAttempt, ResilienceWrapper, RetryNotice, RetryPolicy};
use crate::sinks::{PersistenceSink, PreviewSink, SavedArtifact};
use crate::{GenerationResult, ImageProvider, ProviderResolver};

const GENERATE_OPERATION: &str = "generating an image";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

/// Second question asked after a rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectChoice {
    /// Regenerate with this prompt. Blank keeps the previous prompt.
    Retry(String),
    Cancel,
}

/// The human side of the review loop. Errors (closed stdin, broken terminal)
/// fail the run; they are never read as a decision.
pub trait ReviewConsole {
    fn decide(&mut self, prompt: &str, preview: Option<&Path>) -> anyhow::Result<Decision>;
    fn after_reject(&mut self, previous_prompt: &str) -> anyhow::Result<RejectChoice>;
    /// Human-visible progress line.
    fn notice(&mut self, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WorkflowConfig {
    pub policy: RetryPolicy,
    /// Generations allowed per run, counting rejected ones. `None` is
    /// unbounded.
    pub max_generations: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Setup,
    Generation,
    Preview,
    Review,
    Saving,
    /// A bug inside the workflow or one of its collaborators.
    Internal,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Generation => "generation",
            Self::Preview => "preview",
            Self::Review => "review",
            Self::Saving => "saving",
            Self::Internal => "internal",
        }
    }

    pub fn context(self) -> &'static str {
        match self {
            Self::Setup => "before generation started",
            Self::Generation => "during image generation",
            Self::Preview => "while showing the preview",
            Self::Review => "while waiting for a decision",
            Self::Saving => "while saving output",
            Self::Internal => "inside the workflow",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowFailure {
    pub stage: FailureStage,
    pub error: ClassifiedError,
}

impl fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error.user_message, self.stage.context())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    Completed(SavedArtifact),
    Cancelled,
    Failed(WorkflowFailure),
}

impl WorkflowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed(_) | Self::Cancelled => 0,
            Self::Failed(_) => 1,
        }
    }
}

pub struct GenerationWorkflow {
    resolver: Box<dyn ProviderResolver>,
    preview: Box<dyn PreviewSink>,
    persistence: Box<dyn PersistenceSink>,
    store: Arc<dyn KeyValueStore>,
    cleanup: Arc<CleanupRegistry>,
    events: EventWriter,
    config: WorkflowConfig,
}

impl GenerationWorkflow {
    pub fn new(
        resolver: Box<dyn ProviderResolver>,
        preview: Box<dyn PreviewSink>,
        persistence: Box<dyn PersistenceSink>,
        store: Arc<dyn KeyValueStore>,
        cleanup: Arc<CleanupRegistry>,
        events: EventWriter,
    ) -> Self {
        Self {
            resolver,
            preview,
            persistence,
            store,
            cleanup,
            events,
            config: WorkflowConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cleanup(&self) -> &Arc<CleanupRegistry> {
        &self.cleanup
    }

    /// Drives one session to a terminal state, then flushes the cleanup
    /// registry before returning. A panic anywhere in the session becomes a
    /// failed outcome so the flush still runs.
    pub fn run(
        &self,
        prompt: &str,
        provider_id: &str,
        console: &mut dyn ReviewConsole,
    ) -> WorkflowOutcome {
        self.emit(
            "run_started",
            json!({ "prompt": prompt, "provider": provider_id }),
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.drive(prompt, provider_id, &mut *console)
        }))
        .unwrap_or_else(|payload| {
            WorkflowOutcome::Failed(WorkflowFailure {
                stage: FailureStage::Internal,
                error: ClassifiedError::unknown(
                    "The workflow stopped unexpectedly. Nothing was saved.",
                )
                .with_detail(panic_message(payload.as_ref())),
            })
        });

        let report = self.cleanup.flush();
        for failure in &report.failures {
            self.emit("cleanup_failed", json!({ "error": failure }));
            console.notice(&format!("Cleanup problem: {failure}"));
        }

        let mut finished = json!({ "outcome": outcome.as_str() });
        if let WorkflowOutcome::Failed(failure) = &outcome {
            finished["stage"] = json!(failure.stage.as_str());
            finished["kind"] = json!(failure.error.kind.as_str());
            finished["message"] = json!(failure.error.user_message);
        }
        if let WorkflowOutcome::Completed(saved) = &outcome {
            finished["path"] = json!(saved.path.to_string_lossy());
        }
        self.emit("run_finished", finished);
        outcome
    }

    fn drive(
        &self,
        prompt: &str,
        provider_id: &str,
        console: &mut dyn ReviewConsole,
    ) -> WorkflowOutcome {
        let mut state = WorkflowState::AwaitingPrompt;
        let mut current_prompt = prompt.trim().to_string();
        if current_prompt.is_empty() {
            return self.fail(
                &mut state,
                FailureStage::Setup,
                ClassifiedError::permanent("Enter a prompt describing the image to generate."),
            );
        }
        let provider = match self.resolver.resolve(provider_id) {
            Ok(provider) => provider,
            Err(err) => return self.fail(&mut state, FailureStage::Setup, err),
        };
        let wrapper = ResilienceWrapper::new(self.config.policy, GENERATE_OPERATION);
        let mut generations: u32 = 0;

        loop {
            if let Some(cap) = self.config.max_generations {
                if generations >= cap {
                    return self.fail(
                        &mut state,
                        FailureStage::Generation,
                        ClassifiedError::permanent(format!(
                            "Reached the limit of {cap} generations for this session. Start a new run to keep going."
                        )),
                    );
                }
            }

            self.enter(&mut state, WorkflowState::Generating);
            generations += 1;
            let image = match self.generate(&wrapper, &provider, &current_prompt, console) {
                Ok(image) => image,
                Err(err) => return self.fail(&mut state, FailureStage::Generation, err),
            };

            self.enter(&mut state, WorkflowState::AwaitingApproval);
            let handle = match self.preview.show(&image, &current_prompt) {
                Ok(handle) => handle,
                Err(err) => {
                    return self.fail(
                        &mut state,
                        FailureStage::Preview,
                        classify_anyhow(&err, "showing the preview"),
                    )
                }
            };
            // Registered before asking so an interrupt mid-decision still
            // disposes the preview.
            let preview_entry = {
                let handle = Arc::clone(&handle);
                self.cleanup
                    .register(format!("preview #{generations}"), move || handle.dispose())
            };
            let location = handle.location();
            self.emit(
                "preview_shown",
                json!({
                    "generation": generations,
                    "location": location.as_ref().map(|path| path.to_string_lossy().to_string()),
                }),
            );
            if let Some(warning) = handle.warning() {
                console.notice(&warning);
            }

            let answer = match console.decide(&current_prompt, location.as_deref()) {
                Ok(Decision::Approve) => Ok(None),
                Ok(Decision::Reject) => {
                    self.emit("decision", json!({ "decision": "reject" }));
                    console.after_reject(&current_prompt).map(Some)
                }
                Err(err) => Err(err),
            };
            self.dispose_preview(preview_entry, console);

            match answer {
                Err(err) => {
                    return self.fail(
                        &mut state,
                        FailureStage::Review,
                        ClassifiedError::unknown(
                            "The review ended before a decision was made. Nothing was saved.",
                        )
                        .with_detail(format!("{err:#}")),
                    );
                }
                Ok(Some(RejectChoice::Retry(next_prompt))) => {
                    self.emit("decision", json!({ "decision": "retry" }));
                    let next_prompt = next_prompt.trim();
                    if !next_prompt.is_empty() {
                        current_prompt = next_prompt.to_string();
                    }
                }
                Ok(Some(RejectChoice::Cancel)) => {
                    self.emit("decision", json!({ "decision": "cancel" }));
                    self.enter(&mut state, WorkflowState::Cancelled);
                    return WorkflowOutcome::Cancelled;
                }
                Ok(None) => {
                    self.emit("decision", json!({ "decision": "approve" }));
                    self.enter(&mut state, WorkflowState::Persisting);
                    return self.persist(
                        &mut state,
                        image,
                        &current_prompt,
                        generations,
                        provider.provider_id(),
                        console,
                    );
                }
            }
        }
    }

    fn generate(
        &self,
        wrapper: &ResilienceWrapper,
        provider: &Arc<dyn ImageProvider>,
        prompt: &str,
        console: &mut dyn ReviewConsole,
    ) -> Result<GenerationResult, ClassifiedError> {
        let provider_id = provider.provider_id().to_string();
        let deadline = provider.deadline();
        let call = {
            let provider = Arc::clone(provider);
            let events = self.events.clone();
            move |attempt: GenerationAttempt| {
                let _ = events.emit(
                    "generation_attempt",
                    object(json!({
                        "provider": attempt.provider_id,
                        "attempt": attempt.attempt_number,
                        "deadline_ms": attempt.deadline.as_millis() as u64,
                    })),
                );
                match provider.generate(&attempt.prompt) {
                    Ok(result) if result.image_bytes.is_empty() => Err(RawProviderError::other(
                        attempt.provider_id,
                        "provider returned no image data",
                    )),
                    other => other,
                }
            }
        };
        let mut on_retry = |notice: &RetryNotice| {
            console.notice(&notice.message());
            self.emit(
                "retry_scheduled",
                json!({
                    "provider": notice.provider_id,
                    "attempt": notice.attempt,
                    "max_attempts": notice.max_attempts,
                    "delay_ms": notice.delay.as_millis() as u64,
                    "kind": notice.error.kind.as_str(),
                }),
            );
        };
        let result = wrapper.execute(prompt, &provider_id, deadline, call, &mut on_retry);
        if let Err(err) = &result {
            self.emit(
                "generation_failed",
                json!({
                    "provider": provider_id,
                    "kind": err.kind.as_str(),
                    "message": err.user_message,
                    "detail": err.detail,
                }),
            );
        }
        result
    }

    fn persist(
        &self,
        state: &mut WorkflowState,
        image: GenerationResult,
        prompt: &str,
        generations: u32,
        provider_id: &str,
        console: &mut dyn ReviewConsole,
    ) -> WorkflowOutcome {
        let saved = match self.persistence.save(image, prompt, generations) {
            Ok(saved) => saved,
            Err(err) => {
                return self.fail(
                    state,
                    FailureStage::Saving,
                    classify_anyhow(&err, "saving the image"),
                )
            }
        };
        if let Err(err) = self.store.set(LAST_PROVIDER_KEY, provider_id) {
            console.notice(&format!(
                "Saved, but could not remember {provider_id} as the default provider: {err:#}"
            ));
        }
        for warning in &saved.warnings {
            console.notice(warning);
        }
        self.emit(
            "artifact_saved",
            json!({
                "path": saved.path.to_string_lossy(),
                "receipt": saved.receipt_path.as_ref().map(|path| path.to_string_lossy().to_string()),
                "generations": generations,
            }),
        );
        self.enter(state, WorkflowState::Completed);
        WorkflowOutcome::Completed(saved)
    }

    fn dispose_preview(&self, entry: CleanupId, console: &mut dyn ReviewConsole) {
        let report = self.cleanup.dispose(entry);
        for failure in &report.failures {
            self.emit("cleanup_failed", json!({ "error": failure }));
            console.notice(&format!("Cleanup problem: {failure}"));
        }
    }

    fn fail(
        &self,
        state: &mut WorkflowState,
        stage: FailureStage,
        error: ClassifiedError,
    ) -> WorkflowOutcome {
        self.enter(state, WorkflowState::Failed);
        WorkflowOutcome::Failed(WorkflowFailure { stage, error })
    }

    fn enter(&self, state: &mut WorkflowState, next: WorkflowState) {
        debug_assert!(
            state.can_transition_to(next),
            "illegal workflow transition {state} -> {next}"
        );
        self.emit(
            "state_changed",
            json!({ "from": state.as_str(), "to": next.as_str() }),
        );
        *state = next;
    }

    // The event log is advisory; a failed write never changes the outcome.
    fn emit(&self, event_type: &str, payload: Value) {
        let _ = self.events.emit(event_type, object(payload));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic without a message".to_string()
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use imagegate_contracts::config::{KeyValueStore, MemoryConfigStore, LAST_PROVIDER_KEY};
    use imagegate_contracts::errors::{parse_retry_after, ErrorKind, RawProviderError};
    use imagegate_contracts::events::EventWriter;

    use super::{
        Decision, FailureStage, GenerationWorkflow, RejectChoice, ReviewConsole, WorkflowConfig,
        WorkflowOutcome,
    };
    use crate::cleanup::CleanupRegistry;
    use crate::resilience::RetryPolicy;
    use crate::sinks::{PersistenceSink, PreviewHandle, PreviewSink, SavedArtifact};
    use crate::{GenerationResult, ImageProvider, ImageProviderRegistry};

    type Step = Result<Vec<u8>, RawProviderError>;

    struct StubProvider {
        script: Mutex<VecDeque<Step>>,
        calls: Arc<AtomicU32>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    impl ImageProvider for StubProvider {
        fn provider_id(&self) -> &str {
            "stub"
        }

        fn deadline(&self) -> Duration {
            Duration::from_secs(2)
        }

        fn generate(&self, prompt: &str) -> Result<GenerationResult, RawProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(prompt.to_string());
            }
            let step = self
                .script
                .lock()
                .ok()
                .and_then(|mut script| script.pop_front())
                .unwrap_or_else(|| Ok(format!("image-{call}").into_bytes()));
            step.map(|image_bytes| GenerationResult {
                image_bytes,
                content_type: "image/png".to_string(),
                provider_id: "stub".to_string(),
            })
        }
    }

    struct StubHandle {
        disposed: Arc<AtomicU32>,
        done: AtomicBool,
    }

    impl PreviewHandle for StubHandle {
        fn location(&self) -> Option<PathBuf> {
            Some(PathBuf::from("/tmp/preview.html"))
        }

        fn dispose(&self) -> anyhow::Result<()> {
            if !self.done.swap(true, Ordering::SeqCst) {
                self.disposed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct StubPreview {
        shown: Arc<AtomicU32>,
        disposed: Arc<AtomicU32>,
    }

    impl PreviewSink for StubPreview {
        fn show(
            &self,
            _image: &GenerationResult,
            _prompt: &str,
        ) -> anyhow::Result<Arc<dyn PreviewHandle>> {
            self.shown.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubHandle {
                disposed: Arc::clone(&self.disposed),
                done: AtomicBool::new(false),
            }))
        }
    }

    struct StubPersistence {
        saves: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: bool,
    }

    impl PersistenceSink for StubPersistence {
        fn save(
            &self,
            image: GenerationResult,
            _prompt: &str,
            _generations: u32,
        ) -> anyhow::Result<SavedArtifact> {
            if self.fail {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only output directory",
                )
                .into());
            }
            if let Ok(mut saves) = self.saves.lock() {
                saves.push(image.image_bytes);
            }
            Ok(SavedArtifact {
                path: PathBuf::from("/out/image.png"),
                receipt_path: None,
                warnings: Vec::new(),
            })
        }
    }

    #[derive(Default)]
    struct ScriptedConsole {
        decisions: VecDeque<Decision>,
        choices: VecDeque<RejectChoice>,
        notices: Vec<String>,
        disposed_seen_at_decision: Vec<u32>,
        disposed: Arc<AtomicU32>,
    }

    impl ReviewConsole for ScriptedConsole {
        fn decide(&mut self, _prompt: &str, _preview: Option<&Path>) -> anyhow::Result<Decision> {
            self.disposed_seen_at_decision
                .push(self.disposed.load(Ordering::SeqCst));
            self.decisions
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("stdin closed"))
        }

        fn after_reject(&mut self, _previous_prompt: &str) -> anyhow::Result<RejectChoice> {
            self.choices
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("stdin closed"))
        }

        fn notice(&mut self, message: &str) {
            self.notices.push(message.to_string());
        }
    }

    impl ScriptedConsole {
        fn retry_notices(&self) -> usize {
            self.notices
                .iter()
                .filter(|notice| notice.starts_with("Attempt "))
                .count()
        }
    }

    struct Harness {
        workflow: GenerationWorkflow,
        calls: Arc<AtomicU32>,
        prompts: Arc<Mutex<Vec<String>>>,
        shown: Arc<AtomicU32>,
        disposed: Arc<AtomicU32>,
        saves: Arc<Mutex<Vec<Vec<u8>>>>,
        store: Arc<MemoryConfigStore>,
        cleanup: Arc<CleanupRegistry>,
    }

    impl Harness {
        fn new(script: Vec<Step>, save_fails: bool) -> Self {
            Self::with_events(script, save_fails, EventWriter::discard("test-run"))
        }

        fn with_events(script: Vec<Step>, save_fails: bool, events: EventWriter) -> Self {
            let calls = Arc::new(AtomicU32::new(0));
            let prompts = Arc::new(Mutex::new(Vec::new()));
            let shown = Arc::new(AtomicU32::new(0));
            let disposed = Arc::new(AtomicU32::new(0));
            let saves = Arc::new(Mutex::new(Vec::new()));
            let store = Arc::new(MemoryConfigStore::new());
            let cleanup = Arc::new(CleanupRegistry::new());

            let mut registry = ImageProviderRegistry::new();
            registry.register(StubProvider {
                script: Mutex::new(script.into()),
                calls: Arc::clone(&calls),
                prompts: Arc::clone(&prompts),
            });
            let store_handle: Arc<dyn KeyValueStore> = store.clone();
            let workflow = GenerationWorkflow::new(
                Box::new(registry),
                Box::new(StubPreview {
                    shown: Arc::clone(&shown),
                    disposed: Arc::clone(&disposed),
                }),
                Box::new(StubPersistence {
                    saves: Arc::clone(&saves),
                    fail: save_fails,
                }),
                store_handle,
                Arc::clone(&cleanup),
                events,
            )
            .with_config(WorkflowConfig {
                policy: RetryPolicy {
                    max_retries: 2,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    jitter_ratio: 0.0,
                },
                max_generations: None,
            });

            Self {
                workflow,
                calls,
                prompts,
                shown,
                disposed,
                saves,
                store,
                cleanup,
            }
        }

        fn console(&self, decisions: &[Decision], choices: &[RejectChoice]) -> ScriptedConsole {
            ScriptedConsole {
                decisions: decisions.iter().copied().collect(),
                choices: choices.iter().cloned().collect(),
                disposed: Arc::clone(&self.disposed),
                ..ScriptedConsole::default()
            }
        }

        fn saved(&self) -> Vec<Vec<u8>> {
            self.saves.lock().map(|saves| saves.clone()).unwrap_or_default()
        }

        fn assert_cleanup_complete(&self) {
            assert_eq!(self.cleanup.pending(), 0);
            assert_eq!(
                self.cleanup.registered_count(),
                self.cleanup.disposed_count()
            );
            assert_eq!(
                self.shown.load(Ordering::SeqCst),
                self.disposed.load(Ordering::SeqCst)
            );
        }
    }

    #[test]
    fn approve_saves_generated_bytes_once() {
        let harness = Harness::new(vec![Ok(b"first".to_vec())], false);
        let mut console = harness.console(&[Decision::Approve], &[]);

        let outcome = harness.workflow.run("a red boat", "stub", &mut console);

        assert!(matches!(outcome, WorkflowOutcome::Completed(_)));
        assert_eq!(harness.calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.saved(), vec![b"first".to_vec()]);
        assert_eq!(harness.store.get(LAST_PROVIDER_KEY).as_deref(), Some("stub"));
        harness.assert_cleanup_complete();
    }

    #[test]
    fn reject_then_approve_saves_only_second_generation() {
        let harness = Harness::new(vec![Ok(b"first".to_vec()), Ok(b"second".to_vec())], false);
        let mut console = harness.console(
            &[Decision::Reject, Decision::Approve],
            &[RejectChoice::Retry("a blue boat".to_string())],
        );

        let outcome = harness.workflow.run("a red boat", "stub", &mut console);

        assert!(matches!(outcome, WorkflowOutcome::Completed(_)));
        assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
        assert_eq!(harness.saved(), vec![b"second".to_vec()]);
        assert_eq!(
            harness.prompts.lock().map(|p| p.clone()).unwrap_or_default(),
            vec!["a red boat".to_string(), "a blue boat".to_string()]
        );
        // The preview stays alive through each decision window.
        assert_eq!(console.disposed_seen_at_decision, vec![0, 1]);
        harness.assert_cleanup_complete();
    }

    #[test]
    fn blank_retry_prompt_keeps_previous_prompt() {
        let harness = Harness::new(Vec::new(), false);
        let mut console = harness.console(
            &[Decision::Reject, Decision::Approve],
            &[RejectChoice::Retry("   ".to_string())],
        );
        harness.workflow.run("a red boat", "stub", &mut console);
        assert_eq!(
            harness.prompts.lock().map(|p| p.clone()).unwrap_or_default(),
            vec!["a red boat".to_string(), "a red boat".to_string()]
        );
    }

    #[test]
    fn unauthorized_fails_after_one_call() {
        let harness = Harness::new(
            vec![Err(RawProviderError::http("stub", 401, "invalid key"))],
            false,
        );
        let mut console = harness.console(&[Decision::Approve], &[]);

        let outcome = harness.workflow.run("a red boat", "stub", &mut console);

        let WorkflowOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.stage, FailureStage::Generation);
        assert_eq!(failure.error.kind, ErrorKind::Permanent);
        assert!(failure.error.user_message.contains("Authorization failed"));
        assert!(failure.to_string().ends_with("(during image generation)"));
        assert_eq!(harness.calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.shown.load(Ordering::SeqCst), 0);
        assert!(harness.saved().is_empty());
        assert!(harness.store.get(LAST_PROVIDER_KEY).is_none());
    }

    #[test]
    fn rate_limit_then_success_logs_one_retry_notice() {
        let harness = Harness::new(
            vec![
                Err(RawProviderError::http("stub", 429, "slow down")),
                Ok(b"ok".to_vec()),
            ],
            false,
        );
        let mut console = harness.console(&[Decision::Approve], &[]);

        let outcome = harness.workflow.run("a red boat", "stub", &mut console);

        assert!(matches!(outcome, WorkflowOutcome::Completed(_)));
        assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
        assert_eq!(harness.shown.load(Ordering::SeqCst), 1);
        assert_eq!(console.retry_notices(), 1);
        assert!(console.notices[0].starts_with("Attempt 1/3 failed:"));
    }

    #[test]
    fn huge_retry_after_hint_still_backs_off_and_completes() {
        let harness = Harness::new(
            vec![
                Err(RawProviderError::http("stub", 429, "slow down")
                    .with_retry_after(parse_retry_after("1e20"))),
                Ok(b"ok".to_vec()),
            ],
            false,
        );
        let mut console = harness.console(&[Decision::Approve], &[]);

        let outcome = harness.workflow.run("a red boat", "stub", &mut console);

        assert!(matches!(outcome, WorkflowOutcome::Completed(_)));
        assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
        assert_eq!(console.retry_notices(), 1);
        harness.assert_cleanup_complete();
    }

    #[test]
    fn empty_image_payload_fails_without_preview_or_save() {
        let harness = Harness::new(vec![Ok(Vec::new())], false);
        let mut console = harness.console(&[Decision::Approve], &[]);

        let outcome = harness.workflow.run("a red boat", "stub", &mut console);

        let WorkflowOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.stage, FailureStage::Generation);
        assert_eq!(failure.error.kind, ErrorKind::Unknown);
        assert!(failure
            .error
            .detail
            .as_deref()
            .unwrap_or_default()
            .contains("no image data"));
        assert_eq!(harness.calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.shown.load(Ordering::SeqCst), 0);
        assert!(harness.saved().is_empty());
        assert!(harness.store.get(LAST_PROVIDER_KEY).is_none());
    }

    struct PanickingConsole;

    impl ReviewConsole for PanickingConsole {
        fn decide(&mut self, _prompt: &str, _preview: Option<&Path>) -> anyhow::Result<Decision> {
            panic!("terminal went away");
        }

        fn after_reject(&mut self, _previous_prompt: &str) -> anyhow::Result<RejectChoice> {
            Ok(RejectChoice::Cancel)
        }

        fn notice(&mut self, _message: &str) {}
    }

    #[test]
    fn panic_during_review_fails_and_flushes_cleanup() {
        let harness = Harness::new(Vec::new(), false);

        let outcome = harness.workflow.run("a red boat", "stub", &mut PanickingConsole);

        let WorkflowOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.stage, FailureStage::Internal);
        assert_eq!(failure.error.kind, ErrorKind::Unknown);
        assert_eq!(
            failure.error.detail.as_deref(),
            Some("terminal went away")
        );
        assert_eq!(harness.shown.load(Ordering::SeqCst), 1);
        assert!(harness.saved().is_empty());
        harness.assert_cleanup_complete();
    }

    #[test]
    fn cancel_after_reject_saves_nothing() {
        let harness = Harness::new(Vec::new(), false);
        let mut console = harness.console(&[Decision::Reject], &[RejectChoice::Cancel]);

        let outcome = harness.workflow.run("a red boat", "stub", &mut console);

        assert_eq!(outcome, WorkflowOutcome::Cancelled);
        assert_eq!(outcome.exit_code(), 0);
        assert!(harness.saved().is_empty());
        assert!(harness.store.get(LAST_PROVIDER_KEY).is_none());
        harness.assert_cleanup_complete();
    }

    #[test]
    fn save_failure_is_classified_and_cleans_up() {
        let harness = Harness::new(Vec::new(), true);
        let mut console = harness.console(&[Decision::Approve], &[]);

        let outcome = harness.workflow.run("a red boat", "stub", &mut console);

        let WorkflowOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.stage, FailureStage::Saving);
        assert_eq!(failure.error.kind, ErrorKind::Permanent);
        assert!(harness.store.get(LAST_PROVIDER_KEY).is_none());
        harness.assert_cleanup_complete();
    }

    #[test]
    fn closed_console_fails_and_still_disposes_preview() {
        let harness = Harness::new(Vec::new(), false);
        let mut console = harness.console(&[], &[]);

        let outcome = harness.workflow.run("a red boat", "stub", &mut console);

        let WorkflowOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.stage, FailureStage::Review);
        assert_eq!(failure.error.kind, ErrorKind::Unknown);
        assert!(failure.error.detail.as_deref().unwrap_or_default().contains("stdin closed"));
        harness.assert_cleanup_complete();
    }

    #[test]
    fn blank_prompt_and_unknown_provider_fail_before_generation() {
        let harness = Harness::new(Vec::new(), false);
        let mut console = harness.console(&[], &[]);

        let blank = harness.workflow.run("   ", "stub", &mut console);
        assert!(matches!(
            blank,
            WorkflowOutcome::Failed(ref failure) if failure.stage == FailureStage::Setup
        ));
        let unknown = harness.workflow.run("a red boat", "missing", &mut console);
        assert!(matches!(
            unknown,
            WorkflowOutcome::Failed(ref failure)
                if failure.stage == FailureStage::Setup && failure.error.kind == ErrorKind::Permanent
        ));
        assert_eq!(harness.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn generation_cap_stops_the_reject_loop() {
        let mut harness = Harness::new(Vec::new(), false);
        harness.workflow = harness.workflow.with_config(WorkflowConfig {
            policy: RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            },
            max_generations: Some(2),
        });
        let retry = RejectChoice::Retry(String::new());
        let mut console = harness.console(
            &[Decision::Reject, Decision::Reject, Decision::Approve],
            &[retry.clone(), retry],
        );

        let outcome = harness.workflow.run("a red boat", "stub", &mut console);

        let WorkflowOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(failure.error.user_message.contains("limit of 2 generations"));
        assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
        harness.assert_cleanup_complete();
    }

    #[test]
    fn event_log_records_the_state_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = temp.path().join("events.jsonl");
        let harness = Harness::with_events(Vec::new(), false, EventWriter::new(&log, "run-1"));
        let mut console = harness.console(&[Decision::Approve], &[]);

        harness.workflow.run("a red boat", "stub", &mut console);

        let events: Vec<serde_json::Value> = std::fs::read_to_string(&log)?
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        let transitions: Vec<String> = events
            .iter()
            .filter(|event| event["type"] == "state_changed")
            .filter_map(|event| event["to"].as_str().map(str::to_string))
            .collect();
        assert_eq!(
            transitions,
            vec!["generating", "awaiting_approval", "persisting", "completed"]
        );
        assert_eq!(events.first().map(|e| e["type"].clone()), Some("run_started".into()));
        assert_eq!(events.last().map(|e| e["outcome"].clone()), Some("completed".into()));
        assert!(events.iter().all(|event| event["run_id"] == "run-1"));
        Ok(())
    }
}
