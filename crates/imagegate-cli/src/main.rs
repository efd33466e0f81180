use std::env;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use imagegate_contracts::config::{
    default_config_path, JsonConfigStore, KeyValueStore, LAST_PROVIDER_KEY, OUTPUT_DIR_KEY,
};
use imagegate_contracts::events::EventWriter;
use imagegate_contracts::providers::ProviderCatalog;
use imagegate_engine::{
    CatalogResolver, CleanupRegistry, Decision, DirectoryPersistenceSink, GenerationWorkflow,
    RejectChoice, RetryPolicy, ReviewConsole, TempDirPreviewSink, WorkflowConfig,
    WorkflowOutcome,
};
use serde_json::json;
use uuid::Uuid;

const OUTPUT_DIR_ENV: &str = "IMAGEGATE_OUTPUT_DIR";
const FALLBACK_PROVIDER: &str = "dryrun";
const SIGINT: i32 = 2;
#[cfg(unix)]
const SIGTERM: i32 = 15;

#[derive(Debug, Parser)]
#[command(name = "imagegate", version, about = "Generate images with a review step before saving")]
struct Cli {
    /// Settings file (default: $IMAGEGATE_CONFIG or <config dir>/imagegate/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Providers,
    Config(ConfigArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Write the preview but do not launch a viewer.
    #[arg(long)]
    no_open: bool,
    #[arg(long, default_value_t = 2)]
    max_retries: u32,
    #[arg(long)]
    max_generations: Option<u32>,
}

#[derive(Debug, Parser)]
struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    List,
    Path,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("imagegate error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    match cli.command {
        Command::Generate(args) => run_generate(args, config_path),
        Command::Providers => run_providers(config_path),
        Command::Config(args) => run_config(args.action, config_path),
    }
}

fn run_generate(args: GenerateArgs, config_path: PathBuf) -> Result<i32> {
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonConfigStore::new(config_path));
    let catalog = ProviderCatalog::default();
    let out_dir = resolve_output_dir(args.out.clone(), non_empty_env(OUTPUT_DIR_ENV), store.as_ref());
    let provider_id = resolve_provider(args.provider.as_deref(), store.as_ref(), &catalog);

    let run_id = Uuid::new_v4().to_string();
    let events = match args.events.as_ref() {
        Some(path) => EventWriter::new(path, run_id.as_str()),
        None => EventWriter::discard(run_id.as_str()),
    };
    let cleanup = Arc::new(CleanupRegistry::new());
    if let Err(err) = spawn_signal_watcher(Arc::clone(&cleanup), events.clone()) {
        eprintln!("imagegate warning: {err:#}; temporary files may survive an interrupt.");
    }

    let stdin = io::stdin();
    let mut console = LineConsole::new(stdin.lock(), io::stderr());
    let prompt = match args.prompt {
        Some(prompt) => prompt,
        None => console.read_prompt()?,
    };

    let workflow = GenerationWorkflow::new(
        Box::new(CatalogResolver::new(catalog, Arc::clone(&store))),
        Box::new(TempDirPreviewSink::new(!args.no_open)),
        Box::new(DirectoryPersistenceSink::new(&out_dir)),
        store,
        cleanup,
        events,
    )
    .with_config(WorkflowConfig {
        policy: RetryPolicy {
            max_retries: args.max_retries,
            ..RetryPolicy::default()
        },
        max_generations: args.max_generations,
    });

    console.notice(&format!(
        "Generating with {provider_id}. Approved images are saved to {}.",
        out_dir.display()
    ));
    let outcome = workflow.run(&prompt, &provider_id, &mut console);
    match &outcome {
        WorkflowOutcome::Completed(saved) => println!("{}", saved.path.display()),
        WorkflowOutcome::Cancelled => eprintln!("Cancelled. Nothing was saved."),
        WorkflowOutcome::Failed(failure) => {
            eprintln!("imagegate: {failure}");
            if let Some(detail) = failure.error.detail.as_deref() {
                eprintln!("  detail: {detail}");
            }
        }
    }
    Ok(outcome.exit_code())
}

fn run_providers(config_path: PathBuf) -> Result<i32> {
    let store = JsonConfigStore::new(config_path);
    let catalog = ProviderCatalog::default();
    let default_provider = resolve_provider(None, &store, &catalog);
    for spec in catalog.list() {
        let status = if !spec.requires_credential() {
            "ready (no credential needed)".to_string()
        } else if spec.has_credential(&store) {
            "ready".to_string()
        } else {
            format!("needs {}", spec.credential_hint())
        };
        let marker = if spec.id == default_provider { "*" } else { " " };
        println!(
            "{marker} {:<10} {:<18} deadline {:>3}s  {status}",
            spec.id,
            spec.display_name,
            spec.effective_deadline(&store).as_secs()
        );
    }
    Ok(0)
}

fn run_config(action: ConfigAction, config_path: PathBuf) -> Result<i32> {
    let store = JsonConfigStore::new(config_path);
    match action {
        ConfigAction::Get { key } => match store.get(&key) {
            Some(value) => {
                println!("{value}");
                Ok(0)
            }
            None => {
                eprintln!("{key} is not set");
                Ok(1)
            }
        },
        ConfigAction::Set { key, value } => {
            store.set(&key, &value)?;
            Ok(0)
        }
        ConfigAction::List => {
            for (key, value) in store.entries() {
                println!("{key} = {}", display_value(&key, &value));
            }
            Ok(0)
        }
        ConfigAction::Path => {
            println!("{}", store.path().display());
            Ok(0)
        }
    }
}

fn display_value(key: &str, value: &str) -> String {
    if !key.ends_with("_api_key") {
        return value.to_string();
    }
    let tail: String = value
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if value.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("****{tail}")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_output_dir(
    flag: Option<PathBuf>,
    env_value: Option<String>,
    store: &dyn KeyValueStore,
) -> PathBuf {
    flag.or_else(|| env_value.map(PathBuf::from))
        .or_else(|| {
            store
                .get(OUTPUT_DIR_KEY)
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
        })
        .or_else(|| dirs::picture_dir().map(|dir| dir.join("imagegate")))
        .unwrap_or_else(|| PathBuf::from("imagegate-output"))
}

fn resolve_provider(
    flag: Option<&str>,
    store: &dyn KeyValueStore,
    catalog: &ProviderCatalog,
) -> String {
    flag.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            store
                .get(LAST_PROVIDER_KEY)
                .filter(|value| !value.trim().is_empty())
        })
        .or_else(|| catalog.first_configured(store).map(|spec| spec.id.clone()))
        .unwrap_or_else(|| FALLBACK_PROVIDER.to_string())
}

/// Line-oriented review prompts. Questions go to `output`, never stdout, so
/// the saved path stays the only thing printed there.
struct LineConsole<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LineConsole<R, W> {
    fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, question: &str) -> Result<Option<String>> {
        write!(self.output, "{question}")?;
        self.output.flush()?;
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("failed reading from stdin")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    fn read_prompt(&mut self) -> Result<String> {
        loop {
            match self.ask("Prompt: ")? {
                Some(prompt) if !prompt.is_empty() => return Ok(prompt),
                Some(_) => continue,
                None => bail!("input closed before a prompt was entered"),
            }
        }
    }
}

impl<R: BufRead, W: Write> ReviewConsole for LineConsole<R, W> {
    fn decide(&mut self, _prompt: &str, preview: Option<&Path>) -> Result<Decision> {
        if let Some(preview) = preview {
            let _ = writeln!(self.output, "Preview: {}", preview.display());
        }
        loop {
            let Some(answer) = self.ask("Approve this image? [y/n]: ")? else {
                bail!("input closed before a decision was made");
            };
            match answer.to_ascii_lowercase().as_str() {
                "y" | "yes" | "approve" => return Ok(Decision::Approve),
                "n" | "no" | "reject" => return Ok(Decision::Reject),
                _ => {
                    let _ = writeln!(self.output, "Please answer y or n.");
                }
            }
        }
    }

    fn after_reject(&mut self, previous_prompt: &str) -> Result<RejectChoice> {
        loop {
            let Some(answer) = self.ask("Modify the prompt and retry, or cancel? [r/c]: ")? else {
                bail!("input closed before a decision was made");
            };
            match answer.to_ascii_lowercase().as_str() {
                "r" | "retry" => {
                    let question =
                        format!("New prompt (Enter keeps \"{previous_prompt}\"): ");
                    let Some(next_prompt) = self.ask(&question)? else {
                        bail!("input closed before a new prompt was entered");
                    };
                    return Ok(RejectChoice::Retry(next_prompt));
                }
                "c" | "cancel" => return Ok(RejectChoice::Cancel),
                _ => {
                    let _ = writeln!(self.output, "Please answer r or c.");
                }
            }
        }
    }

    fn notice(&mut self, message: &str) {
        let _ = writeln!(self.output, "{message}");
    }
}

/// Installs SIGINT/SIGTERM handlers on a dedicated thread. On delivery the
/// cleanup registry is flushed before the process exits with `128 + signal`.
fn spawn_signal_watcher(cleanup: Arc<CleanupRegistry>, events: EventWriter) -> Result<()> {
    let (ready_tx, ready_rx) = mpsc::channel::<io::Result<()>>();
    thread::Builder::new()
        .name("imagegate-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            if let Some(signal) = runtime.block_on(wait_for_signal(ready_tx)) {
                let code = handle_signal(signal, &cleanup, &events);
                std::process::exit(code);
            }
        })
        .context("failed to spawn signal thread")?;
    match ready_rx.recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err).context("failed to install signal handlers"),
        Err(_) => bail!("signal thread exited before installing handlers"),
    }
}

#[cfg(unix)]
async fn wait_for_signal(ready: mpsc::Sender<io::Result<()>>) -> Option<i32> {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = signal(SignalKind::interrupt())
        .and_then(|interrupt| signal(SignalKind::terminate()).map(|term| (interrupt, term)));
    let (mut interrupt, mut terminate) = match streams {
        Ok(streams) => streams,
        Err(err) => {
            let _ = ready.send(Err(err));
            return None;
        }
    };
    let _ = ready.send(Ok(()));
    tokio::select! {
        _ = interrupt.recv() => Some(SIGINT),
        _ = terminate.recv() => Some(SIGTERM),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal(ready: mpsc::Sender<io::Result<()>>) -> Option<i32> {
    let _ = ready.send(Ok(()));
    tokio::signal::ctrl_c().await.ok().map(|()| SIGINT)
}

fn handle_signal(signal: i32, cleanup: &CleanupRegistry, events: &EventWriter) -> i32 {
    let report = cleanup.flush();
    let _ = events.emit(
        "run_interrupted",
        json!({
            "signal": signal,
            "disposed": report.disposed,
            "failures": report.failures,
        })
        .as_object()
        .cloned()
        .unwrap_or_default(),
    );
    eprintln!(
        "\nInterrupted by signal {signal}; cleaned up {} temporary resource(s).",
        report.disposed
    );
    for failure in &report.failures {
        eprintln!("  cleanup problem: {failure}");
    }
    128 + signal
}
