use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use imagegate_contracts::receipts::{
    receipt_path_for, write_receipt, SaveReceipt, RECEIPT_SCHEMA_VERSION,
};
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempDir};

use crate::GenerationResult;

const SLUG_MAX_CHARS: usize = 48;
const NAME_COLLISION_LIMIT: u32 = 100;

/// Ephemeral resource backing a preview. `dispose` may be called any number
/// of times; only the first call does work.
pub trait PreviewHandle: Send + Sync {
    fn location(&self) -> Option<PathBuf>;
    fn dispose(&self) -> Result<()>;

    /// Non-fatal problem worth telling the user (e.g. viewer did not start).
    fn warning(&self) -> Option<String> {
        None
    }
}

pub trait PreviewSink {
    /// Makes the image visible and returns right away.
    fn show(&self, image: &GenerationResult, prompt: &str) -> Result<Arc<dyn PreviewHandle>>;
}

/// Final destination for an approved image.
pub trait PersistenceSink {
    /// Writes the image exactly once. Observers never see a partial file.
    fn save(&self, image: GenerationResult, prompt: &str, generations: u32)
        -> Result<SavedArtifact>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifact {
    pub path: PathBuf,
    pub receipt_path: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Writes the image and a small HTML page into a fresh temp directory and
/// optionally opens the page in the platform viewer.
#[derive(Debug, Clone, Default)]
pub struct TempDirPreviewSink {
    open_viewer: bool,
    root: Option<PathBuf>,
}

impl TempDirPreviewSink {
    pub fn new(open_viewer: bool) -> Self {
        Self {
            open_viewer,
            root: None,
        }
    }

    /// Creates preview directories under `root` instead of the system temp dir.
    pub fn in_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }
}

impl PreviewSink for TempDirPreviewSink {
    fn show(&self, image: &GenerationResult, prompt: &str) -> Result<Arc<dyn PreviewHandle>> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("imagegate-preview-");
            builder
        };
        let dir = match self.root.as_ref() {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .context("failed to create preview directory")?;

        let image_name = format!(
            "preview.{}",
            extension_for_content_type(&image.content_type)
        );
        let image_path = dir.path().join(&image_name);
        fs::write(&image_path, &image.image_bytes)
            .with_context(|| format!("failed to write {}", image_path.display()))?;
        let page_path = dir.path().join("index.html");
        fs::write(
            &page_path,
            preview_page(prompt, &image.provider_id, &image_name),
        )
        .with_context(|| format!("failed to write {}", page_path.display()))?;

        let warning = if self.open_viewer {
            launch_viewer(&page_path)
                .err()
                .map(|err| format!("Could not open a viewer ({err}). Open {} manually.", page_path.display()))
        } else {
            None
        };

        Ok(Arc::new(TempDirPreview {
            dir: Mutex::new(Some(dir)),
            page_path,
            warning,
        }))
    }
}

struct TempDirPreview {
    dir: Mutex<Option<TempDir>>,
    page_path: PathBuf,
    warning: Option<String>,
}

impl PreviewHandle for TempDirPreview {
    fn location(&self) -> Option<PathBuf> {
        Some(self.page_path.clone())
    }

    fn dispose(&self) -> Result<()> {
        let taken = self
            .dir
            .lock()
            .map_err(|_| anyhow::anyhow!("preview handle lock poisoned"))?
            .take();
        let Some(dir) = taken else {
            return Ok(());
        };
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    fn warning(&self) -> Option<String> {
        self.warning.clone()
    }
}

fn launch_viewer(target: &Path) -> io::Result<()> {
    let mut command = if cfg!(target_os = "macos") {
        Command::new("open")
    } else if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.args(["/C", "start", ""]);
        command
    } else {
        Command::new("xdg-open")
    };
    command.arg(target);
    spawn_reaped(&mut command).map(|_reaper| ())
}

/// Starts `command` with null stdio and waits for it on a background thread
/// so the exited child never lingers as a zombie.
fn spawn_reaped(command: &mut Command) -> io::Result<JoinHandle<io::Result<ExitStatus>>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    thread::Builder::new()
        .name("imagegate-viewer".to_string())
        .spawn(move || child.wait())
}

fn preview_page(prompt: &str, provider_id: &str, image_name: &str) -> String {
    let prompt = escape_html(prompt);
    let provider_id = escape_html(provider_id);
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>imagegate preview</title>\
<style>body{{font-family:sans-serif;background:#111;color:#eee;margin:2rem}}img{{max-width:100%;max-height:80vh}}</style>\
</head><body><p><strong>{provider_id}</strong>: {prompt}</p><img src=\"{image_name}\" alt=\"{prompt}\">\
<p>Return to the terminal to approve or reject.</p></body></html>\n"
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Saves into one directory as `<prompt-slug>-<UTC stamp>.<ext>`, staged in a
/// temp file beside the target and renamed without clobbering.
#[derive(Debug, Clone)]
pub struct DirectoryPersistenceSink {
    dir: PathBuf,
    write_receipts: bool,
}

impl DirectoryPersistenceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_receipts: true,
        }
    }

    pub fn without_receipts(mut self) -> Self {
        self.write_receipts = false;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn persist(&self, staged: NamedTempFile, stem: &str, ext: &str) -> Result<PathBuf> {
        let mut staged = staged;
        for index in 1..=NAME_COLLISION_LIMIT {
            let name = if index == 1 {
                format!("{stem}.{ext}")
            } else {
                format!("{stem}-{index}.{ext}")
            };
            let target = self.dir.join(name);
            match staged.persist_noclobber(&target) {
                Ok(_) => return Ok(target),
                Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                    staged = err.file;
                }
                Err(err) => {
                    return Err(err.error)
                        .with_context(|| format!("failed to write {}", target.display()));
                }
            }
        }
        anyhow::bail!(
            "could not find a free file name for {stem}.{ext} in {}",
            self.dir.display()
        )
    }
}

impl PersistenceSink for DirectoryPersistenceSink {
    fn save(
        &self,
        image: GenerationResult,
        prompt: &str,
        generations: u32,
    ) -> Result<SavedArtifact> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let mut staged = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("failed to stage output in {}", self.dir.display()))?;
        staged
            .write_all(&image.image_bytes)
            .context("failed to write image bytes")?;
        staged.as_file().sync_all().context("failed to flush image bytes")?;

        let stem = format!(
            "{}-{}",
            prompt_slug(prompt),
            chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
        );
        let ext = extension_for_content_type(&image.content_type);
        let path = self.persist(staged, &stem, ext)?;

        let mut warnings = Vec::new();
        let receipt_path = if self.write_receipts {
            let receipt_path = receipt_path_for(&path);
            let receipt = SaveReceipt {
                schema_version: RECEIPT_SCHEMA_VERSION,
                prompt: prompt.to_string(),
                provider: image.provider_id.clone(),
                content_type: image.content_type.clone(),
                image_path: path.to_string_lossy().to_string(),
                byte_len: image.image_bytes.len() as u64,
                sha256: hex::encode(Sha256::digest(&image.image_bytes)),
                generations,
                saved_at: chrono::Utc::now()
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
            };
            match write_receipt(&receipt_path, &receipt) {
                Ok(()) => Some(receipt_path),
                Err(err) => {
                    warnings.push(format!("Receipt was not written: {err:#}"));
                    None
                }
            }
        } else {
            None
        };

        Ok(SavedArtifact {
            path,
            receipt_path,
            warnings,
        })
    }
}

/// Lowercase ASCII words of the prompt joined by `-`.
pub fn prompt_slug(prompt: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in prompt.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
            if slug.len() >= SLUG_MAX_CHARS {
                break;
            }
        } else {
            pending_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "image".to_string()
    } else {
        slug
    }
}

pub fn extension_for_content_type(content_type: &str) -> &'static str {
    let lowered = content_type.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("gif") {
        return "gif";
    }
    "png"
}
