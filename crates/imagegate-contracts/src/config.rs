use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use serde_json::{Map, Value};

pub const LAST_PROVIDER_KEY: &str = "last_provider";
pub const OUTPUT_DIR_KEY: &str = "output_dir";
pub const CONFIG_ENV: &str = "IMAGEGATE_CONFIG";

pub fn api_key_key(provider_id: &str) -> String {
    format!("{provider_id}_api_key")
}

pub fn deadline_key(provider_id: &str) -> String {
    format!("{provider_id}_deadline_secs")
}

/// Flat string key-value settings. Implementations synchronize internally so
/// one store can be shared between the provider resolver and the workflow.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// `$IMAGEGATE_CONFIG`, else `<config dir>/imagegate/config.json`.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var(CONFIG_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("imagegate")
        .join("config.json")
}

/// JSON object on disk. Every read re-loads the file; every write merges the
/// one changed key into what is currently on disk and replaces the file.
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        read_json_object(&self.path)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, value)| value_as_text(&value).map(|text| (key, text)))
            .collect()
    }
}

impl KeyValueStore for JsonConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        let payload = read_json_object(&self.path)?;
        payload.get(key).and_then(value_as_text)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("config store lock poisoned"))?;
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if on_disk.get(key).and_then(Value::as_str) == Some(value) {
            return Ok(());
        }
        on_disk.insert(key.to_string(), Value::String(value.to_string()));
        write_json_object(&self.path, &on_disk)
    }
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let values = entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Self {
            values: Mutex::new(values),
        }
    }
}

impl KeyValueStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow::anyhow!("config store lock poisoned"))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let mut staged = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage config in {}", parent.display()))?;
    staged.write_all(serde_json::to_string_pretty(&Value::Object(payload.clone()))?.as_bytes())?;
    staged
        .persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
