use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::Result;

pub const KEY_DEVICE_PROFILE: &str = "device_profile";
pub const KEY_FIRST_RUN_DONE: &str = "first_run_done";
pub const KEY_LEAKAGE: &str = "leakage";

pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
}

pub fn load<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Option<T> {
    let raw = store.get(key)?;
    match serde_json::from_value(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, "ignoring unreadable stored value: {e}");
            None
        }
    }
}

pub fn save<T: Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    store.set(key, serde_json::to_value(value)?)
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text)?,
            Ok(_) => BTreeMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }
}

impl Store for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let text = {
            let Ok(mut values) = self.values.lock() else {
                return Ok(());
            };
            values.insert(key.to_string(), value);
            serde_json::to_string_pretty(&*values)?
        };
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
