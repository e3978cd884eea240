use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::models::{PanelSettings, Preset};

pub const PRESETS_FILE: &str = "user_presets.json";
pub const SETTINGS_FILE: &str = "user_settings.json";
/// Cap on name suggestions returned for a search.
pub const MAX_SUGGESTIONS: usize = 25;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whole-document key-value persistence.
pub trait KeyValueStore: Send + Sync {
    fn load(&self) -> Map<String, Value>;
    fn save(&self, data: &Map<String, Value>) -> Result<(), StoreError>;
}

/// Pretty-printed JSON file. A missing file is created empty; an unreadable
/// one is logged and treated as empty.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Map<String, Value>, StoreError> {
        if !self.path.exists() {
            let empty = Map::new();
            self.save(&empty)?;
            info!("📁 Created {}", self.path.display());
            return Ok(empty);
        }
        let text = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl KeyValueStore for JsonFileStore {
    fn load(&self) -> Map<String, Value> {
        self.read().unwrap_or_else(|e| {
            error!("❌ Error loading {}: {}", self.path.display(), e);
            Map::new()
        })
    }

    fn save(&self, data: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(data)?)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<Map<String, Value>>,
}

impl KeyValueStore for MemoryStore {
    fn load(&self) -> Map<String, Value> {
        self.data.read().clone()
    }

    fn save(&self, data: &Map<String, Value>) -> Result<(), StoreError> {
        *self.data.write() = data.clone();
        Ok(())
    }
}

/// Presets keyed by user id, then by preset name.
#[derive(Clone)]
pub struct PresetBook {
    store: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
}

impl PresetBook {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store, write_lock: Arc::default() }
    }

    pub fn list(&self, user: &str) -> Vec<(String, Preset)> {
        let data = self.store.load();
        let Some(Value::Object(presets)) = data.get(user) else { return Vec::new() };
        presets
            .iter()
            .filter_map(|(name, value)| {
                let preset = serde_json::from_value(value.clone()).ok()?;
                Some((name.clone(), preset))
            })
            .collect()
    }

    pub fn get(&self, user: &str, name: &str) -> Option<Preset> {
        let data = self.store.load();
        let value = data.get(user)?.get(name)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Names containing `query`, case-insensitively.
    pub fn search(&self, user: &str, query: &str) -> Vec<String> {
        let needle = query.to_lowercase();
        self.list(user)
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| name.to_lowercase().contains(&needle))
            .take(MAX_SUGGESTIONS)
            .collect()
    }

    pub fn save(&self, user: &str, name: &str, preset: &Preset) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut data = self.store.load();
        let entry = data.entry(user.to_string()).or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(presets) = entry {
            presets.insert(name.to_string(), serde_json::to_value(preset)?);
        }
        self.store.save(&data)
    }

    /// Returns `false` when there was nothing to delete.
    pub fn delete(&self, user: &str, name: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let mut data = self.store.load();
        let removed = match data.get_mut(user) {
            Some(Value::Object(presets)) => presets.remove(name).is_some(),
            _ => false,
        };
        if removed {
            self.store.save(&data)?;
        }
        Ok(removed)
    }
}

/// Panel settings keyed by user id.
#[derive(Clone)]
pub struct SettingsBook {
    store: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
}

impl SettingsBook {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store, write_lock: Arc::default() }
    }

    /// Stored settings, or defaults that are persisted on first access.
    pub fn get_or_create(&self, user: &str) -> Result<PanelSettings, StoreError> {
        let _guard = self.write_lock.lock();
        let mut data = self.store.load();
        if let Some(value) = data.get(user) {
            if let Ok(settings) = serde_json::from_value(value.clone()) {
                return Ok(settings);
            }
        }
        let settings = PanelSettings::default();
        data.insert(user.to_string(), serde_json::to_value(&settings)?);
        self.store.save(&data)?;
        Ok(settings)
    }

    pub fn save(&self, user: &str, settings: &PanelSettings) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut data = self.store.load();
        data.insert(user.to_string(), serde_json::to_value(settings)?);
        self.store.save(&data)
    }
}
