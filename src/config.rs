//! Layered configuration store, `SPEC_FULL.md` §4.12/§4.12a.
//!
//! Grounded on `examples/original_source/config/config_manager.py`: a
//! lock-guarded JSON document, a `get`/`set`/`get_all`/`update_batch` API,
//! and a static per-key metadata table (`DYNAMIC_CONFIG`) describing which
//! keys are editable and whether changing them needs a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Metadata describing one dynamic configuration key. `validate` rejects a
/// proposed value before it is written to the cache/disk.
pub struct DynamicConfigEntry {
    pub key: &'static str,
    pub description: &'static str,
    pub editable: bool,
    pub restart_required: bool,
    pub validate: fn(&Value) -> bool,
}

fn is_bool(v: &Value) -> bool {
    v.is_boolean()
}
fn is_string(v: &Value) -> bool {
    v.is_string()
}
fn is_array(v: &Value) -> bool {
    v.is_array()
}
fn is_object(v: &Value) -> bool {
    v.is_object()
}
fn is_numeric_or_numeric_string(v: &Value) -> bool {
    v.is_u64() || v.as_str().map_or(false, |s| s.parse::<u64>().is_ok())
}

/// Mirrors the source's `DYNAMIC_CONFIG` dict: one entry per live-editable
/// key. `SERVER_IP`/`SERVER_PORT` are deliberately absent — they are static
/// per `SPEC_FULL.md` §4.12 and are rejected by [`ConfigStore::set`].
pub const DYNAMIC_CONFIG: &[DynamicConfigEntry] = &[
    DynamicConfigEntry {
        key: "LOG_LEVEL",
        description: "Logger threshold (trace/debug/info/warn/error)",
        editable: true,
        restart_required: false,
        validate: is_string,
    },
    DynamicConfigEntry {
        key: "FORCE_LOCAL_ADDR",
        description: "Rewrite response Contact host to loopback (debug single-host mode)",
        editable: true,
        restart_required: false,
        validate: is_bool,
    },
    DynamicConfigEntry {
        key: "LOCAL_NETWORKS",
        description: "CIDR list consulted during response NAT decisions",
        editable: true,
        restart_required: false,
        validate: is_array,
    },
    DynamicConfigEntry {
        key: "USERS",
        description: "In-memory user map override (unused; the user store is authoritative)",
        editable: true,
        restart_required: false,
        validate: is_object,
    },
    DynamicConfigEntry {
        key: "CDR_MERGE_MODE",
        description: "Whether new CDR records use merge-and-flush semantics",
        editable: true,
        restart_required: false,
        validate: is_bool,
    },
    DynamicConfigEntry {
        key: "DROP_REFLECTED_ERRORS",
        description: "Silently drop 482/483/502/503/504 on the response path instead of relaying",
        editable: true,
        restart_required: false,
        validate: is_bool,
    },
    DynamicConfigEntry {
        key: "CANCEL_REUSE_BRANCH",
        description: "Reuse the INVITE's Via branch when forwarding its CANCEL",
        editable: true,
        restart_required: false,
        validate: is_bool,
    },
    DynamicConfigEntry {
        key: "NONCE_LIFETIME_SECS",
        description: "Bounded lifetime for server-minted digest nonces",
        editable: true,
        restart_required: false,
        validate: is_numeric_or_numeric_string,
    },
];

fn find_entry(key: &str) -> Option<&'static DynamicConfigEntry> {
    DYNAMIC_CONFIG.iter().find(|e| e.key == key)
}

/// Static fields set once at process start; changing them requires a restart
/// (`SPEC_FULL.md` §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub realm: String,
    #[serde(default = "default_cdr_base")]
    pub cdr_base_dir: PathBuf,
    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,
}

fn default_cdr_base() -> PathBuf {
    PathBuf::from("CDR")
}
fn default_users_file() -> PathBuf {
    PathBuf::from("data/users.json")
}

impl Default for StaticConfig {
    fn default() -> Self {
        StaticConfig {
            server_ip: "0.0.0.0".to_string(),
            server_port: 5060,
            realm: "sip.local".to_string(),
            cdr_base_dir: default_cdr_base(),
            users_file: default_users_file(),
        }
    }
}

struct Inner {
    path: PathBuf,
    static_config: StaticConfig,
    dynamic: HashMap<String, Value>,
}

/// JSON-backed config store. `get`/`set` operate on the dynamic key space;
/// static fields are read through dedicated accessors.
pub struct ConfigStore {
    inner: Mutex<Inner>,
    log_reload: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl ConfigStore {
    /// Loads from `path` if it exists, else seeds in-memory defaults
    /// (persisted on first `set`).
    pub fn load(path: impl AsRef<Path>) -> Result<ConfigStore> {
        let path = path.as_ref().to_path_buf();
        let (static_config, dynamic) = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let doc: Value = serde_json::from_str(&text)?;
            let static_config: StaticConfig =
                serde_json::from_value(doc.clone()).unwrap_or_default();
            let mut dynamic = HashMap::new();
            if let Value::Object(map) = doc {
                for entry in DYNAMIC_CONFIG {
                    if let Some(v) = map.get(entry.key) {
                        dynamic.insert(entry.key.to_string(), v.clone());
                    }
                }
            }
            (static_config, dynamic)
        } else {
            (StaticConfig::default(), default_dynamic_values())
        };

        Ok(ConfigStore {
            inner: Mutex::new(Inner { path, static_config, dynamic }),
            log_reload: Mutex::new(None),
        })
    }

    /// Registers a callback fired with the new value whenever `LOG_LEVEL`
    /// changes through `set`/`update_batch`, so the caller can reload a
    /// `tracing_subscriber` filter without a restart (`SPEC_FULL.md` §4.12/§4.14).
    pub fn on_log_level_change(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        *self.log_reload.lock().expect("config lock poisoned") = Some(Box::new(f));
    }

    pub fn static_config(&self) -> StaticConfig {
        self.inner.lock().expect("config lock poisoned").static_config.clone()
    }

    /// Reads a dynamic key, falling back to its documented default if unset.
    pub fn get(&self, key: &str) -> Option<Value> {
        let inner = self.inner.lock().expect("config lock poisoned");
        inner.dynamic.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn get_all(&self) -> HashMap<String, Value> {
        self.inner.lock().expect("config lock poisoned").dynamic.clone()
    }

    /// Sets a dynamic key, validating it against [`DYNAMIC_CONFIG`] and
    /// persisting immediately. Logs the old -> new transition at `info`
    /// level, matching the source's `config_manager.py::set`.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let entry = find_entry(key).ok_or_else(|| Error::ConfigKeyRejected(key.to_string()))?;
        if !entry.editable || !(entry.validate)(&value) {
            return Err(Error::ConfigKeyRejected(key.to_string()));
        }

        let mut inner = self.inner.lock().expect("config lock poisoned");
        let old = inner.dynamic.get(key).cloned();
        tracing::info!(key, ?old, new = ?value, "config value changed");
        inner.dynamic.insert(key.to_string(), value.clone());
        self.persist_locked(&inner)?;
        drop(inner);

        if key == "LOG_LEVEL" {
            if let Some(level) = value.as_str() {
                if let Some(cb) = self.log_reload.lock().expect("config lock poisoned").as_ref() {
                    cb(level);
                }
            }
        }
        Ok(())
    }

    pub fn update_batch(&self, updates: HashMap<String, Value>) -> Result<()> {
        for (k, v) in updates {
            self.set(&k, v)?;
        }
        Ok(())
    }

    fn persist_locked(&self, inner: &Inner) -> Result<()> {
        if let Some(parent) = inner.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut doc = serde_json::to_value(&inner.static_config)?;
        if let Value::Object(map) = &mut doc {
            for (k, v) in &inner.dynamic {
                map.insert(k.clone(), v.clone());
            }
        }
        let text = serde_json::to_string_pretty(&doc)?;
        std::fs::write(&inner.path, text)?;
        Ok(())
    }
}

fn default_dynamic_values() -> HashMap<String, Value> {
    let mut m = HashMap::new();
    m.insert("LOG_LEVEL".to_string(), Value::String("info".to_string()));
    m.insert("FORCE_LOCAL_ADDR".to_string(), Value::Bool(false));
    m.insert("LOCAL_NETWORKS".to_string(), Value::Array(vec![]));
    m.insert("CDR_MERGE_MODE".to_string(), Value::Bool(true));
    m.insert("DROP_REFLECTED_ERRORS".to_string(), Value::Bool(false));
    m.insert("CANCEL_REUSE_BRANCH".to_string(), Value::Bool(true));
    m.insert("NONCE_LIFETIME_SECS".to_string(), Value::Number(300.into()));
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn defaults_without_file() {
        let dir = std::env::temp_dir().join(format!("cfgtest-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.get_bool("FORCE_LOCAL_ADDR", true), false);
        assert_eq!(store.get_bool("CANCEL_REUSE_BRANCH", false), true);
    }

    #[test]
    fn set_persists_and_reloads() {
        let dir = std::env::temp_dir().join(format!("cfgtest-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let store = ConfigStore::load(&path).unwrap();
        store.set("FORCE_LOCAL_ADDR", Value::Bool(true)).unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.get_bool("FORCE_LOCAL_ADDR", false), true);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_unknown_key() {
        let dir = std::env::temp_dir().join(format!("cfgtest-{}", uuid::Uuid::new_v4()));
        let store = ConfigStore::load(dir.join("config.json")).unwrap();
        assert!(store.set("NOT_A_KEY", Value::Bool(true)).is_err());
    }

    #[test]
    fn log_level_change_invokes_registered_callback() {
        let dir = std::env::temp_dir().join(format!("cfgtest-{}", uuid::Uuid::new_v4()));
        let store = ConfigStore::load(dir.join("config.json")).unwrap();
        let seen: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        store.on_log_level_change(move |level| {
            *seen_clone.lock().unwrap() = Some(level.to_string());
        });

        store.set("LOG_LEVEL", Value::String("debug".to_string())).unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("debug"));
    }

    #[test]
    fn rejects_wrong_type() {
        let dir = std::env::temp_dir().join(format!("cfgtest-{}", uuid::Uuid::new_v4()));
        let store = ConfigStore::load(dir.join("config.json")).unwrap();
        assert!(store.set("FORCE_LOCAL_ADDR", Value::String("yes".to_string())).is_err());
    }
}
