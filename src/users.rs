//! User store, `SPEC_FULL.md` §4.13.
//!
//! Grounded on `examples/original_source/sipcore/user_manager.py`: a JSON
//! document reloaded by comparing mtime (and content, to skip needless
//! reparses), bootstrap default users `1001`/`1002` on first run, and a
//! fixed allow-list of mutable fields for `modify_user`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    pub status: UserStatus,
    #[serde(default)]
    pub service_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

const MUTABLE_FIELDS: &[&str] =
    &["password", "display_name", "phone", "email", "status", "service_type"];

struct Inner {
    path: PathBuf,
    users: HashMap<String, User>,
    last_mtime: Option<SystemTime>,
}

pub struct UserStore {
    inner: Mutex<Inner>,
}

impl UserStore {
    /// Loads from `path`. If absent, bootstraps two default users (`1001`,
    /// password `1001`, BASIC; `1002`, password `1002`, PREMIUM) and writes
    /// the file, mirroring `_create_default_users` in the source.
    pub fn load(path: impl Into<PathBuf>) -> Result<UserStore> {
        let path = path.into();
        let store = UserStore {
            inner: Mutex::new(Inner { path: path.clone(), users: HashMap::new(), last_mtime: None }),
        };
        {
            let mut inner = store.inner.lock().expect("user store lock poisoned");
            if path.exists() {
                reload_locked(&mut inner)?;
            } else {
                inner.users = default_users();
                persist_locked(&inner)?;
                inner.last_mtime = mtime_of(&inner.path);
            }
        }
        Ok(store)
    }

    /// Reloads if the file's mtime advanced and the parsed content differs
    /// from what's cached. Called on every `get_all_users`, matching the
    /// source's hot-reload-on-read behaviour.
    pub fn get_all_users(&self, status_filter: Option<UserStatus>) -> Vec<User> {
        let mut inner = self.inner.lock().expect("user store lock poisoned");
        maybe_reload(&mut inner);
        inner
            .users
            .values()
            .filter(|u| status_filter.map(|s| u.status == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Looks up a single user, reloading once if not initially found (so a
    /// user added externally while the process runs becomes visible without
    /// a restart).
    pub fn get_user(&self, username: &str) -> Option<User> {
        let mut inner = self.inner.lock().expect("user store lock poisoned");
        if let Some(u) = inner.users.get(username) {
            return Some(u.clone());
        }
        maybe_reload(&mut inner);
        inner.users.get(username).cloned()
    }

    pub fn user_count(&self) -> usize {
        let mut inner = self.inner.lock().expect("user store lock poisoned");
        maybe_reload(&mut inner);
        inner.users.len()
    }

    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        match self.get_user(username) {
            Some(u) => u.password == password && u.is_active(),
            None => false,
        }
    }

    pub fn add_user(&self, mut user: User) -> Result<()> {
        let mut inner = self.inner.lock().expect("user store lock poisoned");
        let now = Utc::now();
        user.created_at = now;
        user.updated_at = now;
        inner.users.insert(user.username.clone(), user);
        persist_locked(&inner)?;
        inner.last_mtime = mtime_of(&inner.path);
        Ok(())
    }

    pub fn delete_user(&self, username: &str) -> Result<bool> {
        let mut inner = self.inner.lock().expect("user store lock poisoned");
        let removed = inner.users.remove(username).is_some();
        if removed {
            persist_locked(&inner)?;
            inner.last_mtime = mtime_of(&inner.path);
        }
        Ok(removed)
    }

    /// Applies `updates` (field -> JSON value) against [`MUTABLE_FIELDS`]
    /// only; unknown fields are ignored, matching the source's allow-list.
    pub fn modify_user(&self, username: &str, updates: HashMap<String, serde_json::Value>) -> Result<bool> {
        let mut inner = self.inner.lock().expect("user store lock poisoned");
        let Some(user) = inner.users.get_mut(username) else {
            return Ok(false);
        };
        for (field, value) in updates {
            if !MUTABLE_FIELDS.contains(&field.as_str()) {
                continue;
            }
            apply_field(user, &field, value);
        }
        user.updated_at = Utc::now();
        persist_locked(&inner)?;
        inner.last_mtime = mtime_of(&inner.path);
        Ok(true)
    }
}

fn apply_field(user: &mut User, field: &str, value: serde_json::Value) {
    match field {
        "password" => {
            if let Some(s) = value.as_str() {
                user.password = s.to_string();
            }
        }
        "display_name" => {
            if let Some(s) = value.as_str() {
                user.display_name = s.to_string();
            }
        }
        "phone" => {
            if let Some(s) = value.as_str() {
                user.phone = s.to_string();
            }
        }
        "email" => {
            if let Some(s) = value.as_str() {
                user.email = s.to_string();
            }
        }
        "service_type" => {
            if let Some(s) = value.as_str() {
                user.service_type = s.to_string();
            }
        }
        "status" => {
            if let Some(s) = value.as_str() {
                user.status = match s.to_ascii_uppercase().as_str() {
                    "ACTIVE" => UserStatus::Active,
                    "INACTIVE" => UserStatus::Inactive,
                    "SUSPENDED" => UserStatus::Suspended,
                    _ => user.status,
                };
            }
        }
        _ => {}
    }
}

fn default_users() -> HashMap<String, User> {
    let now = Utc::now();
    let mut m = HashMap::new();
    m.insert(
        "1001".to_string(),
        User {
            username: "1001".to_string(),
            password: "1001".to_string(),
            display_name: String::new(),
            phone: String::new(),
            email: String::new(),
            status: UserStatus::Active,
            service_type: "BASIC".to_string(),
            created_at: now,
            updated_at: now,
        },
    );
    m.insert(
        "1002".to_string(),
        User {
            username: "1002".to_string(),
            password: "1002".to_string(),
            display_name: String::new(),
            phone: String::new(),
            email: String::new(),
            status: UserStatus::Active,
            service_type: "PREMIUM".to_string(),
            created_at: now,
            updated_at: now,
        },
    );
    m
}

fn mtime_of(path: &PathBuf) -> Option<SystemTime> {
    fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

fn maybe_reload(inner: &mut Inner) {
    let current = mtime_of(&inner.path);
    if current.is_some() && current != inner.last_mtime {
        if let Err(err) = reload_locked(inner) {
            tracing::warn!(error = %err, "failed to reload user store");
        }
    }
}

fn reload_locked(inner: &mut Inner) -> Result<()> {
    let text = fs::read_to_string(&inner.path)?;
    let users: HashMap<String, User> = serde_json::from_str(&text)?;
    inner.users = users;
    inner.last_mtime = mtime_of(&inner.path);
    Ok(())
}

fn persist_locked(inner: &Inner) -> Result<()> {
    if let Some(parent) = inner.path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let text = serde_json::to_string_pretty(&inner.users)?;
    fs::write(&inner.path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("userstest-{}", uuid::Uuid::new_v4())).join("users.json")
    }

    #[test]
    fn bootstraps_default_users() {
        let store = UserStore::load(temp_path()).unwrap();
        assert_eq!(store.user_count(), 2);
        assert!(store.authenticate("1001", "1001"));
        assert!(store.authenticate("1002", "1002"));
    }

    #[test]
    fn inactive_user_fails_authenticate() {
        let store = UserStore::load(temp_path()).unwrap();
        let mut updates = HashMap::new();
        updates.insert("status".to_string(), serde_json::Value::String("SUSPENDED".to_string()));
        store.modify_user("1001", updates).unwrap();
        assert!(!store.authenticate("1001", "1001"));
    }

    #[test]
    fn delete_user_removes_entry() {
        let store = UserStore::load(temp_path()).unwrap();
        assert!(store.delete_user("1001").unwrap());
        assert!(store.get_user("1001").is_none());
    }

    #[test]
    fn modify_user_ignores_unknown_fields() {
        let store = UserStore::load(temp_path()).unwrap();
        let mut updates = HashMap::new();
        updates.insert("username".to_string(), serde_json::Value::String("hacked".to_string()));
        store.modify_user("1001", updates).unwrap();
        assert_eq!(store.get_user("1001").unwrap().username, "1001");
    }
}
