//! Transaction/dialog bookkeeping maps, `SPEC_FULL.md` §3/§4.5.
//!
//! Three tables, each owned by the routing engine and guarded by its own
//! lock per `SPEC_FULL.md` §5: `PendingRequests`, `Dialogs`, `InviteBranches`.
//! A tokio `Instant` is stamped on each entry so the timer sweeps (§4.6) can
//! age them out without a separate side table — simpler than the source's
//! first-seen-timestamp dict since we own insertion here directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct DialogEndpoints {
    pub caller: SocketAddr,
    pub callee: SocketAddr,
}

struct Entry<T> {
    value: T,
    inserted_at: Instant,
}

pub struct PendingRequests {
    map: Mutex<HashMap<String, Entry<SocketAddr>>>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        PendingRequests { map: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, call_id: &str, originator: SocketAddr) {
        let mut guard = self.map.lock().expect("pending lock poisoned");
        guard.insert(call_id.to_string(), Entry { value: originator, inserted_at: Instant::now() });
    }

    pub fn get(&self, call_id: &str) -> Option<SocketAddr> {
        self.map.lock().expect("pending lock poisoned").get(call_id).map(|e| e.value)
    }

    pub fn remove(&self, call_id: &str) -> Option<SocketAddr> {
        self.map.lock().expect("pending lock poisoned").remove(call_id).map(|e| e.value)
    }

    pub fn sweep_older_than(&self, max_age: std::time::Duration) {
        let now = Instant::now();
        let mut guard = self.map.lock().expect("pending lock poisoned");
        guard.retain(|_, e| now.duration_since(e.inserted_at) <= max_age);
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("pending lock poisoned").len()
    }
}

pub struct Dialogs {
    map: Mutex<HashMap<String, Entry<DialogEndpoints>>>,
}

impl Default for Dialogs {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialogs {
    pub fn new() -> Self {
        Dialogs { map: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, call_id: &str, endpoints: DialogEndpoints) {
        let mut guard = self.map.lock().expect("dialogs lock poisoned");
        guard.insert(call_id.to_string(), Entry { value: endpoints, inserted_at: Instant::now() });
    }

    pub fn get(&self, call_id: &str) -> Option<DialogEndpoints> {
        self.map.lock().expect("dialogs lock poisoned").get(call_id).map(|e| e.value)
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.map.lock().expect("dialogs lock poisoned").contains_key(call_id)
    }

    pub fn remove(&self, call_id: &str) -> Option<DialogEndpoints> {
        self.map.lock().expect("dialogs lock poisoned").remove(call_id).map(|e| e.value)
    }

    /// Refreshes the liveness timestamp without changing endpoints (e.g. on
    /// receiving an in-dialog request), so idle-only dialogs age out.
    pub fn touch(&self, call_id: &str) {
        let mut guard = self.map.lock().expect("dialogs lock poisoned");
        if let Some(e) = guard.get_mut(call_id) {
            e.inserted_at = Instant::now();
        }
    }

    pub fn sweep_older_than(&self, max_age: std::time::Duration) {
        let now = Instant::now();
        let mut guard = self.map.lock().expect("dialogs lock poisoned");
        guard.retain(|_, e| now.duration_since(e.inserted_at) <= max_age);
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("dialogs lock poisoned").len()
    }
}

pub struct InviteBranches {
    map: Mutex<HashMap<String, Entry<String>>>,
}

impl Default for InviteBranches {
    fn default() -> Self {
        Self::new()
    }
}

impl InviteBranches {
    pub fn new() -> Self {
        InviteBranches { map: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, call_id: &str, branch: impl Into<String>) {
        let mut guard = self.map.lock().expect("branches lock poisoned");
        guard.insert(call_id.to_string(), Entry { value: branch.into(), inserted_at: Instant::now() });
    }

    pub fn get(&self, call_id: &str) -> Option<String> {
        self.map.lock().expect("branches lock poisoned").get(call_id).map(|e| e.value.clone())
    }

    pub fn remove(&self, call_id: &str) -> Option<String> {
        self.map.lock().expect("branches lock poisoned").remove(call_id).map(|e| e.value)
    }

    pub fn sweep_older_than(&self, max_age: std::time::Duration) {
        let now = Instant::now();
        let mut guard = self.map.lock().expect("branches lock poisoned");
        guard.retain(|_, e| now.duration_since(e.inserted_at) <= max_age);
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("branches lock poisoned").len()
    }
}
