//! Digest authentication, `SPEC_FULL.md` §4.2.
//!
//! Grounded on `examples/original_source/sipcore/auth.py`: nonce format
//! `hex(random 8 bytes) || decimal(now)`, HA1/HA2/expected formulas, and the
//! 401 header-echo set.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::message::{Method, SipMessage};
use crate::users::UserStore;

const DEFAULT_NONCE_LIFETIME_SECS: u64 = 300;

/// Server-minted nonces currently considered valid, keyed by nonce string,
/// valued by insertion time (unix seconds). Single-use is not enforced —
/// replay within the lifetime window is accepted (`SPEC_FULL.md` §4.2/§9).
pub struct NonceStore {
    realm: String,
    nonces: Mutex<HashMap<String, u64>>,
}

impl NonceStore {
    pub fn new(realm: impl Into<String>) -> NonceStore {
        NonceStore { realm: realm.into(), nonces: Mutex::new(HashMap::new()) }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    fn mint_nonce(&self) -> String {
        let mut bytes = [0u8; 8];
        rand::rng().fill_bytes(&mut bytes);
        let hex = bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>();
        let now = now_secs();
        format!("{}{}", hex, now)
    }

    fn insert(&self, nonce: &str) {
        let mut guard = self.nonces.lock().expect("nonce lock poisoned");
        guard.insert(nonce.to_string(), now_secs());
    }

    /// True if `nonce` was minted by us and is still within its lifetime.
    fn is_valid(&self, nonce: &str, lifetime_secs: u64) -> bool {
        let guard = self.nonces.lock().expect("nonce lock poisoned");
        match guard.get(nonce) {
            Some(&inserted) => now_secs().saturating_sub(inserted) <= lifetime_secs,
            None => false,
        }
    }

    /// Drops nonces older than `lifetime_secs`. Called by the timer service
    /// alongside the other periodic sweeps.
    pub fn sweep(&self, lifetime_secs: u64) {
        let now = now_secs();
        let mut guard = self.nonces.lock().expect("nonce lock poisoned");
        guard.retain(|_, &mut inserted| now.saturating_sub(inserted) <= lifetime_secs);
    }

    pub fn len(&self) -> usize {
        self.nonces.lock().expect("nonce lock poisoned").len()
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn md5_hex(s: &str) -> String {
    format!("{:x}", md5::compute(s.as_bytes()))
}

/// Builds a 401 response echoing Via/From/To/Call-ID/CSeq from `request`,
/// minting and storing a fresh nonce, and setting a To-tag if the request's
/// To header lacked one.
pub fn make_401(nonces: &NonceStore, request: &SipMessage) -> SipMessage {
    let nonce = nonces.mint_nonce();
    nonces.insert(&nonce);

    let mut resp = SipMessage::new_response(401, "Unauthorized");

    for via in request.headers.get_all("via") {
        resp.headers.push("via", via.clone());
    }
    resp.headers.set("from", request.headers.get_first("from").unwrap_or_default());

    let to = request.headers.get_first("to").unwrap_or_default().to_string();
    let to = if crate::uri::extract_header_param(&to, "tag").is_none() {
        format!("{};tag={}", to, uuid::Uuid::new_v4().simple())
    } else {
        to
    };
    resp.headers.set("to", to);

    resp.headers.set("call-id", request.call_id().unwrap_or_default());
    if let Some(cseq) = request.headers.get_first("cseq") {
        resp.headers.set("cseq", cseq.to_string());
    }
    resp.headers.set(
        "www-authenticate",
        format!(
            "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5, qop=\"auth\"",
            nonces.realm(),
            nonce
        ),
    );
    resp.headers.set("content-length", "0");
    resp
}

/// Parsed `Authorization: Digest ...` key/value pairs.
fn parse_digest_params(header_value: &str) -> Option<HashMap<String, String>> {
    let rest = header_value.trim();
    let rest = rest.strip_prefix("Digest").or_else(|| rest.strip_prefix("digest"))?;
    let mut map = HashMap::new();
    for part in split_digest_pairs(rest.trim()) {
        if let Some((k, v)) = part.split_once('=') {
            let v = v.trim().trim_matches('"');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    Some(map)
}

/// Splits on commas that are not inside a quoted string.
fn split_digest_pairs(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut current = String::new();
    for ch in s.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Verifies the `Authorization` header of `request` against `users`.
///
/// Absent/unparseable header, realm mismatch, unknown nonce, or an unknown/
/// non-ACTIVE user all fail silently — the caller is expected to respond
/// with a fresh 401 (`SPEC_FULL.md` §4.2).
pub fn check_digest(
    nonces: &NonceStore,
    users: &UserStore,
    request: &SipMessage,
    method: Method,
    nonce_lifetime_secs: u64,
) -> bool {
    let header = match request.headers.get_first("authorization") {
        Some(h) => h,
        None => return false,
    };
    let params = match parse_digest_params(header) {
        Some(p) => p,
        None => return false,
    };

    let username = match params.get("username") {
        Some(u) => u,
        None => return false,
    };
    let realm = match params.get("realm") {
        Some(r) => r,
        None => return false,
    };
    let nonce = match params.get("nonce") {
        Some(n) => n,
        None => return false,
    };
    let uri = match params.get("uri") {
        Some(u) => u,
        None => return false,
    };
    let response = match params.get("response") {
        Some(r) => r,
        None => return false,
    };

    if realm != nonces.realm() {
        return false;
    }
    if !nonces.is_valid(nonce, nonce_lifetime_secs) {
        return false;
    }

    let user = match users.get_user(username) {
        Some(u) if u.is_active() => u,
        _ => return false,
    };

    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, user.password));
    let ha2 = md5_hex(&format!("{}:{}", method.as_str(), uri));

    let expected = match params.get("qop") {
        Some(qop) => {
            let nc = params.get("nc").cloned().unwrap_or_default();
            let cnonce = params.get("cnonce").cloned().unwrap_or_default();
            md5_hex(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        }
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    };

    expected.eq_ignore_ascii_case(response)
}
